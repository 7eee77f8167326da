use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Authenticated tenant key, inserted as a request extension by whatever
/// authenticates the caller. Requests without one are anonymous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantKey(pub String);

/// The caller's tenant id. Rejects anonymous callers with 401.
pub struct CurrentTenant(pub Uuid);

impl<S> FromRequestParts<S> for CurrentTenant
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        _state: &'life1 S,
    ) -> Pin<Box<dyn Future<Output = Result<Self, Self::Rejection>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        let tenant = parts
            .extensions
            .get::<TenantKey>()
            .ok_or(StatusCode::UNAUTHORIZED)
            .and_then(|key| key.0.parse::<Uuid>().map_err(|_| StatusCode::UNAUTHORIZED))
            .map(CurrentTenant);
        Box::pin(async move { tenant })
    }
}
