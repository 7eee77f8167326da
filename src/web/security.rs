use crate::services::rate_limit::{RateLimitDecision, RateLimiter};
use crate::web::extractors::TenantKey;
use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json};
use chrono::Utc;
use std::sync::Arc;

pub const TENANT_HEADER: &str = "x-tenant-id";

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

pub fn security_headers<B>(mut response: Response<B>) -> Response<B> {
    let headers = response.headers_mut();

    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));

    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));

    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));

    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );

    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    response
}

pub async fn apply_security_headers(request: Request<Body>, next: Next) -> Response<Body> {
    let response = next.run(request).await;
    security_headers(response)
}

/// Copy `X-Tenant-Id` into a [`TenantKey`]. Only mounted when the gateway in
/// front of us authenticates callers and owns that header.
pub async fn tenant_from_header(mut request: Request<Body>, next: Next) -> Response<Body> {
    let tenant = request
        .headers()
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    if let Some(tenant) = tenant {
        request.extensions_mut().insert(TenantKey(tenant));
    }
    next.run(request).await
}

/// Enforce the per-tenant limit for the matched route. Anonymous requests
/// pass through untouched.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let tenant = match request.extensions().get::<TenantKey>() {
        Some(TenantKey(key)) if !key.is_empty() => key.clone(),
        _ => return next.run(request).await,
    };
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let now = Utc::now();
    let decision = limiter.allow_at(Some(&tenant), &path, now);

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        let retry_after = decision.retry_after_secs(now);
        tracing::warn!(tenant = %tenant, path = %path, retry_after, "Rate limit exceeded");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "Too Many Requests",
                "message": "Rate limit exceeded. Please try again later.",
                "retry_after": retry_after,
            })),
        )
            .into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        response
    };

    insert_rate_limit_headers(response.headers_mut(), &decision);
    response
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(decision.reset_at.timestamp()),
    );
}
