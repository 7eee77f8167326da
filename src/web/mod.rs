mod error;
pub mod extractors;
mod handlers;
mod routes;
pub mod security;
mod state;

pub use extractors::TenantKey;
pub use state::AppState;

use anyhow::Result;
use axum::middleware;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// The webhook and rate-limit HTTP surface. `/api` routes are rate limited
/// per tenant; `/health` is not.
pub fn router(state: Arc<AppState>) -> Router {
    let api = routes::api_routes().route_layer(middleware::from_fn_with_state(
        state.rate_limiter.clone(),
        security::rate_limit_middleware,
    ));

    let mut app = Router::new().merge(routes::public_routes()).merge(api);
    if state.config.server.trust_tenant_header {
        app = app.layer(middleware::from_fn(security::tenant_from_header));
    }

    app.layer(middleware::from_fn(security::apply_security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, addr: &str, cancel: CancellationToken) -> Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}
