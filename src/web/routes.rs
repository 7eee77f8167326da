use super::handlers;
use super::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

pub fn public_routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(handlers::api::health))
}

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/deliveries/:id", get(handlers::api::get_delivery))
        .route("/api/v1/events", post(handlers::api::submit_event))
}
