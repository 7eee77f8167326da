use crate::services::queue;
use crate::web::error::AppResult;
use crate::web::extractors::CurrentTenant;
use crate::web::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct SubmitEventRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

fn json_single(data: serde_json::Value) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "data": data,
    }))
}

fn json_error(status: StatusCode, error: &str, msg: &str) -> Response {
    let body = serde_json::json!({
        "error": error,
        "message": msg,
    });
    (status, Json(body)).into_response()
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/v1/deliveries/:id
pub async fn get_delivery(
    State(state): State<Arc<AppState>>,
    CurrentTenant(tenant_id): CurrentTenant,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    match queue::get_job_for_tenant(&state.db, id, tenant_id)? {
        Some(job) => Ok(json_single(serde_json::to_value(&job)?).into_response()),
        None => Ok(json_error(
            StatusCode::NOT_FOUND,
            "Not Found",
            "Delivery not found",
        )),
    }
}

/// POST /api/v1/events
pub async fn submit_event(
    State(state): State<Arc<AppState>>,
    CurrentTenant(tenant_id): CurrentTenant,
    Json(request): Json<SubmitEventRequest>,
) -> Response {
    let event_type = request.event_type.trim();
    if event_type.is_empty() {
        return json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Unprocessable Entity",
            "Event type must not be empty",
        );
    }

    match state.events.submit(tenant_id, event_type, request.data) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "accepted" })),
        )
            .into_response(),
        Err(e) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable",
            &e.to_string(),
        ),
    }
}
