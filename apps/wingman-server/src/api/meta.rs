use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use tracing::info;

use crate::app_state::AppState;
use crate::hardware;

#[utoipa::path(
    get,
    path = "/api/health",
    tag = "Meta",
    responses((status = 200, description = "Service is alive", body = serde_json::Value))
)]
pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

#[utoipa::path(
    get,
    path = "/api/hardware",
    tag = "Meta",
    responses((status = 200, description = "GPU/CPU memory probe", body = serde_json::Value))
)]
pub async fn hardware() -> impl IntoResponse {
    Json(hardware::probe())
}

#[utoipa::path(
    get,
    path = "/api/shutdown",
    tag = "Meta",
    responses((status = 200, description = "Clean shutdown requested", body = serde_json::Value))
)]
pub async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    info!(target: "wingman::api", "shutdown requested over http");
    state.request_shutdown();
    Json(json!({"message": "Shutting down"}))
}
