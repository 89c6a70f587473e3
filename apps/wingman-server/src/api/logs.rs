use axum::{response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

/// Client-submitted log line forwarded to the structured sink.
#[derive(Debug, Deserialize)]
pub struct LogItem {
    #[serde(default)]
    pub level: Option<String>,
    pub message: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/utils/log",
    tag = "Utils",
    responses((status = 200, description = "Accepted", body = serde_json::Value))
)]
pub async fn write_log(Json(item): Json<LogItem>) -> impl IntoResponse {
    let source = item.source.as_deref().unwrap_or("client");
    match item.level.as_deref() {
        Some("error") => error!(target: "wingman::client", source, "{}", item.message),
        Some("warn") | Some("warning") => {
            warn!(target: "wingman::client", source, "{}", item.message)
        }
        Some("debug") => debug!(target: "wingman::client", source, "{}", item.message),
        _ => info!(target: "wingman::client", source, "{}", item.message),
    }
    Json(json!({"ok": true}))
}
