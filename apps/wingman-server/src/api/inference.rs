use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::responses::{internal_error, missing_params, not_found, problem};
use crate::supervisor::{self, StopRequestOutcome};
use wingman_kernel::{DownloadItemStatus, WingmanItem, WingmanItemStatus};

#[derive(Debug, Deserialize)]
pub struct AliasQuery {
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default, rename = "modelRepo")]
    pub model_repo: Option<String>,
    #[serde(default, rename = "filePath")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<i64>,
    #[serde(default, rename = "contextSize")]
    pub context_size: Option<i64>,
    #[serde(default, rename = "gpuLayers")]
    pub gpu_layers: Option<i64>,
}

async fn items_for(state: &AppState, alias: Option<&str>) -> anyhow::Result<Vec<WingmanItem>> {
    match alias {
        Some(alias) if !alias.is_empty() => Ok(state
            .kernel()
            .get_wingman_async(alias)
            .await?
            .into_iter()
            .collect()),
        _ => state.kernel().get_all_wingman_async().await,
    }
}

#[utoipa::path(
    get,
    path = "/api/inference",
    tag = "Inference",
    params(("alias" = Option<String>, Query, description = "One item instead of all")),
    responses((status = 200, description = "Inference rows", body = serde_json::Value))
)]
pub async fn list(State(state): State<AppState>, Query(q): Query<AliasQuery>) -> Response {
    match items_for(&state, q.alias.as_deref()).await {
        Ok(items) => Json(json!({"WingmanItems": items})).into_response(),
        Err(err) => internal_error(err.to_string()),
    }
}

#[utoipa::path(
    get,
    path = "/api/inference/status",
    tag = "Inference",
    params(("alias" = Option<String>, Query, description = "One item instead of all")),
    responses((status = 200, description = "Inference rows", body = serde_json::Value))
)]
pub async fn status(State(state): State<AppState>, Query(q): Query<AliasQuery>) -> Response {
    match items_for(&state, q.alias.as_deref()).await {
        Ok(items) => Json(items).into_response(),
        Err(err) => internal_error(err.to_string()),
    }
}

/// The only operation with cross-component coordination: serialized by the
/// non-reentrant start mutex, it stops whatever is active, checks the
/// referenced artifact, then queues the new item for the supervisor.
#[utoipa::path(
    get,
    path = "/api/inference/start",
    tag = "Inference",
    params(
        ("alias" = Option<String>, Query, description = "Session name; defaults to filePath"),
        ("modelRepo" = String, Query, description = "Model repo"),
        ("filePath" = String, Query, description = "File within the repo"),
        ("address" = Option<String>, Query, description = "Runtime bind address"),
        ("port" = Option<i64>, Query, description = "Runtime port (default 6567)"),
        ("contextSize" = Option<i64>, Query, description = "Context size (default 0)"),
        ("gpuLayers" = Option<i64>, Query, description = "GPU layers (default -1)")
    ),
    responses(
        (status = 202, description = "Queued", body = serde_json::Value),
        (status = 208, description = "Alias already active", body = serde_json::Value),
        (status = 404, description = "Model not downloaded"),
        (status = 422, description = "Missing parameters"),
        (status = 500, description = "Stop of active item failed"),
        (status = 503, description = "Another start is in progress")
    )
)]
pub async fn start(State(state): State<AppState>, Query(q): Query<StartQuery>) -> Response {
    let Ok(_guard) = state.start_lock().try_lock() else {
        return problem(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable",
            "another start request is in progress",
        );
    };

    let (Some(model_repo), Some(file_path)) = (
        q.model_repo.as_deref().filter(|s| !s.is_empty()),
        q.file_path.as_deref().filter(|s| !s.is_empty()),
    ) else {
        return missing_params("modelRepo and filePath are required");
    };
    let alias = match q.alias.as_deref().filter(|s| !s.is_empty()) {
        Some(alias) => alias.to_string(),
        None => file_path.to_string(),
    };

    match state.kernel().get_wingman_async(&alias).await {
        Ok(Some(existing)) if existing.status.is_active() => {
            warn!(target: "wingman::api", alias, status = existing.status.as_str(), "alias already active");
            return (StatusCode::ALREADY_REPORTED, Json(existing)).into_response();
        }
        Ok(_) => {}
        Err(err) => return internal_error(err.to_string()),
    }

    // at most one inference may run; stop the active one and wait
    let active = match state.kernel().get_active_wingman_async().await {
        Ok(active) => active,
        Err(err) => return internal_error(err.to_string()),
    };
    if let Some(current) = active.first() {
        info!(target: "wingman::api", active = %current.alias, "stopping active inference before start");
        match supervisor::request_stop(
            &state,
            &current.alias,
            state.settings().inference_stop_timeout,
        )
        .await
        {
            Ok(StopRequestOutcome::Stopped) => {}
            Ok(StopRequestOutcome::TimedOut) => {
                error!(target: "wingman::api", active = %current.alias, "timeout stopping active inference");
                return internal_error("timeout waiting for the active inference to stop");
            }
            Err(err) => return internal_error(err.to_string()),
        }
    }

    // no two active items may share a port
    let port = q.port.unwrap_or(state.settings().inference_port as i64);
    match state.kernel().get_wingman_by_port_async(port).await {
        Ok(rows) => {
            if rows.iter().any(|r| r.alias != alias && r.status.is_active()) {
                warn!(target: "wingman::api", port, "port already claimed by an active item");
                return problem(
                    StatusCode::ALREADY_REPORTED,
                    "Already Reported",
                    format!("port {port} is already in use by an active inference"),
                );
            }
        }
        Err(err) => return internal_error(err.to_string()),
    }

    match state.kernel().get_download_async(model_repo, file_path).await {
        Ok(Some(d)) if d.status == DownloadItemStatus::Complete => {}
        Ok(_) => return not_found("model has not been downloaded"),
        Err(err) => return internal_error(err.to_string()),
    }

    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let item = WingmanItem {
        alias: alias.clone(),
        model_repo: model_repo.to_string(),
        file_path: file_path.to_string(),
        status: WingmanItemStatus::Queued,
        address: q
            .address
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| "localhost".to_string()),
        port,
        context_size: q.context_size.unwrap_or(0),
        gpu_layers: q.gpu_layers.unwrap_or(state.settings().gpu_layers),
        error: None,
        created: now.clone(),
        updated: now,
    };
    match state.kernel().set_wingman_async(&item).await {
        Ok(()) => {
            info!(target: "wingman::api", alias, "inference queued");
            // return the stored row (an upsert over a completed row keeps
            // its original creation time)
            let row = state
                .kernel()
                .get_wingman_async(&alias)
                .await
                .ok()
                .flatten()
                .unwrap_or(item);
            (StatusCode::ACCEPTED, Json(row)).into_response()
        }
        Err(err) => internal_error(err.to_string()),
    }
}

#[utoipa::path(
    get,
    path = "/api/inference/stop",
    tag = "Inference",
    params(("alias" = String, Query, description = "Session to stop")),
    responses(
        (status = 200, description = "Stopped", body = serde_json::Value),
        (status = 404, description = "Alias absent"),
        (status = 422, description = "Missing alias"),
        (status = 500, description = "Stop failed or timed out")
    )
)]
pub async fn stop(State(state): State<AppState>, Query(q): Query<AliasQuery>) -> Response {
    let Some(alias) = q.alias.as_deref().filter(|s| !s.is_empty()) else {
        return missing_params("alias is required");
    };
    match state.kernel().get_wingman_async(alias).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("no inference with that alias"),
        Err(err) => return internal_error(err.to_string()),
    }
    match supervisor::request_stop(&state, alias, state.settings().inference_stop_timeout).await {
        Ok(StopRequestOutcome::Stopped) => {
            match state.kernel().get_wingman_async(alias).await {
                Ok(Some(row)) => Json(row).into_response(),
                _ => Json(json!({})).into_response(),
            }
        }
        Ok(StopRequestOutcome::TimedOut) => internal_error("timeout waiting for inference to stop"),
        Err(err) => internal_error(err.to_string()),
    }
}

#[utoipa::path(
    get,
    path = "/api/inference/reset",
    tag = "Inference",
    params(("alias" = String, Query, description = "Session to stop and remove")),
    responses(
        (status = 200, description = "Stopped and removed", body = serde_json::Value),
        (status = 404, description = "Alias absent"),
        (status = 422, description = "Missing alias"),
        (status = 500, description = "Stop failed or timed out")
    )
)]
pub async fn reset(State(state): State<AppState>, Query(q): Query<AliasQuery>) -> Response {
    let Some(alias) = q.alias.as_deref().filter(|s| !s.is_empty()) else {
        return missing_params("alias is required");
    };
    let row = match state.kernel().get_wingman_async(alias).await {
        Ok(Some(row)) => row,
        Ok(None) => return not_found("no inference with that alias"),
        Err(err) => return internal_error(err.to_string()),
    };
    match supervisor::request_stop(&state, alias, state.settings().inference_stop_timeout).await {
        Ok(StopRequestOutcome::Stopped) => {}
        Ok(StopRequestOutcome::TimedOut) => {
            return internal_error("timeout waiting for inference to stop")
        }
        Err(err) => return internal_error(err.to_string()),
    }
    match state.kernel().remove_wingman_async(alias).await {
        Ok(_) => Json(row).into_response(),
        Err(err) => internal_error(err.to_string()),
    }
}

/// Stops the currently inferring item and re-queues it with the same
/// parameters.
#[utoipa::path(
    get,
    path = "/api/inference/restart",
    tag = "Inference",
    responses(
        (status = 202, description = "Re-queued", body = serde_json::Value),
        (status = 404, description = "Nothing is inferring"),
        (status = 500, description = "Stop failed or timed out")
    )
)]
pub async fn restart(State(state): State<AppState>) -> Response {
    let inferring = match state
        .kernel()
        .get_wingman_by_status_async(WingmanItemStatus::Inferring)
        .await
    {
        Ok(items) => items,
        Err(err) => return internal_error(err.to_string()),
    };
    let old = match inferring.as_slice() {
        [] => return not_found("nothing is inferring"),
        [one] => one.clone(),
        many => {
            error!(
                target: "wingman::api",
                count = many.len(),
                "multiple inferring items; expected 1"
            );
            return internal_error("multiple inferring items");
        }
    };
    match supervisor::request_stop(&state, &old.alias, state.settings().inference_stop_timeout)
        .await
    {
        Ok(StopRequestOutcome::Stopped) => {}
        Ok(StopRequestOutcome::TimedOut) => {
            return internal_error("timeout waiting for inference to stop")
        }
        Err(err) => return internal_error(err.to_string()),
    }
    if let Err(err) = state.kernel().remove_wingman_async(&old.alias).await {
        return internal_error(err.to_string());
    }
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let requeued = WingmanItem {
        status: WingmanItemStatus::Queued,
        error: None,
        created: now.clone(),
        updated: now,
        ..old
    };
    match state.kernel().set_wingman_async(&requeued).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(requeued)).into_response(),
        Err(err) => internal_error(err.to_string()),
    }
}
