use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::app_state::AppState;
use crate::responses::{internal_error, missing_params, not_found};
use wingman_kernel::DownloadItemStatus;

#[derive(Debug, Deserialize)]
pub struct ItemQuery {
    #[serde(default, rename = "modelRepo")]
    pub model_repo: Option<String>,
    #[serde(default, rename = "filePath")]
    pub file_path: Option<String>,
}

impl ItemQuery {
    fn key(&self) -> Option<(&str, &str)> {
        match (self.model_repo.as_deref(), self.file_path.as_deref()) {
            (Some(repo), Some(file)) if !repo.is_empty() && !file.is_empty() => Some((repo, file)),
            _ => None,
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/downloads",
    tag = "Downloads",
    params(
        ("modelRepo" = Option<String>, Query, description = "Filter by model repo"),
        ("filePath" = Option<String>, Query, description = "Filter by file path")
    ),
    responses((status = 200, description = "Matching download rows", body = serde_json::Value))
)]
pub async fn list(State(state): State<AppState>, Query(q): Query<ItemQuery>) -> Response {
    match state.kernel().get_all_downloads_async().await {
        Ok(all) => {
            let items: Vec<_> = all
                .into_iter()
                .filter(|item| {
                    q.model_repo
                        .as_deref()
                        .map_or(true, |r| r.is_empty() || item.model_repo == r)
                        && q.file_path
                            .as_deref()
                            .map_or(true, |f| f.is_empty() || item.file_path == f)
                })
                .collect();
            Json(json!({"DownloadItems": items})).into_response()
        }
        Err(err) => internal_error(err.to_string()),
    }
}

#[utoipa::path(
    get,
    path = "/api/downloads/enqueue",
    tag = "Downloads",
    params(
        ("modelRepo" = String, Query, description = "Model repo"),
        ("filePath" = String, Query, description = "File within the repo")
    ),
    responses(
        (status = 202, description = "New row queued", body = serde_json::Value),
        (status = 208, description = "Already queued, downloading, or complete", body = serde_json::Value),
        (status = 422, description = "Missing parameters"),
        (status = 500, description = "Store failure")
    )
)]
pub async fn enqueue(State(state): State<AppState>, Query(q): Query<ItemQuery>) -> Response {
    let Some((model_repo, file_path)) = q.key() else {
        return missing_params("modelRepo and filePath are required");
    };
    let existing = match state.kernel().get_download_async(model_repo, file_path).await {
        Ok(existing) => existing,
        Err(err) => return internal_error(err.to_string()),
    };
    if let Some(row) = existing {
        if matches!(
            row.status,
            DownloadItemStatus::Queued | DownloadItemStatus::Downloading | DownloadItemStatus::Complete
        ) {
            return (StatusCode::ALREADY_REPORTED, Json(row)).into_response();
        }
        // an error or cancelled row is replaced by a fresh attempt
        if let Err(err) = state
            .kernel()
            .remove_download_async(model_repo, file_path)
            .await
        {
            return internal_error(err.to_string());
        }
    }
    match state
        .kernel()
        .enqueue_download_async(model_repo, file_path)
        .await
    {
        Ok(row) => (StatusCode::ACCEPTED, Json(row)).into_response(),
        Err(err) => {
            warn!(target: "wingman::api", %err, "download enqueue failed");
            internal_error(err.to_string())
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/downloads/cancel",
    tag = "Downloads",
    params(
        ("modelRepo" = String, Query, description = "Model repo"),
        ("filePath" = String, Query, description = "File within the repo")
    ),
    responses(
        (status = 200, description = "Row flipped to cancelled", body = serde_json::Value),
        (status = 404, description = "No such row"),
        (status = 422, description = "Missing parameters")
    )
)]
pub async fn cancel(State(state): State<AppState>, Query(q): Query<ItemQuery>) -> Response {
    let Some((model_repo, file_path)) = q.key() else {
        return missing_params("modelRepo and filePath are required");
    };
    let Ok(existing) = state.kernel().get_download_async(model_repo, file_path).await else {
        return internal_error("store read failed");
    };
    let Some(mut row) = existing else {
        return not_found("no download for that modelRepo/filePath");
    };
    row.status = DownloadItemStatus::Cancelled;
    match state.kernel().set_download_async(&row).await {
        Ok(()) => Json(row).into_response(),
        Err(err) => internal_error(err.to_string()),
    }
}

#[utoipa::path(
    get,
    path = "/api/downloads/remove",
    tag = "Downloads",
    params(
        ("modelRepo" = String, Query, description = "Model repo"),
        ("filePath" = String, Query, description = "File within the repo")
    ),
    responses(
        (status = 200, description = "Row deleted", body = serde_json::Value),
        (status = 404, description = "No such row"),
        (status = 422, description = "Missing parameters")
    )
)]
pub async fn remove(State(state): State<AppState>, Query(q): Query<ItemQuery>) -> Response {
    let Some((model_repo, file_path)) = q.key() else {
        return missing_params("modelRepo and filePath are required");
    };
    let Ok(existing) = state.kernel().get_download_async(model_repo, file_path).await else {
        return internal_error("store read failed");
    };
    let Some(row) = existing else {
        return not_found("no download for that modelRepo/filePath");
    };
    match state
        .kernel()
        .remove_download_async(model_repo, file_path)
        .await
    {
        Ok(_) => Json(row).into_response(),
        Err(err) => internal_error(err.to_string()),
    }
}
