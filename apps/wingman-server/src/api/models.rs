use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::api::downloads::ItemQuery;
use crate::app_state::AppState;
use crate::responses::{internal_error, missing_params, not_found};
use crate::{model_files, util};
use wingman_kernel::{DownloadItemStatus, WingmanItemStatus};

/// Curated registry entries offered out of the box. Anything already on
/// disk shows up as well, flagged as downloaded.
fn curated_models() -> Vec<Value> {
    vec![
        json!({
            "modelRepo": "TheBloke/Mistral-7B-Instruct-v0.2-GGUF",
            "filePath": "mistral-7b-instruct-v0.2.Q4_K_M.gguf",
            "name": "Mistral 7B Instruct v0.2",
        }),
        json!({
            "modelRepo": "TheBloke/Llama-2-7B-Chat-GGUF",
            "filePath": "llama-2-7b-chat.Q4_K_M.gguf",
            "name": "Llama 2 7B Chat",
        }),
        json!({
            "modelRepo": "TheBloke/phi-2-GGUF",
            "filePath": "phi-2.Q4_K_M.gguf",
            "name": "Phi-2",
        }),
        json!({
            "modelRepo": "BAAI/bge-large-en-v1.5",
            "filePath": "bge-large-en-v1.5-Q8_0.gguf",
            "name": "BGE Large EN v1.5 (embeddings)",
        }),
    ]
}

#[utoipa::path(
    get,
    path = "/api/models",
    tag = "Models",
    responses((status = 200, description = "Curated model repos", body = serde_json::Value))
)]
pub async fn list_models(State(state): State<AppState>) -> Response {
    let downloaded = state
        .kernel()
        .get_all_downloads_async()
        .await
        .unwrap_or_default();
    let mut models = curated_models();
    for entry in models.iter_mut() {
        let complete = downloaded.iter().any(|d| {
            d.status == DownloadItemStatus::Complete
                && Some(d.model_repo.as_str()) == entry["modelRepo"].as_str()
                && Some(d.file_path.as_str()) == entry["filePath"].as_str()
        });
        if let Some(obj) = entry.as_object_mut() {
            obj.insert("downloaded".into(), json!(complete));
        }
    }
    // locally-present artifacts that are not in the curated list
    for d in downloaded
        .iter()
        .filter(|d| d.status == DownloadItemStatus::Complete)
    {
        let listed = models.iter().any(|m| {
            m["modelRepo"].as_str() == Some(d.model_repo.as_str())
                && m["filePath"].as_str() == Some(d.file_path.as_str())
        });
        if !listed {
            models.push(json!({
                "modelRepo": d.model_repo,
                "filePath": d.file_path,
                "name": d.file_path,
                "downloaded": true,
            }));
        }
    }
    Json(json!({"models": models})).into_response()
}

/// Metadata for one artifact; with no parameters, the currently inferring
/// item is described instead.
#[utoipa::path(
    get,
    path = "/api/model/metadata",
    tag = "Models",
    params(
        ("modelRepo" = Option<String>, Query, description = "Model repo"),
        ("filePath" = Option<String>, Query, description = "File within the repo")
    ),
    responses(
        (status = 200, description = "Metadata map", body = serde_json::Value),
        (status = 404, description = "Model not downloaded"),
        (status = 422, description = "No parameters and nothing inferring"),
        (status = 500, description = "More than one inferring item")
    )
)]
pub async fn model_metadata(State(state): State<AppState>, Query(q): Query<ItemQuery>) -> Response {
    if let (Some(model_repo), Some(file_path)) = (
        q.model_repo.as_deref().filter(|s| !s.is_empty()),
        q.file_path.as_deref().filter(|s| !s.is_empty()),
    ) {
        return metadata_for(&state, model_repo, file_path).await;
    }
    let inferring = match state
        .kernel()
        .get_wingman_by_status_async(WingmanItemStatus::Inferring)
        .await
    {
        Ok(items) => items,
        Err(err) => return internal_error(err.to_string()),
    };
    match inferring.as_slice() {
        [] => missing_params("modelRepo and filePath are required when nothing is inferring"),
        [one] => metadata_for(&state, &one.model_repo, &one.file_path).await,
        many => internal_error(format!("found {} inferring models; expected 1", many.len())),
    }
}

async fn metadata_for(state: &AppState, model_repo: &str, file_path: &str) -> Response {
    let row = match state.kernel().get_download_async(model_repo, file_path).await {
        Ok(Some(row)) => row,
        Ok(None) => return not_found("model not found"),
        Err(err) => return internal_error(err.to_string()),
    };
    let models_dir = util::models_dir(&state.settings().home);
    let path = model_files::artifact_path(&models_dir, model_repo, file_path);
    let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

    let mut meta = Map::new();
    meta.insert("modelRepo".into(), json!(model_repo));
    meta.insert("filePath".into(), json!(file_path));
    meta.insert("status".into(), json!(row.status));
    meta.insert("path".into(), json!(path.display().to_string()));
    meta.insert("size".into(), json!(size));

    // the live runtime knows its own metadata best
    if let Ok(items) = state
        .kernel()
        .get_wingman_by_status_async(WingmanItemStatus::Inferring)
        .await
    {
        if let Some(serving) = items
            .iter()
            .find(|i| i.model_repo == model_repo && i.file_path == file_path)
        {
            let url = format!("http://{}:{}/model.json", serving.address, serving.port);
            match state.http().get(&url).send().await {
                Ok(resp) => {
                    if let Ok(body) = resp.json::<Value>().await {
                        meta.insert("model".into(), body);
                    }
                }
                Err(err) => {
                    debug!(target: "wingman::api", %err, "runtime metadata fetch failed");
                }
            }
        }
    }
    Json(Value::Object(meta)).into_response()
}
