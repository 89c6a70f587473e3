use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::responses::{internal_error, missing_params, problem};
use crate::retrieval::{self, RetrievalError};

const DEFAULT_NEIGHBOURS: usize = 10;
const MAX_NEIGHBOURS: usize = 100;

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub source: Option<String>,
    pub chunks: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

fn retrieval_error(err: RetrievalError) -> Response {
    match err {
        RetrievalError::NoActiveInference => problem(
            StatusCode::FAILED_DEPENDENCY,
            "No Inference Running",
            err.to_string(),
        ),
        other => internal_error(other.to_string()),
    }
}

#[utoipa::path(
    post,
    path = "/api/retrieval/ingest",
    tag = "Retrieval",
    responses(
        (status = 200, description = "Chunks embedded and stored", body = serde_json::Value),
        (status = 424, description = "No inference running to serve embeddings"),
        (status = 500, description = "Embedding or store failure")
    )
)]
pub async fn ingest(State(state): State<AppState>, Json(req): Json<IngestRequest>) -> Response {
    let source = req.source.as_deref().unwrap_or("unknown");
    match retrieval::ingest(&state, source, &req.chunks).await {
        Ok(ingested) => Json(json!({"ingested": ingested})).into_response(),
        Err(err) => retrieval_error(err),
    }
}

#[utoipa::path(
    get,
    path = "/api/retrieval/query",
    tag = "Retrieval",
    params(
        ("q" = String, Query, description = "Query text"),
        ("limit" = Option<usize>, Query, description = "Neighbour count (default 10)")
    ),
    responses(
        (status = 200, description = "Nearest chunks, closest first", body = serde_json::Value),
        (status = 422, description = "Missing query"),
        (status = 424, description = "No inference running to serve embeddings")
    )
)]
pub async fn query(State(state): State<AppState>, Query(params): Query<QueryParams>) -> Response {
    let Some(q) = params.q.as_deref().filter(|s| !s.trim().is_empty()) else {
        return missing_params("q is required");
    };
    let limit = params
        .limit
        .unwrap_or(DEFAULT_NEIGHBOURS)
        .clamp(1, MAX_NEIGHBOURS);
    match retrieval::query(&state, q, limit).await {
        Ok(results) => Json(json!({"results": results})).into_response(),
        Err(err) => retrieval_error(err),
    }
}
