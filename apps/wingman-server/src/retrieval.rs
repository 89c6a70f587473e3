//! Retrieval path: chunk ingest and nearest-neighbour queries.
//!
//! Embeddings come from the currently inferring runtime's `/embedding`
//! endpoint; vectors live in the store and are compared in-process. The
//! scan is linear, which is adequate at local scale.

use serde_json::{json, Value};
use tracing::debug;

use crate::app_state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("no inference is currently running to serve embeddings")]
    NoActiveInference,
    #[error("embedding request failed: {0}")]
    Runtime(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Embeds `text` through the live runtime.
pub async fn embed(state: &AppState, text: &str) -> Result<Vec<f32>, RetrievalError> {
    let items = state
        .kernel()
        .get_wingman_by_status_async(wingman_kernel::WingmanItemStatus::Inferring)
        .await?;
    let Some(item) = items.first() else {
        return Err(RetrievalError::NoActiveInference);
    };
    let url = format!("http://{}:{}/embedding", item.address, item.port);
    let response = state
        .http()
        .post(&url)
        .json(&json!({"content": text}))
        .send()
        .await
        .map_err(|e| RetrievalError::Runtime(e.to_string()))?
        .error_for_status()
        .map_err(|e| RetrievalError::Runtime(e.to_string()))?;
    let body: Value = response
        .json()
        .await
        .map_err(|e| RetrievalError::Runtime(e.to_string()))?;
    extract_embedding(&body)
        .ok_or_else(|| RetrievalError::Runtime("response carried no embedding vector".into()))
}

/// Pulls the vector out of an `/embedding` response body.
pub fn extract_embedding(body: &Value) -> Option<Vec<f32>> {
    let arr = body.get("embedding")?.as_array()?;
    if arr.is_empty() {
        return None;
    }
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        out.push(v.as_f64()? as f32);
    }
    Some(out)
}

/// Embeds and stores each chunk; returns how many were ingested.
pub async fn ingest(
    state: &AppState,
    source: &str,
    chunks: &[String],
) -> Result<usize, RetrievalError> {
    let mut ingested = 0usize;
    for chunk in chunks {
        if chunk.trim().is_empty() {
            continue;
        }
        let vector = embed(state, chunk).await?;
        state
            .kernel()
            .insert_chunk_async(source, chunk, vector)
            .await?;
        ingested += 1;
    }
    debug!(target: "wingman::retrieval", source, ingested, "chunks ingested");
    Ok(ingested)
}

/// Embeds the query and returns the nearest chunks, closest first.
pub async fn query(state: &AppState, q: &str, limit: usize) -> Result<Vec<Value>, RetrievalError> {
    let vector = embed(state, q).await?;
    let hits = state.kernel().nearest_chunks_async(vector, limit).await?;
    Ok(hits
        .into_iter()
        .map(|(record, distance)| {
            json!({
                "id": record.id,
                "chunk": record.chunk,
                "source": record.source,
                "distance": distance,
            })
        })
        .collect())
}
