use axum::{
    routing::{get, post},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::app_state::AppState;

pub mod downloads;
pub mod events;
pub mod inference;
pub mod logs;
pub mod meta;
pub mod models;
pub mod retrieval;
pub mod ui;

// Route path constants (single source to reduce drift)
pub mod paths {
    pub const LIVE: &str = "/";
    pub const HEALTH: &str = "/health";
    pub const API_HEALTH: &str = "/api/health";
    pub const MODELS: &str = "/api/models";
    pub const MODEL_METADATA: &str = "/api/model/metadata";
    pub const DOWNLOADS: &str = "/api/downloads";
    pub const DOWNLOADS_ENQUEUE: &str = "/api/downloads/enqueue";
    pub const DOWNLOADS_CANCEL: &str = "/api/downloads/cancel";
    pub const DOWNLOADS_REMOVE: &str = "/api/downloads/remove";
    pub const INFERENCE: &str = "/api/inference";
    pub const INFERENCE_START: &str = "/api/inference/start";
    pub const INFERENCE_STOP: &str = "/api/inference/stop";
    pub const INFERENCE_STATUS: &str = "/api/inference/status";
    pub const INFERENCE_RESET: &str = "/api/inference/reset";
    pub const INFERENCE_RESTART: &str = "/api/inference/restart";
    pub const HARDWARE: &str = "/api/hardware";
    pub const SHUTDOWN: &str = "/api/shutdown";
    pub const UTILS_LOG: &str = "/api/utils/log";
    pub const RETRIEVAL_INGEST: &str = "/api/retrieval/ingest";
    pub const RETRIEVAL_QUERY: &str = "/api/retrieval/query";
}

pub fn router(state: AppState) -> Router {
    let max_conc: usize = std::env::var("WINGMAN_HTTP_MAX_CONC")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1024);
    Router::new()
        .route(paths::LIVE, get(events::live_channel))
        .route(paths::HEALTH, get(meta::health))
        .route(paths::API_HEALTH, get(meta::health))
        .route(paths::MODELS, get(models::list_models))
        .route(paths::MODEL_METADATA, get(models::model_metadata))
        .route(paths::DOWNLOADS, get(downloads::list))
        .route(paths::DOWNLOADS_ENQUEUE, get(downloads::enqueue))
        .route(paths::DOWNLOADS_CANCEL, get(downloads::cancel))
        .route(paths::DOWNLOADS_REMOVE, get(downloads::remove))
        .route(paths::INFERENCE, get(inference::list))
        .route(paths::INFERENCE_START, get(inference::start))
        .route(paths::INFERENCE_STOP, get(inference::stop))
        .route(paths::INFERENCE_STATUS, get(inference::status))
        .route(paths::INFERENCE_RESET, get(inference::reset))
        .route(paths::INFERENCE_RESTART, get(inference::restart))
        .route(paths::HARDWARE, get(meta::hardware))
        .route(paths::SHUTDOWN, get(meta::shutdown))
        .route(paths::UTILS_LOG, post(logs::write_log))
        .route(paths::RETRIEVAL_INGEST, post(retrieval::ingest))
        .route(paths::RETRIEVAL_QUERY, get(retrieval::query))
        .merge(ui::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(max_conc))
        .with_state(state)
}
