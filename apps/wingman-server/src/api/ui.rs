//! Bundled web assets, served from `dist/` and `distadmin/` next to the
//! binary.

use axum::Router;
use std::path::PathBuf;
use tower_http::services::ServeDir;

use crate::app_state::AppState;

fn asset_base() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn router() -> Router<AppState> {
    let base = asset_base();
    Router::new()
        .nest_service("/app", ServeDir::new(base.join("dist")))
        .nest_service("/admin", ServeDir::new(base.join("distadmin")))
}
