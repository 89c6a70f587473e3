//! Local orchestrator for LLM workloads: download queue, single-active
//! inference supervision, live metrics fan-out, crash reconciliation.

use std::net::SocketAddr;

use anyhow::Context as _;
use tracing::{error, info};

pub mod api;
pub mod app_state;
pub mod config;
pub mod downloader;
pub mod hardware;
pub mod hub;
pub mod lifecycle;
pub mod model_files;
pub mod responses;
pub mod retrieval;
pub mod supervisor;
pub mod tasks;
pub mod util;

use app_state::AppState;
use config::Settings;
use hub::Hub;
use wingman_events::Bus;
use wingman_kernel::Kernel;

/// Opens the store, runs crash reconciliation, and wires up the shared
/// state. No workers are spawned yet.
pub fn bootstrap(settings: &Settings) -> anyhow::Result<AppState> {
    util::ensure_home_layout(&settings.home)
        .with_context(|| format!("creating home layout at {}", settings.home.display()))?;
    let stale = lifecycle::remove_stale_sentinels(&settings.home);
    let kernel = Kernel::open(&settings.home).context("opening store")?;
    lifecycle::reset_after_crash(&kernel, stale, false).context("crash reconciliation")?;
    let bus = Bus::new_with_replay(256, 256);
    let hub = Hub::new(bus.clone(), util::logs_dir(&settings.home));
    Ok(AppState::new(bus, kernel, hub, settings.clone()))
}

fn install_signal_handler(state: AppState) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!(target: "wingman::lifecycle", "interrupt received; requesting clean shutdown");
        state.request_shutdown();
        if tokio::signal::ctrl_c().await.is_ok() {
            error!(target: "wingman::lifecycle", "second interrupt; aborting");
            std::process::abort();
        }
    });
}

/// Runs the orchestrator until shutdown is requested, then drains the
/// workers within the force window.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let state = bootstrap(&settings)?;
    state.hub().write_start_marker();

    let mut tasks = tasks::TaskManager::new();
    tasks.push(downloader::start(state.clone()));
    tasks.extend(supervisor::start(state.clone()));
    tasks.push(lifecycle::start_monitor(state.clone()));
    tasks.push(state.hub().start_drainer(state.shutdown_token()));
    install_signal_handler(state.clone());

    let app = api::router(state.clone());
    let addr: SocketAddr = format!("{}:{}", settings.bind, settings.websocket_port)
        .parse()
        .context("parsing bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(
        target: "wingman::lifecycle",
        "wingman api/websocket accepting commands/connections on {addr}"
    );

    let shutdown = state.shutdown_token();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("serving control api")?;

    info!(target: "wingman::lifecycle", "shutdown requested; draining workers");
    tasks
        .shutdown_with_grace(settings.force_shutdown_wait)
        .await;
    info!(target: "wingman::lifecycle", "all services stopped");
    Ok(())
}
