//! Start-up reconciliation, sentinel handling, and the runtime monitor.
//!
//! The previous run's outcome is read from the WingmanService status blob in
//! the store; the `wingman.kill` / `wingman.exit` sentinel files remain as
//! the out-of-band operator override. A kill sentinel observed while running
//! forces an immediate exit whose code records what the runtime was doing:
//! 0 when idle, 1024 while a model was loading, 1025 while inferring.

use anyhow::Result;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::app_state::{AppState, DOWNLOAD_SERVICE, WINGMAN_SERVICE};
use crate::config::MONITOR_INTERVAL;
use crate::tasks::TaskHandle;
use wingman_kernel::{Kernel, ServiceStatus, WingmanItem, WingmanItemStatus, WingmanServiceAppItem};

pub const KILL_FILE_NAME: &str = "wingman.kill";
pub const EXIT_FILE_NAME: &str = "wingman.exit";

pub const EXIT_CODE_LOADING: i32 = 1024;
pub const EXIT_CODE_INFERRING: i32 = 1025;

const ERR_OOM_RUNNING: &str = "The system ran out of memory while running the AI.";
const ERR_OOM_RUNNING_MODEL: &str = "The system ran out of memory while running the AI model.";
const ERR_OOM_LOADING: &str = "There is not enough available memory to load the AI model.";
const ERR_FAILED_TO_LOAD: &str = "The AI failed to load.";
const ERR_MODEL_FAILED_TO_LOAD: &str = "The AI model failed to load.";

pub fn kill_file_path(home: &Path) -> PathBuf {
    home.join(KILL_FILE_NAME)
}

pub fn exit_file_path(home: &Path) -> PathBuf {
    home.join(EXIT_FILE_NAME)
}

/// What the previous run left behind.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaleSentinels {
    pub kill: bool,
    pub exit: bool,
}

/// Removes leftover sentinel files, reporting which were present so
/// reconciliation can act on them.
pub fn remove_stale_sentinels(home: &Path) -> StaleSentinels {
    let mut found = StaleSentinels::default();
    let kill = kill_file_path(home);
    if kill.exists() {
        info!(target: "wingman::lifecycle", path = %kill.display(), "kill sentinel detected; removing");
        let _ = std::fs::remove_file(&kill);
        found.kill = true;
    }
    let exit = exit_file_path(home);
    if exit.exists() {
        info!(target: "wingman::lifecycle", path = %exit.display(), "exit sentinel detected; removing");
        let _ = std::fs::remove_file(&exit);
        found.exit = true;
    }
    found
}

fn set_error(kernel: &Kernel, item: &WingmanItem, message: &str) {
    if let Err(err) = kernel.update_wingman_status(&item.alias, WingmanItemStatus::Error, Some(message))
    {
        warn!(target: "wingman::lifecycle", %err, alias = %item.alias, "reconciliation update failed");
    } else {
        debug!(target: "wingman::lifecycle", alias = %item.alias, message, "item demoted to error");
    }
}

/// Crash reconciliation. Inspects the previous run's WingmanService status
/// and the sentinels it left behind, demotes stranded active items with
/// context-appropriate messages, and returns in-flight downloads to the
/// queue.
pub fn reset_after_crash(kernel: &Kernel, sentinels: StaleSentinels, force: bool) -> Result<()> {
    let active = kernel.get_active_wingman()?;

    if sentinels.kill {
        for item in &active {
            set_error(kernel, item, ERR_OOM_RUNNING);
        }
        info!(
            target: "wingman::lifecycle",
            demoted = active.len(),
            "reconciled after forced kill"
        );
    } else if sentinels.exit {
        for item in active.iter().filter(|i| i.status == WingmanItemStatus::Preparing) {
            set_error(kernel, item, ERR_FAILED_TO_LOAD);
        }
        info!(target: "wingman::lifecycle", "reconciled after requested exit");
    } else {
        let previous: Option<WingmanServiceAppItem> = kernel
            .get_app(WINGMAN_SERVICE, "default")?
            .and_then(|item| serde_json::from_str(&item.value).ok());
        if let Some(previous) = previous {
            // an error recording exit code 1024 means the service already
            // shut itself down in order; nothing is stranded
            let clean_exit = previous
                .error
                .as_deref()
                .map(|e| e.contains("error code 1024"))
                .unwrap_or(false);
            if !clean_exit {
                let unclean = force
                    || matches!(
                        previous.status,
                        ServiceStatus::Inferring | ServiceStatus::Preparing | ServiceStatus::Error
                    );
                if unclean {
                    for item in &active {
                        match item.status {
                            WingmanItemStatus::Inferring => {
                                set_error(kernel, item, ERR_OOM_RUNNING_MODEL)
                            }
                            WingmanItemStatus::Preparing => set_error(kernel, item, ERR_OOM_LOADING),
                            _ => {}
                        }
                    }
                } else {
                    for item in active.iter().filter(|i| i.status == WingmanItemStatus::Preparing)
                    {
                        set_error(kernel, item, ERR_MODEL_FAILED_TO_LOAD);
                    }
                }
            } else {
                debug!(target: "wingman::lifecycle", "previous run exited cleanly");
            }
        }
    }

    let requeued = kernel.reset_downloads()?;
    if requeued > 0 {
        info!(target: "wingman::lifecycle", requeued, "in-flight downloads returned to queue");
    }
    Ok(())
}

/// Exit code for a forced (kill sentinel) shutdown, from what was active.
pub fn forced_exit_code(active: &[WingmanItem]) -> i32 {
    if active.is_empty() {
        return 0;
    }
    if active.iter().any(|i| i.status == WingmanItemStatus::Preparing) {
        return EXIT_CODE_LOADING;
    }
    EXIT_CODE_INFERRING
}

/// 250 ms loop: watches sentinel files and pushes the full state snapshot
/// into the hub.
pub fn start_monitor(state: AppState) -> TaskHandle {
    TaskHandle::new("lifecycle.monitor", tokio::spawn(run_monitor(state)))
}

async fn run_monitor(state: AppState) {
    let cancel = state.shutdown_token();
    let kill_path = kill_file_path(&state.settings().home);
    let exit_path = exit_file_path(&state.settings().home);
    loop {
        if kill_path.exists() {
            let active = state
                .kernel()
                .get_active_wingman_async()
                .await
                .unwrap_or_default();
            let code = forced_exit_code(&active);
            for item in &active {
                let _ = state
                    .kernel()
                    .update_wingman_status_async(
                        &item.alias,
                        WingmanItemStatus::Error,
                        Some(ERR_OOM_RUNNING.to_string()),
                    )
                    .await;
            }
            info!(
                target: "wingman::lifecycle",
                code, "kill sentinel detected; terminating instantly"
            );
            std::process::exit(code);
        }
        if exit_path.exists() && !state.shutdown_requested() {
            info!(target: "wingman::lifecycle", "exit sentinel detected; requesting clean shutdown");
            state.request_shutdown();
        }
        if cancel.is_cancelled() {
            break;
        }
        enqueue_all_metrics(&state).await;
        tokio::select! {
            _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
            _ = cancel.cancelled() => break,
        }
    }
    debug!(target: "wingman::lifecycle", "monitor stopped");
}

/// Pushes one snapshot of everything a live client renders: both service
/// blobs, every inference row, recently-touched download rows, and the
/// current inferring item.
pub async fn enqueue_all_metrics(state: &AppState) {
    for name in [WINGMAN_SERVICE, DOWNLOAD_SERVICE] {
        if let Some(blob) = state.read_service_blob::<serde_json::Value>(name).await {
            state.hub().enqueue("service.status", json!({ name: blob }));
        }
    }

    let wingman_items = state
        .kernel()
        .get_all_wingman_async()
        .await
        .unwrap_or_default();
    state
        .hub()
        .enqueue("inference.snapshot", json!({"WingmanItems": wingman_items}));

    let download_items = state
        .kernel()
        .get_downloads_since_async(chrono::Duration::minutes(30))
        .await
        .unwrap_or_default();
    state
        .hub()
        .enqueue("download.snapshot", json!({"DownloadItems": download_items}));

    let inferring = state
        .kernel()
        .get_wingman_by_status_async(WingmanItemStatus::Inferring)
        .await
        .unwrap_or_default();
    let current = inferring
        .first()
        .map(|item| json!(item))
        .unwrap_or_else(|| json!({}));
    state
        .hub()
        .enqueue("inference.status", json!({"currentWingmanInferenceItem": current}));
}

#[cfg(test)]
mod tests {
    use super::*;
    use wingman_kernel::{AppItem, Kernel};

    fn open_kernel() -> (tempfile::TempDir, Kernel) {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        (dir, kernel)
    }

    fn insert(kernel: &Kernel, alias: &str, status: WingmanItemStatus) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        kernel
            .set_wingman(&WingmanItem {
                alias: alias.into(),
                model_repo: "X".into(),
                file_path: "y.gguf".into(),
                status,
                address: "localhost".into(),
                port: 6567,
                context_size: 0,
                gpu_layers: -1,
                error: None,
                created: now.clone(),
                updated: now,
            })
            .unwrap();
    }

    fn write_service_status(kernel: &Kernel, status: ServiceStatus, error: Option<&str>) {
        let mut item = AppItem::make(WINGMAN_SERVICE);
        item.value = serde_json::to_string(&WingmanServiceAppItem {
            status,
            alias: None,
            error: error.map(|e| e.to_string()),
        })
        .unwrap();
        kernel.set_app(&item).unwrap();
    }

    #[test]
    fn kill_sentinel_demotes_every_active_item() {
        let (_dir, kernel) = open_kernel();
        insert(&kernel, "loading", WingmanItemStatus::Preparing);
        insert(&kernel, "running", WingmanItemStatus::Inferring);
        reset_after_crash(
            &kernel,
            StaleSentinels {
                kill: true,
                exit: false,
            },
            false,
        )
        .unwrap();
        for alias in ["loading", "running"] {
            let row = kernel.get_wingman(alias).unwrap().unwrap();
            assert_eq!(row.status, WingmanItemStatus::Error);
            assert_eq!(row.error.as_deref(), Some(ERR_OOM_RUNNING));
        }
    }

    #[test]
    fn exit_sentinel_demotes_only_preparing_items() {
        let (_dir, kernel) = open_kernel();
        insert(&kernel, "loading", WingmanItemStatus::Preparing);
        insert(&kernel, "running", WingmanItemStatus::Inferring);
        reset_after_crash(
            &kernel,
            StaleSentinels {
                kill: false,
                exit: true,
            },
            false,
        )
        .unwrap();
        let loading = kernel.get_wingman("loading").unwrap().unwrap();
        assert_eq!(loading.status, WingmanItemStatus::Error);
        assert_eq!(loading.error.as_deref(), Some(ERR_FAILED_TO_LOAD));
        let running = kernel.get_wingman("running").unwrap().unwrap();
        assert_eq!(running.status, WingmanItemStatus::Inferring);
    }

    #[test]
    fn previous_inferring_status_demotes_with_oom_messages() {
        let (_dir, kernel) = open_kernel();
        insert(&kernel, "loading", WingmanItemStatus::Preparing);
        insert(&kernel, "running", WingmanItemStatus::Inferring);
        write_service_status(&kernel, ServiceStatus::Inferring, None);
        reset_after_crash(&kernel, StaleSentinels::default(), false).unwrap();
        let running = kernel.get_wingman("running").unwrap().unwrap();
        assert_eq!(running.error.as_deref(), Some(ERR_OOM_RUNNING_MODEL));
        let loading = kernel.get_wingman("loading").unwrap().unwrap();
        assert_eq!(loading.error.as_deref(), Some(ERR_OOM_LOADING));
    }

    #[test]
    fn clean_1024_exit_marker_leaves_items_alone() {
        let (_dir, kernel) = open_kernel();
        insert(&kernel, "running", WingmanItemStatus::Inferring);
        write_service_status(
            &kernel,
            ServiceStatus::Error,
            Some("runtime exited with error code 1024"),
        );
        reset_after_crash(&kernel, StaleSentinels::default(), false).unwrap();
        let running = kernel.get_wingman("running").unwrap().unwrap();
        assert_eq!(running.status, WingmanItemStatus::Inferring);
    }

    #[test]
    fn quiet_previous_run_demotes_only_preparing() {
        let (_dir, kernel) = open_kernel();
        insert(&kernel, "loading", WingmanItemStatus::Preparing);
        insert(&kernel, "running", WingmanItemStatus::Inferring);
        write_service_status(&kernel, ServiceStatus::Ready, None);
        reset_after_crash(&kernel, StaleSentinels::default(), false).unwrap();
        let loading = kernel.get_wingman("loading").unwrap().unwrap();
        assert_eq!(loading.error.as_deref(), Some(ERR_MODEL_FAILED_TO_LOAD));
        let running = kernel.get_wingman("running").unwrap().unwrap();
        assert_eq!(running.status, WingmanItemStatus::Inferring);
    }

    #[test]
    fn force_overrides_a_quiet_previous_status() {
        let (_dir, kernel) = open_kernel();
        insert(&kernel, "running", WingmanItemStatus::Inferring);
        write_service_status(&kernel, ServiceStatus::Ready, None);
        reset_after_crash(&kernel, StaleSentinels::default(), true).unwrap();
        let running = kernel.get_wingman("running").unwrap().unwrap();
        assert_eq!(running.error.as_deref(), Some(ERR_OOM_RUNNING_MODEL));
    }

    #[test]
    fn reconciliation_requeues_inflight_downloads() {
        let (_dir, kernel) = open_kernel();
        kernel.enqueue_download("X", "y.bin").unwrap();
        kernel.claim_next_queued_download().unwrap().unwrap();
        reset_after_crash(&kernel, StaleSentinels::default(), false).unwrap();
        let row = kernel.get_download("X", "y.bin").unwrap().unwrap();
        assert_eq!(row.status, wingman_kernel::DownloadItemStatus::Queued);
    }

    #[test]
    fn forced_exit_code_reflects_runtime_phase() {
        let (_dir, kernel) = open_kernel();
        assert_eq!(forced_exit_code(&[]), 0);
        insert(&kernel, "running", WingmanItemStatus::Inferring);
        let active = kernel.get_active_wingman().unwrap();
        assert_eq!(forced_exit_code(&active), EXIT_CODE_INFERRING);
        insert(&kernel, "loading", WingmanItemStatus::Preparing);
        let active = kernel.get_active_wingman().unwrap();
        assert_eq!(forced_exit_code(&active), EXIT_CODE_LOADING);
    }

    #[test]
    fn stale_sentinels_are_removed_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(kill_file_path(dir.path()), b"").unwrap();
        let found = remove_stale_sentinels(dir.path());
        assert!(found.kill);
        assert!(!found.exit);
        assert!(!kill_file_path(dir.path()).exists());
    }
}
