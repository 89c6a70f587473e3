//! Inference supervisor.
//!
//! Single consumer of the inference queue. Exactly one runtime child may be
//! alive at a time; the active handle is shared with the cancellation loop
//! through [`ActiveSlot`]. The child is never awaited exclusively — both
//! loops poll `try_wait` under a short-lived lock, so a kill issued by the
//! cancellation loop is observed by the queue loop on its next tick.

use anyhow::anyhow;
use serde_json::{json, Value};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt as _;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::config::{CANCEL_CHECK_INTERVAL, QUEUE_CHECK_INTERVAL};
use crate::tasks::TaskHandle;
use crate::{model_files, util};
use wingman_kernel::{ServiceStatus, WingmanItem, WingmanItemStatus};

/// Poll cadence for child liveness and runtime readiness.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Timing poll cadence: relaxed while the runtime is idle, tight while it
/// is producing tokens.
const METRICS_IDLE_INTERVAL: Duration = Duration::from_millis(1000);
const METRICS_BUSY_INTERVAL: Duration = Duration::from_millis(250);

/// Exit-code dispatch for the model runtime. The numeric codes are the
/// external contract; everything internal matches on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeExit {
    Completed,
    OutOfMemory,
    ModelLoadFailure,
    StartupFailure,
    Other(i32),
}

impl RuntimeExit {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => RuntimeExit::Completed,
            Some(100) => RuntimeExit::OutOfMemory,
            Some(1024) => RuntimeExit::ModelLoadFailure,
            Some(1) => RuntimeExit::StartupFailure,
            Some(code) => RuntimeExit::Other(code),
            None => RuntimeExit::Other(-1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Out of memory.")]
    OutOfMemory,
    #[error("The model runtime exited with error code 1024. There was an error loading the model.")]
    ModelLoading,
    #[error("The model runtime exited with error code 1. There was an error during loading, binding to the port, or listening for connections")]
    Startup,
    #[error("The model runtime exited with error code {0}")]
    Exit(i32),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The first launch of an unconfigured item offloads every layer; each
/// out-of-memory retry halves the count until a single layer remains.
pub fn initial_gpu_layers(requested: i64) -> i64 {
    if requested < 0 {
        99
    } else {
        requested
    }
}

pub fn halved_gpu_layers(current: i64) -> Option<i64> {
    if current > 1 {
        Some(current / 2)
    } else {
        None
    }
}

#[derive(Clone)]
struct ActiveChild {
    alias: String,
    child: Arc<tokio::sync::Mutex<Child>>,
    stopping: Arc<AtomicBool>,
}

/// Holder for the single live runtime child, shared between the queue loop
/// and the cancellation loop.
#[derive(Clone, Default)]
struct ActiveSlot(Arc<std::sync::Mutex<Option<ActiveChild>>>);

impl ActiveSlot {
    fn set(&self, value: Option<ActiveChild>) {
        *self.0.lock().expect("active slot poisoned") = value;
    }

    fn get(&self) -> Option<ActiveChild> {
        self.0.lock().expect("active slot poisoned").clone()
    }
}

pub fn start(state: AppState) -> Vec<TaskHandle> {
    let slot = ActiveSlot::default();
    vec![
        TaskHandle::new(
            "inference.queue",
            tokio::spawn(run_queue(state.clone(), slot.clone())),
        ),
        TaskHandle::new("inference.cancel", tokio::spawn(run_cancel_loop(state, slot))),
    ]
}

async fn run_queue(state: AppState, slot: ActiveSlot) {
    let cancel = state.shutdown_token();
    state
        .publish_wingman_service_status(ServiceStatus::Starting, None, None)
        .await;
    info!(target: "wingman::supervisor", "inference service started");
    state
        .publish_wingman_service_status(ServiceStatus::Ready, None, None)
        .await;

    while !cancel.is_cancelled() {
        match state.kernel().count_active_wingman_async().await {
            Ok(n) if n > 1 => {
                let detail = format!("found {n} active inference items; expected at most 1");
                error!(target: "wingman::supervisor", %detail, "single-active invariant violated");
                state
                    .publish_wingman_service_status(ServiceStatus::Error, None, Some(detail))
                    .await;
                state.request_shutdown();
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(target: "wingman::supervisor", %err, "active count query failed");
            }
        }

        match state.kernel().claim_next_queued_wingman_async().await {
            Ok(Some(item)) => {
                if !process_item(&state, &slot, item).await {
                    break;
                }
                state
                    .publish_wingman_service_status(ServiceStatus::Ready, None, None)
                    .await;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(target: "wingman::supervisor", %err, "queue claim failed");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(QUEUE_CHECK_INTERVAL) => {}
            _ = cancel.cancelled() => break,
        }
    }

    state
        .publish_wingman_service_status(ServiceStatus::Stopping, None, None)
        .await;
    state
        .publish_wingman_service_status(ServiceStatus::Stopped, None, None)
        .await;
    debug!(target: "wingman::supervisor", "inference service stopped");
}

/// Returns false when the supervisor must stop (fatal model-loading error).
async fn process_item(state: &AppState, slot: &ActiveSlot, mut item: WingmanItem) -> bool {
    let label = format!("{}: {}", item.model_repo, item.file_path);
    let models_dir = util::models_dir(&state.settings().home);
    let model_path = model_files::artifact_path(&models_dir, &item.model_repo, &item.file_path);

    let download_ok = matches!(
        state
            .kernel()
            .get_download_async(&item.model_repo, &item.file_path)
            .await,
        Ok(Some(d)) if d.status == wingman_kernel::DownloadItemStatus::Complete
    );
    if !download_ok || !model_path.exists() {
        warn!(target: "wingman::supervisor", item = %label, "model artifact missing");
        set_item_status(
            state,
            &item.alias,
            WingmanItemStatus::Error,
            Some(format!("Model file does not exist: {label}")),
        )
        .await;
        return true;
    }

    info!(target: "wingman::supervisor", item = %label, "processing inference");
    state
        .publish_wingman_service_status(ServiceStatus::Preparing, Some(item.alias.clone()), None)
        .await;

    match run_inference(state, slot, &mut item, &model_path).await {
        Ok(()) => {
            // the cancellation loop may already have finalized the row
            if let Ok(Some(row)) = state.kernel().get_wingman_async(&item.alias).await {
                if !row.status.is_completed() {
                    set_item_status(state, &item.alias, WingmanItemStatus::Complete, None).await;
                }
            }
            info!(target: "wingman::supervisor", item = %label, "inference complete");
            true
        }
        Err(InferenceError::ModelLoading) => {
            let msg = InferenceError::ModelLoading.to_string();
            error!(target: "wingman::supervisor", item = %label, %msg, "fatal model-loading failure");
            set_item_status(state, &item.alias, WingmanItemStatus::Error, Some(msg.clone())).await;
            state
                .publish_wingman_service_status(ServiceStatus::Error, None, Some(msg))
                .await;
            state.request_shutdown();
            false
        }
        Err(err) => {
            let msg = err.to_string();
            error!(target: "wingman::supervisor", item = %label, %msg, "inference failed");
            set_item_status(state, &item.alias, WingmanItemStatus::Error, Some(msg.clone())).await;
            state
                .publish_wingman_service_status(ServiceStatus::Error, None, Some(msg))
                .await;
            true
        }
    }
}

/// Launches the runtime, retrying with a halved GPU layer count on each
/// out-of-memory exit.
async fn run_inference(
    state: &AppState,
    slot: &ActiveSlot,
    item: &mut WingmanItem,
    model_path: &Path,
) -> Result<(), InferenceError> {
    let mut gpu_layers = initial_gpu_layers(item.gpu_layers);
    loop {
        let exit = launch_and_watch(state, slot, item, model_path, gpu_layers).await?;
        debug!(target: "wingman::supervisor", alias = %item.alias, ?exit, "runtime exited");
        match exit {
            RuntimeExit::Completed => return Ok(()),
            RuntimeExit::OutOfMemory => match halved_gpu_layers(gpu_layers) {
                Some(next) => {
                    info!(
                        target: "wingman::supervisor",
                        alias = %item.alias,
                        from = gpu_layers,
                        to = next,
                        "out of memory during load; retrying with fewer GPU layers"
                    );
                    gpu_layers = next;
                    item.gpu_layers = next;
                    if let Err(err) = state.kernel().set_wingman_async(item).await {
                        warn!(target: "wingman::supervisor", %err, "failed to persist reduced layer count");
                    }
                }
                None => return Err(InferenceError::OutOfMemory),
            },
            RuntimeExit::ModelLoadFailure => return Err(InferenceError::ModelLoading),
            RuntimeExit::StartupFailure => return Err(InferenceError::Startup),
            RuntimeExit::Other(code) => return Err(InferenceError::Exit(code)),
        }
    }
}

async fn launch_and_watch(
    state: &AppState,
    slot: &ActiveSlot,
    item: &WingmanItem,
    model_path: &Path,
    gpu_layers: i64,
) -> Result<RuntimeExit, InferenceError> {
    let settings = state.settings();
    let mut cmd = Command::new(&settings.runtime_bin);
    cmd.arg("--port")
        .arg(item.port.to_string())
        .arg("--ctx-size")
        .arg(item.context_size.to_string())
        .arg("--n-gpu-layers")
        .arg(gpu_layers.to_string())
        .arg("--model")
        .arg(model_path)
        .arg("--alias")
        .arg(&item.alias)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| anyhow!("failed to launch model runtime: {err}"))?;
    forward_child_stream(child.stdout.take(), &item.alias, "stdout");
    forward_child_stream(child.stderr.take(), &item.alias, "stderr");

    let child = Arc::new(tokio::sync::Mutex::new(child));
    let stopping = Arc::new(AtomicBool::new(false));
    slot.set(Some(ActiveChild {
        alias: item.alias.clone(),
        child: child.clone(),
        stopping: stopping.clone(),
    }));

    let shutdown = state.shutdown_token();
    let health_url = format!("http://{}:{}/health", item.address, item.port);
    let timings_url = format!("http://{}:{}/timings", item.address, item.port);
    let mut ready = false;
    let mut last_report: Option<Value> = None;
    let mut next_metrics = Instant::now();

    let code: Option<i32> = loop {
        {
            let mut guard = child.lock().await;
            match guard.try_wait() {
                Ok(Some(status)) => break status.code(),
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "wingman::supervisor", %err, "child wait failed");
                    break None;
                }
            }
        }

        if shutdown.is_cancelled() && !stopping.swap(true, Ordering::SeqCst) {
            debug!(target: "wingman::supervisor", alias = %item.alias, "shutdown requested; stopping runtime");
            let mut guard = child.lock().await;
            let _ = guard.start_kill();
        }

        if !ready {
            if probe_runtime(state, &health_url).await {
                ready = true;
                set_item_status(state, &item.alias, WingmanItemStatus::Inferring, None).await;
                state
                    .publish_wingman_service_status(
                        ServiceStatus::Inferring,
                        Some(item.alias.clone()),
                        None,
                    )
                    .await;
            }
        } else if Instant::now() >= next_metrics {
            match fetch_timings(state, &timings_url).await {
                Some(report) => {
                    let busy = last_report.as_ref() != Some(&report);
                    next_metrics = Instant::now()
                        + if busy {
                            METRICS_BUSY_INTERVAL
                        } else {
                            METRICS_IDLE_INTERVAL
                        };
                    last_report = Some(report.clone());
                    state
                        .hub()
                        .enqueue("inference.metrics", json!({"alias": item.alias, "timings": report}));
                }
                None => {
                    next_metrics = Instant::now() + METRICS_IDLE_INTERVAL;
                }
            }
        }
        tokio::time::sleep(CHILD_POLL_INTERVAL).await;
    };

    slot.set(None);
    if stopping.load(Ordering::SeqCst) {
        // a requested stop is a clean completion regardless of the code the
        // kill produced
        return Ok(RuntimeExit::Completed);
    }
    Ok(RuntimeExit::from_code(code))
}

fn forward_child_stream(
    stream: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    alias: &str,
    which: &'static str,
) {
    let Some(stream) = stream else { return };
    let alias = alias.to_string();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "wingman::runtime", alias = %alias, stream = which, "{line}");
        }
    });
}

async fn probe_runtime(state: &AppState, url: &str) -> bool {
    state
        .http()
        .get(url)
        .timeout(Duration::from_secs(1))
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false)
}

async fn fetch_timings(state: &AppState, url: &str) -> Option<Value> {
    let resp = state
        .http()
        .get(url)
        .timeout(Duration::from_secs(1))
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?;
    resp.json().await.ok()
}

/// Updates the row and publishes the current-item frame.
async fn set_item_status(
    state: &AppState,
    alias: &str,
    status: WingmanItemStatus,
    error: Option<String>,
) {
    if let Err(err) = state
        .kernel()
        .update_wingman_status_async(alias, status, error)
        .await
    {
        warn!(target: "wingman::supervisor", %err, alias, "status update failed");
    }
    if let Ok(Some(row)) = state.kernel().get_wingman_async(alias).await {
        state
            .hub()
            .enqueue("inference.status", json!({"currentWingmanInferenceItem": row}));
    }
}

async fn run_cancel_loop(state: AppState, slot: ActiveSlot) {
    let cancel = state.shutdown_token();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(CANCEL_CHECK_INTERVAL) => {}
            _ = cancel.cancelled() => break,
        }
        let items = match state
            .kernel()
            .get_wingman_by_status_async(WingmanItemStatus::Cancelling)
            .await
        {
            Ok(items) => items,
            Err(err) => {
                warn!(target: "wingman::supervisor", %err, "cancelling scan failed");
                continue;
            }
        };
        for item in items {
            debug!(
                target: "wingman::supervisor",
                "stopping inference of {}: {}", item.model_repo, item.file_path
            );
            stop_active_child(&state, &slot, &item.alias).await;
            set_item_status(&state, &item.alias, WingmanItemStatus::Complete, None).await;
            // let the runtime's port release before the next launch
            tokio::time::sleep(state.settings().post_stop_delay).await;
            debug!(
                target: "wingman::supervisor",
                "stopped inference of {}: {}", item.model_repo, item.file_path
            );
        }
    }
}

async fn stop_active_child(state: &AppState, slot: &ActiveSlot, alias: &str) {
    let Some(active) = slot.get() else { return };
    if active.alias != alias {
        return;
    }
    active.stopping.store(true, Ordering::SeqCst);
    {
        let mut guard = active.child.lock().await;
        if let Err(err) = guard.start_kill() {
            warn!(target: "wingman::supervisor", %err, alias, "runtime kill failed");
        }
    }
    let deadline = Instant::now() + state.settings().inference_stop_timeout;
    loop {
        {
            let mut guard = active.child.lock().await;
            if matches!(guard.try_wait(), Ok(Some(_))) {
                return;
            }
        }
        if Instant::now() >= deadline {
            warn!(target: "wingman::supervisor", alias, "timeout waiting for runtime exit");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ---------- stop/wait used by the control API ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequestOutcome {
    Stopped,
    TimedOut,
}

/// Waits until the named item (or every item) reaches a completed status.
pub async fn wait_for_inference_to_stop(
    state: &AppState,
    alias: Option<&str>,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let items = match alias {
            Some(alias) => state
                .kernel()
                .get_wingman_async(alias)
                .await
                .map(|item| item.into_iter().collect::<Vec<_>>()),
            None => state.kernel().get_all_wingman_async().await,
        };
        // a read failure is not evidence the item stopped
        if let Ok(items) = items {
            if items.iter().all(|i| i.status.is_completed()) {
                return true;
            }
        }
        if Instant::now() >= deadline {
            warn!(
                target: "wingman::supervisor",
                "timeout waiting for {} to stop",
                alias.unwrap_or("all")
            );
            return false;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Flips the row to `cancelling` and waits for the cancellation loop to
/// finish it. Already-completed rows return immediately.
pub async fn request_stop(
    state: &AppState,
    alias: &str,
    timeout: Duration,
) -> anyhow::Result<StopRequestOutcome> {
    let item = state
        .kernel()
        .get_wingman_async(alias)
        .await?
        .ok_or_else(|| anyhow!("alias {alias} not found"))?;
    if item.status.is_completed() {
        return Ok(StopRequestOutcome::Stopped);
    }
    state
        .kernel()
        .update_wingman_status_async(alias, WingmanItemStatus::Cancelling, None)
        .await?;
    if wait_for_inference_to_stop(state, Some(alias), timeout).await {
        Ok(StopRequestOutcome::Stopped)
    } else {
        Ok(StopRequestOutcome::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::hub::Hub;
    use wingman_events::Bus;
    use wingman_kernel::Kernel;

    fn test_state(home: &Path) -> AppState {
        util::ensure_home_layout(home).unwrap();
        let kernel = Kernel::open(home).unwrap();
        let bus = Bus::new(16);
        let hub = Hub::new(bus.clone(), util::logs_dir(home));
        let mut settings = Settings::from_env();
        settings.home = home.to_path_buf();
        AppState::new(bus, kernel, hub, settings)
    }

    fn queued_item(alias: &str) -> WingmanItem {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        WingmanItem {
            alias: alias.into(),
            model_repo: "X".into(),
            file_path: "y.gguf".into(),
            status: WingmanItemStatus::Queued,
            address: "localhost".into(),
            port: 6567,
            context_size: 0,
            gpu_layers: -1,
            error: None,
            created: now.clone(),
            updated: now,
        }
    }

    #[test]
    fn exit_codes_map_to_variants() {
        assert_eq!(RuntimeExit::from_code(Some(0)), RuntimeExit::Completed);
        assert_eq!(RuntimeExit::from_code(Some(100)), RuntimeExit::OutOfMemory);
        assert_eq!(
            RuntimeExit::from_code(Some(1024)),
            RuntimeExit::ModelLoadFailure
        );
        assert_eq!(RuntimeExit::from_code(Some(1)), RuntimeExit::StartupFailure);
        assert_eq!(RuntimeExit::from_code(Some(7)), RuntimeExit::Other(7));
        assert_eq!(RuntimeExit::from_code(None), RuntimeExit::Other(-1));
    }

    #[test]
    fn gpu_layer_retry_sequence_halves_to_one() {
        let mut layers = initial_gpu_layers(-1);
        assert_eq!(layers, 99);
        let mut seen = vec![layers];
        while let Some(next) = halved_gpu_layers(layers) {
            layers = next;
            seen.push(layers);
        }
        assert_eq!(seen, vec![99, 49, 24, 12, 6, 3, 1]);
        assert_eq!(halved_gpu_layers(1), None);
        assert_eq!(initial_gpu_layers(40), 40);
    }

    #[tokio::test]
    async fn request_stop_times_out_when_nothing_consumes_cancelling() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        state
            .kernel()
            .set_wingman_async(&queued_item("a1"))
            .await
            .unwrap();
        let outcome = request_stop(&state, "a1", Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, StopRequestOutcome::TimedOut);
        let row = state.kernel().get_wingman_async("a1").await.unwrap().unwrap();
        assert_eq!(row.status, WingmanItemStatus::Cancelling);
    }

    #[tokio::test]
    async fn request_stop_returns_once_the_row_completes() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        state
            .kernel()
            .set_wingman_async(&queued_item("a1"))
            .await
            .unwrap();
        let finisher = {
            let state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                state
                    .kernel()
                    .update_wingman_status_async("a1", WingmanItemStatus::Complete, None)
                    .await
                    .unwrap();
            })
        };
        let outcome = request_stop(&state, "a1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, StopRequestOutcome::Stopped);
        finisher.await.unwrap();
    }

    #[tokio::test]
    async fn request_stop_on_completed_row_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut item = queued_item("a1");
        item.status = WingmanItemStatus::Complete;
        state.kernel().set_wingman_async(&item).await.unwrap();
        let outcome = request_stop(&state, "a1", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(outcome, StopRequestOutcome::Stopped);
    }
}
