//! Download worker.
//!
//! Single consumer of the download queue: one transfer at a time, ordered by
//! the store's FIFO claim. Progress lands in the row and on the hub at most
//! every `PROGRESS_THROTTLE`; a client cancelling the row is observed at the
//! same cadence and aborts the transfer at the next chunk boundary.

use anyhow::{Context, Result};
use futures_util::StreamExt as _;
use serde_json::json;
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::AsyncWriteExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::config::{PROGRESS_THROTTLE, QUEUE_CHECK_INTERVAL};
use crate::tasks::TaskHandle;
use crate::{model_files, util};
use wingman_kernel::{DownloadItem, DownloadItemStatus, ServiceStatus};

pub fn start(state: AppState) -> TaskHandle {
    TaskHandle::new("downloads.worker", tokio::spawn(run(state)))
}

enum TransferOutcome {
    Completed,
    Cancelled,
}

async fn run(state: AppState) {
    let cancel = state.shutdown_token();
    state
        .publish_download_service_status(ServiceStatus::Starting, None, None)
        .await;
    if let Err(err) = state.kernel().reset_downloads_async().await {
        warn!(target: "wingman::downloads", %err, "queue reset failed");
    }
    run_orphan_cleanup(&state).await;
    info!(target: "wingman::downloads", "download service started");

    while !cancel.is_cancelled() {
        state
            .publish_download_service_status(ServiceStatus::Ready, None, None)
            .await;
        match state.kernel().claim_next_queued_download_async().await {
            Ok(Some(item)) => {
                let label = format!("{}: {}", item.model_repo, item.file_path);
                info!(target: "wingman::downloads", item = %label, "processing download");
                state
                    .publish_download_service_status(
                        ServiceStatus::Preparing,
                        Some(item.clone()),
                        None,
                    )
                    .await;
                match stream_transfer(&state, item.clone(), &cancel).await {
                    Ok(TransferOutcome::Completed) => {
                        info!(target: "wingman::downloads", item = %label, "download complete");
                    }
                    Ok(TransferOutcome::Cancelled) => {
                        info!(target: "wingman::downloads", item = %label, "download cancelled");
                    }
                    Err(err) => {
                        warn!(target: "wingman::downloads", item = %label, %err, "download failed");
                        let mut failed = item;
                        failed.status = DownloadItemStatus::Error;
                        failed.error = Some(err.to_string());
                        if let Err(err) = state.kernel().set_download_async(&failed).await {
                            warn!(target: "wingman::downloads", %err, "failed to record download error");
                        }
                        state
                            .publish_download_service_status(
                                ServiceStatus::Error,
                                Some(failed),
                                Some(err.to_string()),
                            )
                            .await;
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(target: "wingman::downloads", %err, "queue claim failed");
            }
        }
        run_orphan_cleanup(&state).await;
        tokio::select! {
            _ = tokio::time::sleep(QUEUE_CHECK_INTERVAL) => {}
            _ = cancel.cancelled() => break,
        }
    }

    state
        .publish_download_service_status(ServiceStatus::Stopping, None, None)
        .await;
    state
        .publish_download_service_status(ServiceStatus::Stopped, None, None)
        .await;
    debug!(target: "wingman::downloads", "download service stopped");
}

async fn stream_transfer(
    state: &AppState,
    mut item: DownloadItem,
    cancel: &CancellationToken,
) -> Result<TransferOutcome> {
    let models_dir = util::models_dir(&state.settings().home);
    let partial = model_files::partial_path(&models_dir, &item.model_repo, &item.file_path);
    let target = model_files::artifact_path(&models_dir, &item.model_repo, &item.file_path);
    let url = model_files::download_url(&item.model_repo, &item.file_path);

    let response = state
        .http()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("request to {url} failed"))?
        .error_for_status()
        .with_context(|| format!("server rejected {url}"))?;
    item.total_bytes = response.content_length().map(|l| l as i64).unwrap_or(0);

    let mut file = tokio::fs::File::create(&partial)
        .await
        .with_context(|| format!("create {}", partial.display()))?;
    let mut stream = response.bytes_stream();
    let mut last_emit = Instant::now() - PROGRESS_THROTTLE;

    loop {
        let next = tokio::select! {
            chunk = stream.next() => chunk,
            _ = cancel.cancelled() => {
                discard_partial(&partial).await;
                return Ok(TransferOutcome::Cancelled);
            }
        };
        match next {
            Some(Ok(bytes)) => {
                file.write_all(&bytes)
                    .await
                    .with_context(|| format!("write {}", partial.display()))?;
                item.downloaded_bytes += bytes.len() as i64;
                if item.total_bytes > 0 {
                    item.progress =
                        100.0 * item.downloaded_bytes as f64 / item.total_bytes as f64;
                }
                if last_emit.elapsed() >= PROGRESS_THROTTLE {
                    last_emit = Instant::now();
                    if row_was_cancelled(state, &item).await {
                        drop(file);
                        discard_partial(&partial).await;
                        return Ok(TransferOutcome::Cancelled);
                    }
                    state.kernel().set_download_async(&item).await?;
                    state.hub().enqueue("download.progress", json!(item));
                }
            }
            Some(Err(err)) => {
                drop(file);
                discard_partial(&partial).await;
                return Err(err).context("transfer interrupted");
            }
            None => break,
        }
    }

    file.flush().await?;
    drop(file);
    tokio::fs::rename(&partial, &target)
        .await
        .with_context(|| format!("rename into {}", target.display()))?;

    if item.total_bytes == 0 {
        item.total_bytes = item.downloaded_bytes;
    }
    item.progress = 100.0;
    item.status = DownloadItemStatus::Complete;
    item.error = None;
    state.kernel().set_download_async(&item).await?;
    state.hub().enqueue("download.progress", json!(item));
    debug!(
        target: "wingman::downloads",
        "{}: {} of {}",
        item.model_repo,
        util::pretty_bytes(item.downloaded_bytes),
        util::pretty_bytes(item.total_bytes)
    );
    Ok(TransferOutcome::Completed)
}

async fn row_was_cancelled(state: &AppState, item: &DownloadItem) -> bool {
    matches!(
        state
            .kernel()
            .get_download_async(&item.model_repo, &item.file_path)
            .await,
        Ok(Some(row)) if row.status == DownloadItemStatus::Cancelled
    )
}

async fn discard_partial(partial: &PathBuf) {
    if let Err(err) = tokio::fs::remove_file(partial).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(target: "wingman::downloads", %err, "partial file cleanup failed");
        }
    }
}

/// Two-way reconciliation between the downloads table and `models/`:
/// complete rows without a file lose the row; files without a row are
/// deleted. Partial transfers (`.part`) are never parsed as items.
pub async fn run_orphan_cleanup(state: &AppState) {
    let models_dir = util::models_dir(&state.settings().home);
    let kernel = state.kernel();

    match kernel.get_all_downloads_async().await {
        Ok(rows) => {
            for row in rows {
                if row.status != DownloadItemStatus::Complete {
                    continue;
                }
                let path = model_files::artifact_path(&models_dir, &row.model_repo, &row.file_path);
                if !path.exists() {
                    info!(
                        target: "wingman::downloads",
                        "removing orphaned row {}: {} (file missing)",
                        row.model_repo, row.file_path
                    );
                    if let Err(err) = kernel
                        .remove_download_async(&row.model_repo, &row.file_path)
                        .await
                    {
                        warn!(target: "wingman::downloads", %err, "orphaned row removal failed");
                    }
                }
            }
        }
        Err(err) => warn!(target: "wingman::downloads", %err, "orphan scan failed"),
    }

    let mut entries = match tokio::fs::read_dir(&models_dir).await {
        Ok(entries) => entries,
        Err(_) => return,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((model_repo, file_path)) = model_files::parse_safe_file_name(name) else {
            continue;
        };
        let known = matches!(
            kernel.get_download_async(&model_repo, &file_path).await,
            Ok(Some(_))
        );
        if !known {
            info!(
                target: "wingman::downloads",
                "removing orphaned file {} from disk", name
            );
            if let Err(err) = tokio::fs::remove_file(entry.path()).await {
                warn!(target: "wingman::downloads", %err, "orphaned file removal failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::hub::Hub;
    use wingman_events::Bus;
    use wingman_kernel::Kernel;

    fn test_state(home: &std::path::Path) -> AppState {
        util::ensure_home_layout(home).unwrap();
        let kernel = Kernel::open(home).unwrap();
        let bus = Bus::new(16);
        let hub = Hub::new(bus.clone(), util::logs_dir(home));
        let mut settings = Settings::from_env();
        settings.home = home.to_path_buf();
        AppState::new(bus, kernel, hub, settings)
    }

    #[tokio::test]
    async fn cleanup_removes_complete_rows_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let mut item = state
            .kernel()
            .enqueue_download_async("X", "y.bin")
            .await
            .unwrap();
        item.status = DownloadItemStatus::Complete;
        state.kernel().set_download_async(&item).await.unwrap();

        run_orphan_cleanup(&state).await;
        assert!(state
            .kernel()
            .get_download_async("X", "y.bin")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cleanup_keeps_complete_rows_with_files() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let models = util::models_dir(dir.path());
        std::fs::write(model_files::artifact_path(&models, "X", "y.bin"), b"weights").unwrap();
        let mut item = state
            .kernel()
            .enqueue_download_async("X", "y.bin")
            .await
            .unwrap();
        item.status = DownloadItemStatus::Complete;
        state.kernel().set_download_async(&item).await.unwrap();

        run_orphan_cleanup(&state).await;
        assert!(state
            .kernel()
            .get_download_async("X", "y.bin")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn cleanup_deletes_stray_artifacts_but_not_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let models = util::models_dir(dir.path());
        let stray = model_files::artifact_path(&models, "gone/repo", "m.gguf");
        std::fs::write(&stray, b"stale").unwrap();
        let foreign = models.join("README.txt");
        std::fs::write(&foreign, b"keep me").unwrap();
        let partial = model_files::partial_path(&models, "active/repo", "m.gguf");
        std::fs::write(&partial, b"in flight").unwrap();

        run_orphan_cleanup(&state).await;
        assert!(!stray.exists());
        assert!(foreign.exists());
        assert!(partial.exists());
    }
}
