use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Settings;
use crate::hub::Hub;
use wingman_events::Bus;
use wingman_kernel::{
    AppItem, DownloadItem, DownloadServerAppItem, Kernel, ServiceStatus, WingmanServiceAppItem,
};

pub const DOWNLOAD_SERVICE: &str = "DownloadService";
pub const WINGMAN_SERVICE: &str = "WingmanService";

/// Shared handle passed to every worker and request handler.
#[derive(Clone)]
pub struct AppState {
    bus: Bus,
    kernel: Kernel,
    hub: Arc<Hub>,
    settings: Arc<Settings>,
    shutdown: CancellationToken,
    start_lock: Arc<tokio::sync::Mutex<()>>,
    http: reqwest::Client,
}

impl AppState {
    pub fn new(bus: Bus, kernel: Kernel, hub: Arc<Hub>, settings: Settings) -> Self {
        // no whole-request timeout: artifact transfers run for as long as
        // they need; latency-sensitive calls set their own
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            bus,
            kernel,
            hub,
            settings: Arc::new(settings),
            shutdown: CancellationToken::new(),
            start_lock: Arc::new(tokio::sync::Mutex::new(())),
            http,
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Non-reentrant guard around the start-inference operation.
    pub fn start_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.start_lock
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Updates the DownloadService status blob and publishes it as a frame.
    pub async fn publish_download_service_status(
        &self,
        status: ServiceStatus,
        current_download: Option<DownloadItem>,
        error: Option<String>,
    ) {
        let mut blob = self
            .read_service_blob::<DownloadServerAppItem>(DOWNLOAD_SERVICE)
            .await
            .unwrap_or_default();
        blob.status = status;
        if error.is_some() {
            blob.error = error;
        }
        blob.current_download = current_download;
        self.write_service_blob(DOWNLOAD_SERVICE, &blob).await;
        self.hub
            .enqueue("service.status", json!({ DOWNLOAD_SERVICE: blob }));
    }

    /// Updates the WingmanService status blob and publishes it as a frame.
    pub async fn publish_wingman_service_status(
        &self,
        status: ServiceStatus,
        alias: Option<String>,
        error: Option<String>,
    ) {
        let mut blob = self
            .read_service_blob::<WingmanServiceAppItem>(WINGMAN_SERVICE)
            .await
            .unwrap_or_default();
        blob.status = status;
        if error.is_some() {
            blob.error = error;
        }
        if alias.is_some() {
            blob.alias = alias;
        }
        self.write_service_blob(WINGMAN_SERVICE, &blob).await;
        self.hub
            .enqueue("service.status", json!({ WINGMAN_SERVICE: blob }));
    }

    pub async fn read_service_blob<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        let item = self.kernel.get_app_async(name, "default").await.ok()??;
        serde_json::from_str(&item.value).ok()
    }

    async fn write_service_blob<T: serde::Serialize>(&self, name: &str, blob: &T) {
        let mut item = match self.kernel.get_app_async(name, "default").await {
            Ok(Some(item)) => item,
            Ok(None) => AppItem::make(name),
            Err(err) => {
                warn!(target: "wingman::state", %err, name, "service status read failed");
                return;
            }
        };
        match serde_json::to_string(blob) {
            Ok(value) => {
                item.value = value;
                if let Err(err) = self.kernel.set_app_async(&item).await {
                    warn!(target: "wingman::state", %err, name, "service status write failed");
                }
            }
            Err(err) => {
                warn!(target: "wingman::state", %err, name, "service status serialize failed");
            }
        }
    }
}
