use serde::{Deserialize, Serialize};

/// Download queue states. `queued` rows are claimed FIFO by the downloader;
/// `complete` rows must have their artifact on disk (orphan cleanup removes
/// the row otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadItemStatus {
    Queued,
    Downloading,
    Complete,
    Error,
    Cancelled,
}

impl DownloadItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadItemStatus::Queued => "queued",
            DownloadItemStatus::Downloading => "downloading",
            DownloadItemStatus::Complete => "complete",
            DownloadItemStatus::Error => "error",
            DownloadItemStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "downloading" => Some(Self::Downloading),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WingmanItemStatus {
    Queued,
    Preparing,
    Inferring,
    Cancelling,
    Complete,
    Cancelled,
    Error,
    Unknown,
}

impl WingmanItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WingmanItemStatus::Queued => "queued",
            WingmanItemStatus::Preparing => "preparing",
            WingmanItemStatus::Inferring => "inferring",
            WingmanItemStatus::Cancelling => "cancelling",
            WingmanItemStatus::Complete => "complete",
            WingmanItemStatus::Cancelled => "cancelled",
            WingmanItemStatus::Error => "error",
            WingmanItemStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "preparing" => Some(Self::Preparing),
            "inferring" => Some(Self::Inferring),
            "cancelling" => Some(Self::Cancelling),
            "complete" => Some(Self::Complete),
            "cancelled" => Some(Self::Cancelled),
            "error" => Some(Self::Error),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            WingmanItemStatus::Queued
                | WingmanItemStatus::Preparing
                | WingmanItemStatus::Inferring
                | WingmanItemStatus::Cancelling
        )
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            WingmanItemStatus::Complete | WingmanItemStatus::Cancelled | WingmanItemStatus::Error
        )
    }
}

/// One model artifact download, keyed by `(modelRepo, filePath)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItem {
    pub model_repo: String,
    pub file_path: String,
    pub status: DownloadItemStatus,
    pub total_bytes: i64,
    pub downloaded_bytes: i64,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created: String,
    pub updated: String,
}

/// One inference session, keyed by the client-chosen alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WingmanItem {
    pub alias: String,
    pub model_repo: String,
    pub file_path: String,
    pub status: WingmanItemStatus,
    pub address: String,
    pub port: i64,
    pub context_size: i64,
    pub gpu_layers: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created: String,
    pub updated: String,
}

/// Named blob holding a service's last published status; one row per
/// `(name, key)` with key defaulting to "default".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppItem {
    pub name: String,
    pub key: String,
    pub value: String,
    pub created: String,
    pub updated: String,
}

impl AppItem {
    pub fn make(name: &str) -> Self {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        Self {
            name: name.to_string(),
            key: "default".to_string(),
            value: "{}".to_string(),
            created: now.clone(),
            updated: now,
        }
    }
}

/// Shared lifecycle vocabulary for the two service status blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Ready,
    Preparing,
    Downloading,
    Inferring,
    Stopping,
    Stopped,
    Error,
    Unknown,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        ServiceStatus::Unknown
    }
}

/// Typed projection of the DownloadService AppItem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadServerAppItem {
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_download: Option<DownloadItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Typed projection of the WingmanService AppItem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WingmanServiceAppItem {
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Stored retrieval chunk; the embedding vector lives in the row as a
/// little-endian f32 blob and is not serialized back out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalChunk {
    pub id: i64,
    pub source: String,
    pub chunk: String,
    pub created: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_status_round_trips_lowercase() {
        for s in [
            DownloadItemStatus::Queued,
            DownloadItemStatus::Downloading,
            DownloadItemStatus::Complete,
            DownloadItemStatus::Error,
            DownloadItemStatus::Cancelled,
        ] {
            let text = serde_json::to_string(&s).unwrap();
            assert_eq!(text, format!("\"{}\"", s.as_str()));
            assert_eq!(DownloadItemStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn wingman_status_partitions_active_and_completed() {
        let active = [
            WingmanItemStatus::Queued,
            WingmanItemStatus::Preparing,
            WingmanItemStatus::Inferring,
            WingmanItemStatus::Cancelling,
        ];
        let completed = [
            WingmanItemStatus::Complete,
            WingmanItemStatus::Cancelled,
            WingmanItemStatus::Error,
        ];
        for s in active {
            assert!(s.is_active() && !s.is_completed(), "{}", s.as_str());
        }
        for s in completed {
            assert!(s.is_completed() && !s.is_active(), "{}", s.as_str());
        }
        assert!(!WingmanItemStatus::Unknown.is_active());
        assert!(!WingmanItemStatus::Unknown.is_completed());
    }

    #[test]
    fn items_serialize_camel_case() {
        let item = DownloadItem {
            model_repo: "X".into(),
            file_path: "y.bin".into(),
            status: DownloadItemStatus::Queued,
            total_bytes: 0,
            downloaded_bytes: 0,
            progress: 0.0,
            error: None,
            created: "2024-01-01T00:00:00.000Z".into(),
            updated: "2024-01-01T00:00:00.000Z".into(),
        };
        let v = serde_json::to_value(&item).unwrap();
        assert_eq!(v["modelRepo"], "X");
        assert_eq!(v["filePath"], "y.bin");
        assert_eq!(v["status"], "queued");
        assert!(v.get("error").is_none());
    }
}
