//! Metrics fan-out hub.
//!
//! One value owns everything the live channel needs: the frame queue, the
//! subscriber registry, and the rolling `timing_metrics.json` writer.
//! Producers on any task call [`Hub::enqueue`]; only the drain task touches
//! subscriber transports, so the send side never races the WebSocket tasks.
//! Each frame is also mirrored onto the in-process bus for local listeners.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::tasks::TaskHandle;
use wingman_events::Bus;

/// Frames buffered toward one subscriber beyond this are dropped (the
/// subscriber stays connected).
const MAX_SUBSCRIBER_BUFFER: u64 = 128 * 1024 * 1024;

const METRICS_FILE: &str = "timing_metrics.json";

pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<String>,
    pub buffered: Arc<AtomicU64>,
}

struct Subscriber {
    tx: mpsc::UnboundedSender<String>,
    buffered: Arc<AtomicU64>,
    dropped: u64,
}

pub struct Hub {
    bus: Bus,
    queue: Mutex<VecDeque<Value>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    metrics_path: PathBuf,
}

impl Hub {
    pub fn new(bus: Bus, logs_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            bus,
            queue: Mutex::new(VecDeque::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics_path: logs_dir.join(METRICS_FILE),
        })
    }

    /// Safe to call from any task.
    pub fn enqueue(&self, kind: &str, frame: Value) {
        self.bus.publish(kind, &frame);
        self.queue.lock().expect("hub queue poisoned").push_back(frame);
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicU64::new(0));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().expect("hub subscribers poisoned").insert(
            id,
            Subscriber {
                tx,
                buffered: buffered.clone(),
                dropped: 0,
            },
        );
        Subscription { id, rx, buffered }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("hub subscribers poisoned")
            .remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("hub subscribers poisoned")
            .len()
    }

    /// Truncates the metrics file and opens a fresh array.
    pub fn write_start_marker(&self) {
        let _ = std::fs::remove_file(&self.metrics_path);
        self.append_raw("[\n");
    }

    /// Closes the array on clean shutdown.
    pub fn write_stop_marker(&self) {
        self.append_raw("{}]\n");
    }

    fn append_raw(&self, text: &str) {
        if let Some(parent) = self.metrics_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(&self.metrics_path) {
            Ok(mut f) => {
                if let Err(err) = f.write_all(text.as_bytes()) {
                    warn!(target: "wingman::hub", %err, "timing metrics write failed");
                }
            }
            Err(err) => {
                warn!(target: "wingman::hub", %err, "timing metrics open failed");
            }
        }
    }

    /// Drains the pending frames to every subscriber and the metrics file.
    /// FIFO; a failed delivery is logged and the frame is lost for that
    /// subscriber only.
    pub fn drain(&self) {
        let frames: Vec<Value> = {
            let mut queue = self.queue.lock().expect("hub queue poisoned");
            queue.drain(..).collect()
        };
        if frames.is_empty() {
            return;
        }
        let mut closed: Vec<u64> = Vec::new();
        {
            let mut subs = self.subscribers.lock().expect("hub subscribers poisoned");
            for frame in &frames {
                let text = frame.to_string();
                for (id, sub) in subs.iter_mut() {
                    let pending = sub.buffered.load(Ordering::Relaxed);
                    if pending + text.len() as u64 > MAX_SUBSCRIBER_BUFFER {
                        sub.dropped += 1;
                        if sub.dropped % 1000 == 1 {
                            debug!(target: "wingman::hub", subscriber = id, dropped = sub.dropped,
                                   "subscriber over buffer budget; dropping frames");
                        }
                        continue;
                    }
                    match sub.tx.send(text.clone()) {
                        Ok(()) => {
                            sub.buffered.fetch_add(text.len() as u64, Ordering::Relaxed);
                        }
                        Err(_) => {
                            closed.push(*id);
                        }
                    }
                }
                for id in closed.drain(..) {
                    debug!(target: "wingman::hub", subscriber = id, "subscriber transport closed");
                    subs.remove(&id);
                }
            }
        }
        let mut out = String::new();
        for frame in &frames {
            out.push_str(&frame.to_string());
            out.push_str(",\n");
        }
        self.append_raw(&out);
    }

    /// 1 Hz drain loop; closes the metrics array when cancelled.
    pub fn start_drainer(self: &Arc<Self>, cancel: CancellationToken) -> TaskHandle {
        let hub = self.clone();
        TaskHandle::new(
            "hub.drain",
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = tick.tick() => hub.drain(),
                        _ = cancel.cancelled() => break,
                    }
                }
                hub.drain();
                hub.write_stop_marker();
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_hub() -> (tempfile::TempDir, Arc<Hub>) {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(Bus::new(16), dir.path().to_path_buf());
        (dir, hub)
    }

    #[tokio::test]
    async fn drain_delivers_fifo_to_subscriber() {
        let (_dir, hub) = temp_hub();
        let mut sub = hub.subscribe();
        hub.enqueue("tick", json!({"i": 1}));
        hub.enqueue("tick", json!({"i": 2}));
        hub.drain();
        let first = sub.rx.recv().await.unwrap();
        let second = sub.rx.recv().await.unwrap();
        assert!(first.contains("\"i\":1"));
        assert!(second.contains("\"i\":2"));
    }

    #[tokio::test]
    async fn closed_subscriber_is_removed_on_drain() {
        let (_dir, hub) = temp_hub();
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub.rx);
        hub.enqueue("tick", json!({}));
        hub.drain();
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn metrics_file_markers_bracket_the_array() {
        let (dir, hub) = temp_hub();
        hub.write_start_marker();
        hub.enqueue("tick", json!({"a": 1}));
        hub.drain();
        hub.write_stop_marker();
        let text = std::fs::read_to_string(dir.path().join(METRICS_FILE)).unwrap();
        assert!(text.starts_with("[\n"));
        assert!(text.ends_with("{}]\n"));
        let parsed: Value = serde_json::from_str(&text).expect("valid JSON array");
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(parsed[0]["a"], 1);
    }

    #[test]
    fn start_marker_truncates_previous_run() {
        let (dir, hub) = temp_hub();
        hub.write_start_marker();
        hub.enqueue("tick", json!({"old": true}));
        hub.drain();
        hub.write_start_marker();
        hub.write_stop_marker();
        let text = std::fs::read_to_string(dir.path().join(METRICS_FILE)).unwrap();
        assert!(!text.contains("old"));
    }

    #[test]
    fn frames_mirror_onto_the_bus() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::new(16);
        let hub = Hub::new(bus.clone(), dir.path().to_path_buf());
        hub.enqueue("download.progress", json!({"progress": 1.0}));
        let recent = bus.replay(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, "download.progress");
    }
}
