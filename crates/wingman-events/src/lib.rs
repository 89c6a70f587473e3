use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Minimal event envelope (RFC3339 time, millisecond precision).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    lagged: AtomicU64,
    no_receivers: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub lagged: u64,
    pub no_receivers: u64,
    pub receivers: usize,
}

/// Local in-process bus backed by a tokio broadcast channel.
///
/// Every component that produces metric frames or status updates publishes
/// here; the hub and any diagnostic listeners subscribe. A bounded replay
/// buffer lets late subscribers catch up on recent frames.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
    counters: Arc<Counters>,
    replay: Arc<Mutex<VecDeque<Envelope>>>,
    replay_cap: usize,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        Self::new_with_replay(capacity, 256)
    }

    pub fn new_with_replay(capacity: usize, replay_cap: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            counters: Arc::new(Counters::default()),
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(replay_cap))),
            replay_cap,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser": "error"}));
        let env = Envelope {
            time: now,
            kind: kind.to_string(),
            payload: val,
        };
        self.send_env(env);
    }

    fn send_env(&self, env: Envelope) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        match self.tx.send(env.clone()) {
            Ok(n) => {
                self.counters
                    .delivered
                    .fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(_e) => {
                self.counters.no_receivers.fetch_add(1, Ordering::Relaxed);
            }
        }
        let mut rb = self.replay.lock().unwrap();
        if rb.len() == self.replay_cap {
            rb.pop_front();
        }
        rb.push_back(env);
    }

    pub fn note_lag(&self, n: u64) {
        self.counters.lagged.fetch_add(n, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            lagged: self.counters.lagged.load(Ordering::Relaxed),
            no_receivers: self.counters.no_receivers.load(Ordering::Relaxed),
            receivers: self.tx.receiver_count(),
        }
    }

    /// Returns up to `n` recent envelopes from the replay buffer, oldest first.
    pub fn replay(&self, n: usize) -> Vec<Envelope> {
        let rb = self.replay.lock().unwrap();
        let len = rb.len();
        let take = n.min(len);
        rb.iter().skip(len.saturating_sub(take)).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        bus.publish("download.progress", &json!({"progress": 42.0}));
        let env = rx.recv().await.expect("envelope");
        assert_eq!(env.kind, "download.progress");
        assert_eq!(env.payload["progress"], json!(42.0));
        let stats = bus.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn publish_without_receiver_is_counted() {
        let bus = Bus::new(16);
        bus.publish("service.status", &json!({"status": "ready"}));
        assert_eq!(bus.stats().no_receivers, 1);
    }

    #[test]
    fn replay_is_bounded_and_ordered() {
        let bus = Bus::new_with_replay(16, 3);
        for i in 0..5 {
            bus.publish("tick", &json!({ "i": i }));
        }
        let recent = bus.replay(10);
        assert_eq!(recent.len(), 3);
        let seq: Vec<i64> = recent
            .iter()
            .map(|e| e.payload["i"].as_i64().unwrap())
            .collect();
        assert_eq!(seq, vec![2, 3, 4]);
    }
}
