//! Forwards scheduler-generated lifecycle events to a remote HTTP ingest
//! endpoint over `reqwest`. Emission is best-effort and non-blocking: a
//! bounded channel decouples the scheduler from network latency, and a
//! slow or unreachable endpoint never fails the run.
//!
//! The two run-boundary events, `run_started` and `run_completed`,
//! additionally support a synchronous variant that blocks the caller
//! until the POST completes (or times out), since the platform's
//! run-creation handshake must return a `run_id` before any item event
//! for that run can be attributed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::time::sleep;
use tracing::warn;
use url::Url;

/// Matches `evaluations`' own channel-buffer sizing convention.
pub const EVALUATION_CHANNEL_BUFFER_SIZE: usize = 128;

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// The stable wire-contract event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    ItemStarted,
    MetricScored,
    ItemCompleted,
    ItemFailed,
    MetadataUpdate,
    RunCompleted,
}

impl EventType {
    fn is_critical(self) -> bool {
        matches!(self, EventType::RunStarted | EventType::RunCompleted)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub event_type: EventType,
    pub payload: Value,
    pub timestamp: f64,
}

enum QueuedEvent {
    Async(Envelope),
    Sync(Envelope, oneshot::Sender<()>),
}

impl QueuedEvent {
    fn envelope(&self) -> &Envelope {
        match self {
            QueuedEvent::Async(e) => e,
            QueuedEvent::Sync(e, _) => e,
        }
    }
}

struct Inner {
    queue: Mutex<VecDeque<QueuedEvent>>,
    notify: Notify,
    disabled: AtomicBool,
    warned_disabled: AtomicBool,
}

/// A bounded in-process event queue drained by a background emitter task.
/// Cloning shares the same queue and background task — cheap, intended
/// for fan-out to multiple producers (one per worker).
#[derive(Clone)]
pub struct PlatformEventStream {
    inner: Arc<Inner>,
}

impl PlatformEventStream {
    pub fn new(base_url: Url, api_key: String) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            disabled: AtomicBool::new(false),
            warned_disabled: AtomicBool::new(false),
        });
        let client = reqwest::Client::new();
        let worker = inner.clone();
        tokio::spawn(async move { Self::drain_loop(worker, client, base_url, api_key).await });
        Self { inner }
    }

    /// Non-blocking; never raises. Overflow drops the oldest non-critical
    /// queued event rather than the newest, so a burst of `metric_scored`
    /// events never starves a pending `run_completed`.
    pub fn emit(&self, event_type: EventType, payload: Value) {
        if self.inner.disabled.load(Ordering::Relaxed) {
            return;
        }
        self.push(QueuedEvent::Async(self.envelope(event_type, payload)));
    }

    /// Blocks until the POST returns or the retry budget is exhausted.
    /// Only meaningful for `run_started`/`run_completed`; other event
    /// types are accepted but gain nothing from the synchronous wait
    /// since they carry no run-boundary semantics.
    pub async fn emit_sync(&self, event_type: EventType, payload: Value) {
        if self.inner.disabled.load(Ordering::Relaxed) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        self.push(QueuedEvent::Sync(self.envelope(event_type, payload), tx));
        let _ = rx.await;
    }

    fn envelope(&self, event_type: EventType, payload: Value) -> Envelope {
        Envelope {
            event_type,
            payload,
            timestamp: std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs_f64(),
        }
    }

    fn push(&self, event: QueuedEvent) {
        let mut queue = self.inner.queue.lock().expect("platform queue mutex poisoned");
        if queue.len() >= EVALUATION_CHANNEL_BUFFER_SIZE {
            let oldest_non_critical = queue.iter().position(|e| !e.envelope().event_type.is_critical());
            match oldest_non_critical {
                Some(pos) => {
                    queue.remove(pos);
                    warn!("platform event queue full, dropped oldest non-critical event");
                }
                None => {
                    warn!("platform event queue full of critical events, dropping incoming event");
                    return;
                }
            }
        }
        queue.push_back(event);
        drop(queue);
        self.inner.notify.notify_one();
    }

    async fn drain_loop(inner: Arc<Inner>, client: reqwest::Client, base_url: Url, api_key: String) {
        loop {
            let next = inner.queue.lock().expect("platform queue mutex poisoned").pop_front();
            let Some(event) = next else {
                inner.notify.notified().await;
                continue;
            };

            match event {
                QueuedEvent::Async(envelope) => {
                    Self::deliver(&inner, &client, &base_url, &api_key, &envelope).await;
                }
                QueuedEvent::Sync(envelope, done) => {
                    Self::deliver(&inner, &client, &base_url, &api_key, &envelope).await;
                    let _ = done.send(());
                }
            }
        }
    }

    async fn deliver(inner: &Arc<Inner>, client: &reqwest::Client, base_url: &Url, api_key: &str, envelope: &Envelope) {
        let mut attempt = 0;
        loop {
            let result = client
                .post(base_url.clone())
                .bearer_auth(api_key)
                .json(envelope)
                .send()
                .await
                .and_then(|r| r.error_for_status());

            match result {
                Ok(_) => return,
                Err(e) if attempt + 1 >= MAX_RETRIES => {
                    inner.disabled.store(true, Ordering::Relaxed);
                    if !inner.warned_disabled.swap(true, Ordering::Relaxed) {
                        warn!(error = %e, "platform event delivery failed persistently, disabling further emission for this run");
                    }
                    return;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "platform event delivery failed, retrying");
                    sleep(RETRY_BASE_DELAY * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overflow_drops_oldest_non_critical_not_newest() {
        let queue = Mutex::new(VecDeque::new());
        for i in 0..EVALUATION_CHANNEL_BUFFER_SIZE {
            queue.lock().unwrap().push_back(QueuedEvent::Async(Envelope {
                event_type: EventType::MetricScored,
                payload: json!({"i": i}),
                timestamp: 0.0,
            }));
        }
        // Simulate the push() overflow logic directly since it needs an
        // actual HTTP client for the full PlatformEventStream.
        let mut q = queue.lock().unwrap();
        assert_eq!(q.len(), EVALUATION_CHANNEL_BUFFER_SIZE);
        let pos = q.iter().position(|e| !e.envelope().event_type.is_critical()).unwrap();
        assert_eq!(pos, 0);
        q.remove(pos);
        q.push_back(QueuedEvent::Async(Envelope {
            event_type: EventType::MetricScored,
            payload: json!({"i": "new"}),
            timestamp: 0.0,
        }));
        assert_eq!(q.len(), EVALUATION_CHANNEL_BUFFER_SIZE);
        assert_eq!(q.front().unwrap().envelope().payload, json!({"i": 1}));
    }

    #[test]
    fn critical_events_are_never_the_drop_target() {
        assert!(EventType::RunStarted.is_critical());
        assert!(EventType::RunCompleted.is_critical());
        assert!(!EventType::ItemCompleted.is_critical());
        assert!(!EventType::MetricScored.is_critical());
    }
}
