//! Passive sinks for run/item lifecycle events: a composite fan-out, a
//! no-op default, and a terminal dashboard (see [`dashboard`]).
//!
//! Per-observer errors are swallowed: a broken dashboard implementation
//! must never kill the run. Every hook on the trait carries a no-op
//! default and returns a `Result` that the composite logs and discards
//! rather than propagating.

pub mod dashboard;

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::types::{ItemResult, Score};

/// Fan-out target for the evaluator's lifecycle events. All payloads are
/// to be treated as read-only; implementations must not mutate anything
/// reachable through a reference.
pub trait Observer: Send + Sync {
    fn on_run_started(&self, _run_name: &str, _total_items: usize, _metrics: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_item_started(&self, _index: usize, _item_id: &str, _input: &Value, _expected: Option<&Value>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_metric_scored(&self, _index: usize, _item_id: &str, _metric_name: &str, _score: &Score) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_item_completed(&self, _index: usize, _item_id: &str, _result: &ItemResult, _latency_ms: u64) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_item_failed(&self, _index: usize, _item_id: &str, _error: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_metadata_update(&self, _key: &str, _value: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_run_completed(&self, _run_name: &str, _success_rate: f64, _total_items: usize) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An observer that ignores every notification. The evaluator's default
/// when the caller registers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {}

/// Fans out every event to an ordered list of observers. A panic inside
/// one observer's hook is not caught (Rust trait methods aren't
/// `catch_unwind`-friendly without `UnwindSafe` bounds this crate doesn't
/// ask of its observers); an `Err` return is logged and the remaining
/// observers still run.
#[derive(Clone, Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    fn call(&self, hook: &str, f: impl Fn(&dyn Observer) -> anyhow::Result<()>) {
        for observer in &self.observers {
            if let Err(e) = f(observer.as_ref()) {
                warn!(hook, error = %e, "observer hook failed, continuing");
            }
        }
    }
}

impl Observer for CompositeObserver {
    fn on_run_started(&self, run_name: &str, total_items: usize, metrics: &[String]) -> anyhow::Result<()> {
        self.call("on_run_started", |o| o.on_run_started(run_name, total_items, metrics));
        Ok(())
    }

    fn on_item_started(&self, index: usize, item_id: &str, input: &Value, expected: Option<&Value>) -> anyhow::Result<()> {
        self.call("on_item_started", |o| o.on_item_started(index, item_id, input, expected));
        Ok(())
    }

    fn on_metric_scored(&self, index: usize, item_id: &str, metric_name: &str, score: &Score) -> anyhow::Result<()> {
        self.call("on_metric_scored", |o| o.on_metric_scored(index, item_id, metric_name, score));
        Ok(())
    }

    fn on_item_completed(&self, index: usize, item_id: &str, result: &ItemResult, latency_ms: u64) -> anyhow::Result<()> {
        self.call("on_item_completed", |o| o.on_item_completed(index, item_id, result, latency_ms));
        Ok(())
    }

    fn on_item_failed(&self, index: usize, item_id: &str, error: &str) -> anyhow::Result<()> {
        self.call("on_item_failed", |o| o.on_item_failed(index, item_id, error));
        Ok(())
    }

    fn on_metadata_update(&self, key: &str, value: &Value) -> anyhow::Result<()> {
        self.call("on_metadata_update", |o| o.on_metadata_update(key, value));
        Ok(())
    }

    fn on_run_completed(&self, run_name: &str, success_rate: f64, total_items: usize) -> anyhow::Result<()> {
        self.call("on_run_completed", |o| o.on_run_completed(run_name, success_rate, total_items));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Counting {
        count: AtomicUsize,
    }

    impl Observer for Counting {
        fn on_item_completed(&self, _index: usize, _item_id: &str, _result: &ItemResult, _latency_ms: u64) -> anyhow::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Broken;
    impl Observer for Broken {
        fn on_item_completed(&self, _index: usize, _item_id: &str, _result: &ItemResult, _latency_ms: u64) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    fn sample_result() -> ItemResult {
        ItemResult {
            input: Value::Null,
            output: Value::Null,
            expected: None,
            scores: Default::default(),
            trace_id: None,
            trace_url: None,
            time_seconds: 0.0,
            task_started_at_ms: 0,
            success: true,
        }
    }

    #[test]
    fn broken_observer_does_not_block_the_rest() {
        let mut composite = CompositeObserver::new();
        composite.add(Arc::new(Broken));
        let counting = Arc::new(Counting { count: AtomicUsize::new(0) });
        composite.add(counting.clone());

        composite.on_item_completed(0, "a", &sample_result(), 10).unwrap();
        assert_eq!(counting.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn order_is_preserved() {
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Tagging(Arc<Mutex<Vec<&'static str>>>, &'static str);
        impl Observer for Tagging {
            fn on_run_started(&self, _run_name: &str, _total_items: usize, _metrics: &[String]) -> anyhow::Result<()> {
                self.0.lock().unwrap().push(self.1);
                Ok(())
            }
        }

        let mut composite = CompositeObserver::new();
        composite.add(Arc::new(Tagging(order.clone(), "first")));
        composite.add(Arc::new(Tagging(order.clone(), "second")));
        composite.on_run_started("run", 0, &[]).unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }
}
