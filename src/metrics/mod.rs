//! Lookup of named scoring functions, plus custom-function registration.
//!
//! A metric function is either async (runs in-place on the worker, the way
//! the scheduler runs the user task) or sync (unconditionally offloaded to
//! `spawn_blocking` — sync metrics are never probed for blocking the way
//! cooperative task callables are, since they're expected to be pure
//! CPU-bound comparisons).

mod builtin;

pub use builtin::{ExactMatch, RegexMatch};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EvalError;
use crate::types::Score;

/// A metric that may perform async work (e.g. an LLM-judge call). Run
/// in-place on the worker task.
#[async_trait]
pub trait AsyncMetric: Send + Sync {
    async fn score(&self, output: &Value, expected: Option<&Value>, input: &Value) -> anyhow::Result<Score>;
}

/// A pure, synchronous metric. Always offloaded to a blocking thread pool
/// before being awaited, regardless of how cheap it actually is — this
/// unconditional offload is a deliberate simplicity choice, not a
/// performance optimization (see DESIGN.md's Open Question decisions).
pub trait SyncMetric: Send + Sync {
    fn score(&self, output: &Value, expected: Option<&Value>, input: &Value) -> anyhow::Result<Score>;
}

#[derive(Clone)]
pub enum MetricKind {
    Async(Arc<dyn AsyncMetric>),
    Sync(Arc<dyn SyncMetric>),
}

impl MetricKind {
    /// Runs the metric, offloading sync implementations to `spawn_blocking`
    /// unconditionally.
    pub async fn run(&self, output: Value, expected: Option<Value>, input: Value) -> anyhow::Result<Score> {
        match self {
            MetricKind::Async(m) => m.score(&output, expected.as_ref(), &input).await,
            MetricKind::Sync(m) => {
                let m = m.clone();
                tokio::task::spawn_blocking(move || m.score(&output, expected.as_ref(), &input))
                    .await
                    .map_err(|e| anyhow::anyhow!("metric panicked: {e}"))?
            }
        }
    }
}

/// Named lookup of scoring functions. Custom registrations shadow
/// built-ins of the same name, a direct translation of
/// `registry.py`'s `register_metric`/`get_metric`.
#[derive(Clone, Default)]
pub struct MetricRegistry {
    builtin: HashMap<String, MetricKind>,
    custom: HashMap<String, MetricKind>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the metrics this crate ships:
    /// `exact_match` and `regex_match` (the latter with an empty-pattern
    /// placeholder that matches everything — callers needing a specific
    /// pattern should `register` their own `RegexMatch` under the same
    /// name, which shadows the built-in).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.builtin.insert("exact_match".to_string(), MetricKind::Sync(Arc::new(ExactMatch)));
        let placeholder = RegexMatch::new("").expect("empty pattern is always a valid regex");
        registry.builtin.insert("regex_match".to_string(), MetricKind::Sync(Arc::new(placeholder)));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, metric: MetricKind) {
        self.custom.insert(name.into(), metric);
    }

    pub fn get(&self, name: &str) -> Result<MetricKind, EvalError> {
        if let Some(m) = self.custom.get(name) {
            return Ok(m.clone());
        }
        if let Some(m) = self.builtin.get(name) {
            return Ok(m.clone());
        }
        let mut available: Vec<&str> = self.custom.keys().chain(self.builtin.keys()).map(String::as_str).collect();
        available.sort_unstable();
        Err(EvalError::AdapterMismatch(format!("metric '{name}' not found. Available metrics: {}", available.join(", "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_registration_shadows_builtin() {
        let mut registry = MetricRegistry::with_builtins();
        registry.register("exact_match", MetricKind::Sync(Arc::new(RegexMatch::new(".*").unwrap())));
        assert!(matches!(registry.get("exact_match"), Ok(MetricKind::Sync(_))));
    }

    #[test]
    fn unknown_metric_lists_available_names() {
        let registry = MetricRegistry::with_builtins();
        let err = registry.get("nope").unwrap_err();
        assert!(err.to_string().contains("exact_match"));
        assert!(err.to_string().contains("regex_match"));
    }

    #[test]
    fn regex_match_ships_as_a_builtin() {
        let registry = MetricRegistry::with_builtins();
        assert!(matches!(registry.get("regex_match"), Ok(MetricKind::Sync(_))));
    }
}
