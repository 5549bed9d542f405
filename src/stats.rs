//! Per-metric aggregate statistics, the JSONL streaming update type, and a
//! derived JSON summary of a finished run. The checkpoint CSV remains the
//! one canonical persisted form (see `checkpoint.rs`); everything in this
//! module is a read-only view built from an already-materialized
//! [`RunState`], never a second source of truth.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::types::{ItemError, ItemResult, RunState};

/// One streamed update, written as a single JSONL line when the caller
/// selects `OutputFormat::Jsonl` (mirrors `evaluations`' own
/// `EvalUpdate::Success | Error` streaming contract).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EvalUpdate {
    Success { item_id: String, result: ItemResult },
    Error { item_id: String, error: ItemError },
}

pub fn write_update(update: &EvalUpdate, writer: &mut impl Write) -> anyhow::Result<()> {
    writeln!(writer, "{}", serde_json::to_string(update)?)?;
    Ok(())
}

/// Mean and standard error of a metric's numeric scores across a run,
/// along with how many items actually carried a numeric score for it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricStats {
    pub mean: f64,
    pub stderr: f64,
    pub count: usize,
}

impl fmt::Display for MetricStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3} ± {:.3}", self.mean, self.stderr)
    }
}

fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    Some(data.iter().sum::<f64>() / data.len() as f64)
}

fn std_deviation(data: &[f64]) -> Option<f64> {
    let data_mean = mean(data)?;
    if data.is_empty() {
        return None;
    }
    let variance = data.iter().map(|v| (v - data_mean).powi(2)).sum::<f64>() / data.len() as f64;
    Some(variance.sqrt())
}

/// Computes mean/stderr for every metric the run declared, over the
/// numeric scores found in `results` (error rows and non-numeric scores
/// for a metric simply don't contribute to its count).
pub fn compute_stats(state: &RunState) -> HashMap<String, MetricStats> {
    let mut by_metric: HashMap<&str, Vec<f64>> = state.metrics.iter().map(|m| (m.as_str(), Vec::new())).collect();

    for result in state.results.values() {
        for (metric_name, score) in &result.scores {
            if let Some(bucket) = by_metric.get_mut(metric_name.as_str())
                && let Some(value) = score.numeric()
            {
                bucket.push(value);
            }
        }
    }

    by_metric
        .into_iter()
        .map(|(name, values)| {
            let count = values.len();
            let m = mean(&values).unwrap_or(0.0);
            let stderr = match std_deviation(&values) {
                Some(sd) if count > 0 => sd / (count as f64).sqrt(),
                _ => 0.0,
            };
            (name.to_string(), MetricStats { mean: m, stderr, count })
        })
        .collect()
}

/// A derived, JSON-serializable snapshot of a finished run: the result
/// container's non-CSV output format. Grounded on `results.py`'s
/// `to_dict`/`save_json` — metric stats are folded in rather than left for
/// a caller to recompute, and `results`/`errors` are carried verbatim so
/// the file is self-contained without re-reading the checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary<'a> {
    pub dataset_name: &'a str,
    pub run_name: &'a str,
    pub display_name: &'a str,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub duration_seconds: Option<f64>,
    pub total_items: usize,
    pub success_rate: f64,
    pub metrics: &'a [String],
    pub metric_stats: HashMap<String, MetricStats>,
    pub langfuse_url: Option<&'a str>,
    pub interrupted: bool,
    pub results: &'a HashMap<String, ItemResult>,
    pub errors: &'a HashMap<String, ItemError>,
}

pub fn build_summary(state: &RunState) -> RunSummary<'_> {
    RunSummary {
        dataset_name: &state.dataset_name,
        run_name: &state.run_name,
        display_name: &state.display_name,
        start_time: state.start_time,
        end_time: state.end_time,
        duration_seconds: state.end_time.map(|end| end - state.start_time),
        total_items: state.results.len() + state.errors.len(),
        success_rate: state.success_rate(),
        metrics: &state.metrics,
        metric_stats: compute_stats(state),
        langfuse_url: state.langfuse_url.as_deref(),
        interrupted: state.interrupted,
        results: &state.results,
        errors: &state.errors,
    }
}

/// Writes the run's JSON summary to `path`, creating parent directories as
/// needed. A derived output, not the canonical persisted form — losing it
/// never loses data the checkpoint CSV doesn't already hold.
pub fn save_summary_json(state: &RunState, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let summary = build_summary(state);
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, &summary)?;
    Ok(())
}
