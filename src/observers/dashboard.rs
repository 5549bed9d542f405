//! Terminal dashboard observer, backed by `indicatif`'s `MultiProgress`.
//! The [`MultiRunRunner`](crate::multi_runner::MultiRunRunner) attaches one
//! bar per sub-run to a single shared `MultiProgress` for its aggregate
//! view.

use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde_json::Value;

use super::Observer;
use crate::types::{ItemResult, Score};

const BAR_TEMPLATE: &str = "{spinner:.green} {msg:<28} [{bar:32.cyan/blue}] {pos}/{len} ({elapsed_precise})";

/// Renders one live progress bar per run, updated on every item lifecycle
/// event. Multiple instances can share a [`MultiProgress`] (see
/// [`DashboardObserver::attached`]) so an aggregate dashboard can display
/// several concurrent runs stacked in one terminal region.
pub struct DashboardObserver {
    multi: MultiProgress,
    bar: Mutex<Option<ProgressBar>>,
}

impl DashboardObserver {
    /// A standalone dashboard with its own terminal region.
    pub fn new() -> Self {
        Self::attached(MultiProgress::new())
    }

    /// A dashboard that renders into an existing [`MultiProgress`], so its
    /// bar stacks alongside sibling runs' bars.
    pub fn attached(multi: MultiProgress) -> Self {
        Self { multi, bar: Mutex::new(None) }
    }

    pub fn multi_progress(&self) -> MultiProgress {
        self.multi.clone()
    }
}

impl Default for DashboardObserver {
    fn default() -> Self {
        Self::new()
    }
}

fn style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_bar()).progress_chars("=>-")
}

impl Observer for DashboardObserver {
    fn on_run_started(&self, run_name: &str, total_items: usize, metrics: &[String]) -> anyhow::Result<()> {
        let bar = self.multi.add(ProgressBar::new(total_items as u64));
        bar.set_style(style());
        bar.set_message(format!("{run_name} [{}]", metrics.join(", ")));
        *self.bar.lock().expect("dashboard bar mutex poisoned") = Some(bar);
        Ok(())
    }

    fn on_item_completed(&self, _index: usize, _item_id: &str, _result: &ItemResult, _latency_ms: u64) -> anyhow::Result<()> {
        if let Some(bar) = self.bar.lock().expect("dashboard bar mutex poisoned").as_ref() {
            bar.inc(1);
        }
        Ok(())
    }

    fn on_item_failed(&self, _index: usize, item_id: &str, error: &str) -> anyhow::Result<()> {
        if let Some(bar) = self.bar.lock().expect("dashboard bar mutex poisoned").as_ref() {
            bar.inc(1);
            bar.println(format!("item {item_id} failed: {error}"));
        }
        Ok(())
    }

    fn on_metric_scored(&self, _index: usize, _item_id: &str, _metric_name: &str, _score: &Score) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_metadata_update(&self, _key: &str, _value: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_run_completed(&self, run_name: &str, success_rate: f64, total_items: usize) -> anyhow::Result<()> {
        if let Some(bar) = self.bar.lock().expect("dashboard bar mutex poisoned").take() {
            bar.finish_with_message(format!("{run_name} done — {total_items} items, {:.1}% success", success_rate * 100.0));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn bar_progresses_and_finishes() {
        let dashboard = DashboardObserver::new();
        dashboard.on_run_started("run-1", 2, &["exact_match".to_string()]).unwrap();
        dashboard.on_item_completed(0, "a", &sample_result(), 5).unwrap();
        dashboard.on_item_failed(1, "b", "boom").unwrap();
        dashboard.on_run_completed("run-1", 0.5, 2).unwrap();
        // The bar is dropped from the dashboard's own slot once finished;
        // a further completion is simply a no-op rather than a panic.
        dashboard.on_item_completed(2, "c", &sample_result(), 1).unwrap();
    }

    #[test]
    fn shared_multi_progress_is_reused() {
        let multi = MultiProgress::new();
        let a = DashboardObserver::attached(multi.clone());
        let b = DashboardObserver::attached(multi.clone());
        a.on_run_started("run-a", 1, &[]).unwrap();
        b.on_run_started("run-b", 1, &[]).unwrap();
    }
}
