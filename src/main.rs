//! Thin binary wrapper. Parses CLI args, sets up logging, then drives a
//! library-level run. The bundled CLI ships only a demonstration
//! `identity` task (returns its input verbatim) — it exists to smoke-test
//! the dataset → scheduler → checkpoint → stats pipeline end to end, not
//! to load arbitrary user task code; embedders call
//! [`evalrun::run_evaluation`] directly with their own [`evalrun::adapter::Task`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing::info;

use evalrun::adapter::{CooperativeFn, FunctionTask, ParamSpec, Task};
use evalrun::cli::Args;
use evalrun::dataset::{DatasetSource, JsonlDataset};
use evalrun::helpers::setup_logging;
use evalrun::metrics::MetricRegistry;
use evalrun::observers::dashboard::DashboardObserver;
use evalrun::observers::Observer;
use evalrun::stats::compute_stats;
use evalrun::types::Config;
use evalrun::{run_evaluation, EvaluationOutcome};

struct Identity;

#[async_trait::async_trait]
impl CooperativeFn for Identity {
    async fn call(&self, args: &Value) -> anyhow::Result<Value> {
        Ok(args.clone())
    }

    fn name(&self) -> &str {
        "identity"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(&args)?;

    let config = Config {
        max_concurrency: args.max_concurrency,
        timeout_seconds: args.timeout_seconds,
        run_name: args.run_name.clone(),
        run_metadata: HashMap::new(),
        model: args.model.clone(),
        models: if args.models.is_empty() { None } else { Some(args.models.clone()) },
        resume_from: args.resume_from.clone(),
        checkpoint_enabled: true,
        checkpoint_format: "csv".to_string(),
        checkpoint_flush_each_item: true,
        checkpoint_fsync: args.checkpoint_fsync,
        output_dir: args.output_dir.clone(),
        interrupt_grace_seconds: args.interrupt_grace_seconds,
        platform_url: args.platform_url.clone(),
        platform_api_key: args.platform_api_key.clone(),
        resume_rerun_errors: args.resume_rerun_errors,
        max_parallel_runs: args.max_parallel_runs,
    };

    let dataset: Arc<dyn DatasetSource> = Arc::new(JsonlDataset::new(args.task_name.clone(), args.dataset.clone()));
    let task = Task::Function(FunctionTask::cooperative(ParamSpec::default(), Arc::new(Identity)));
    let registry = MetricRegistry::with_builtins();

    let dashboard: Arc<dyn Observer> = Arc::new(DashboardObserver::new());
    let observers: Vec<Arc<dyn Observer>> = vec![dashboard];

    let outcome = run_evaluation(&args.task_name, task, dataset, args.metrics.clone(), registry, config, observers)
        .await
        .context("evaluation run failed")?;

    match outcome {
        EvaluationOutcome::Single(state) => {
            let stats = compute_stats(&state);
            info!(success_rate = state.success_rate(), ?stats, "run complete");
        }
        EvaluationOutcome::MultiRun(states) => {
            for state in &states {
                let stats = compute_stats(state);
                info!(run_name = %state.run_name, success_rate = state.success_rate(), ?stats, "sub-run complete");
            }
        }
    }

    Ok(())
}
