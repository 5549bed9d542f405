//! Fans a single evaluation out across several models (`Config::models`),
//! each as an independent [`Evaluator`] run sharing one dashboard.
//! Concurrency across sub-runs is bounded with a
//! `tokio::sync::Semaphore`: `None` is unbounded, `Some(1)` is strictly
//! sequential, `Some(n)` caps it at `n`.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::adapter::Task;
use crate::dataset::DatasetSource;
use crate::error::EvalError;
use crate::evaluator::Evaluator;
use crate::metrics::MetricRegistry;
use crate::observers::Observer;
use crate::types::{Config, RunState};

/// Runs the same task/dataset/metrics combination once per model in
/// `config.models`, each under its own [`Evaluator`]. `max_parallel_runs`
/// bounds how many of those sub-runs execute concurrently: `None` means
/// unbounded, `Some(1)` is strictly sequential, `Some(n)` bounds it to `n`.
pub struct MultiRunRunner {
    task_name: String,
    task: Task,
    dataset: Arc<dyn DatasetSource>,
    metrics: Vec<String>,
    registry: MetricRegistry,
    config: Config,
    observers: Vec<Arc<dyn Observer>>,
}

impl MultiRunRunner {
    pub fn new(task_name: impl Into<String>, task: Task, dataset: Arc<dyn DatasetSource>, metrics: Vec<String>, registry: MetricRegistry, config: Config) -> Self {
        Self {
            task_name: task_name.into(),
            task,
            dataset,
            metrics,
            registry,
            config,
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    #[instrument(skip_all, fields(task_name = %self.task_name, models = ?self.config.models))]
    pub async fn run(&self) -> Result<Vec<RunState>, EvalError> {
        let models = self.config.models.clone().unwrap_or_else(|| vec![self.config.model.clone().unwrap_or_default()]);
        let permits = self.config.max_parallel_runs.unwrap_or(models.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(permits));

        let mut joins = JoinSet::new();
        for model in models {
            let semaphore = semaphore.clone();
            let mut per_run_config = self.config.clone();
            per_run_config.model = Some(model.clone());
            per_run_config.models = None;

            let mut evaluator = Evaluator::new(self.task_name.clone(), self.task.clone(), self.dataset.clone(), self.metrics.clone(), self.registry.clone(), per_run_config);
            for observer in &self.observers {
                evaluator.add_observer(observer.clone());
            }

            joins.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("multi-run semaphore closed");
                info!(model, "starting sub-run");
                evaluator.run().await
            });
        }

        let mut results = Vec::new();
        let mut first_error = None;
        while let Some(outcome) = joins.join_next().await {
            match outcome {
                Ok(Ok(state)) => results.push(state),
                Ok(Err(e)) => {
                    warn!(error = %e, "sub-run failed");
                    first_error.get_or_insert(e);
                }
                Err(join_err) => {
                    warn!(error = %join_err, "sub-run task panicked");
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{CooperativeFn, FunctionTask, ParamSpec};
    use crate::dataset::InMemoryDataset;
    use crate::types::Item;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Echo;
    #[async_trait]
    impl CooperativeFn for Echo {
        async fn call(&self, _args: &Value) -> anyhow::Result<Value> {
            Ok(json!("ok"))
        }
    }

    fn sample_items() -> Vec<Item> {
        vec![Item {
            id: Some("a".to_string()),
            input: json!("hi"),
            expected_output: Some(json!("ok")),
            metadata: Default::default(),
        }]
    }

    #[tokio::test]
    async fn fans_out_one_run_per_model() {
        let dir = tempfile::TempDir::new().unwrap();
        let task = Task::Function(FunctionTask::cooperative(ParamSpec::default(), Arc::new(Echo)));
        let dataset: Arc<dyn DatasetSource> = Arc::new(InMemoryDataset::new("suite", sample_items()));
        let mut config = Config {
            models: Some(vec!["openai/gpt-4o".to_string(), "anthropic/claude".to_string()]),
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.max_parallel_runs = Some(1);

        let runner = MultiRunRunner::new("task", task, dataset, vec!["exact_match".to_string()], MetricRegistry::with_builtins(), config);
        let states = runner.run().await.unwrap();
        assert_eq!(states.len(), 2);
    }
}
