#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]
//! End-to-end scheduler scenarios, exercising the public API the way an
//! embedding program would: happy path, partial failure, interrupt,
//! resume, a blocking callable, and multi-model fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use evalrun::adapter::{BlockingFn, CooperativeFn, FunctionTask, ParamSpec, Task};
use evalrun::dataset::{DatasetSource, InMemoryDataset};
use evalrun::evaluator::Evaluator;
use evalrun::metrics::MetricRegistry;
use evalrun::observers::NullObserver;
use evalrun::types::{Config, Item};
use evalrun::{run_evaluation, EvaluationOutcome};

fn items(n: usize) -> Vec<Item> {
    (0..n)
        .map(|i| Item {
            id: Some(format!("item-{i}")),
            input: json!(format!("value-{i}")),
            expected_output: Some(json!(format!("value-{i}"))),
            metadata: HashMap::new(),
        })
        .collect()
}

struct Echo;

#[async_trait]
impl CooperativeFn for Echo {
    async fn call(&self, args: &Value) -> anyhow::Result<Value> {
        Ok(args.get("payload").cloned().unwrap_or(Value::Null))
    }
}

/// Fails for a fixed set of item indices (by input value), succeeds
/// otherwise.
struct FailsOn(Vec<String>);

#[async_trait]
impl CooperativeFn for FailsOn {
    async fn call(&self, args: &Value) -> anyhow::Result<Value> {
        let payload = args.get("payload").cloned().unwrap_or(Value::Null);
        if let Some(s) = payload.as_str() {
            if self.0.iter().any(|bad| bad == s) {
                anyhow::bail!("simulated task failure for {s}");
            }
        }
        Ok(payload)
    }
}

fn echo_task() -> Task {
    Task::Function(FunctionTask::cooperative(ParamSpec { params: vec!["payload".to_string()], ..Default::default() }, Arc::new(Echo)))
}

fn failing_task(bad: Vec<&str>) -> Task {
    Task::Function(FunctionTask::cooperative(
        ParamSpec { params: vec!["payload".to_string()], ..Default::default() },
        Arc::new(FailsOn(bad.into_iter().map(str::to_string).collect())),
    ))
}

fn base_config(output_dir: &std::path::Path) -> Config {
    Config {
        max_concurrency: 4,
        output_dir: output_dir.to_path_buf(),
        ..Default::default()
    }
}

#[tokio::test]
async fn s1_happy_path_all_items_succeed() {
    let dir = TempDir::new().unwrap();
    let dataset: Arc<dyn DatasetSource> = Arc::new(InMemoryDataset::new("suite", items(5)));
    let config = base_config(dir.path());

    let evaluator = Evaluator::new("echo", echo_task(), dataset, vec!["exact_match".to_string()], MetricRegistry::with_builtins(), config);
    let state = evaluator.run().await.unwrap();

    assert_eq!(state.results.len(), 5);
    assert_eq!(state.errors.len(), 0);
    assert_eq!(state.success_rate(), 1.0);
    assert!(!state.interrupted);
    assert!(state.last_saved_path.is_some());
}

#[tokio::test]
async fn s2_partial_failure_recorded_without_aborting_run() {
    let dir = TempDir::new().unwrap();
    let dataset: Arc<dyn DatasetSource> = Arc::new(InMemoryDataset::new("suite", items(5)));
    let config = base_config(dir.path());

    let task = failing_task(vec!["value-1", "value-3"]);
    let evaluator = Evaluator::new("echo", task, dataset, vec!["exact_match".to_string()], MetricRegistry::with_builtins(), config);
    let state = evaluator.run().await.unwrap();

    assert_eq!(state.results.len(), 3);
    assert_eq!(state.errors.len(), 2);
    assert!(state.errors.values().all(|e| e.error_message.contains("simulated task failure")));
}

#[tokio::test]
async fn checkpoint_disabled_skips_the_file_but_keeps_in_memory_results() {
    let dir = TempDir::new().unwrap();
    let dataset: Arc<dyn DatasetSource> = Arc::new(InMemoryDataset::new("suite", items(5)));
    let mut config = base_config(dir.path());
    config.checkpoint_enabled = false;

    let evaluator = Evaluator::new("echo", echo_task(), dataset, vec!["exact_match".to_string()], MetricRegistry::with_builtins(), config);
    let state = evaluator.run().await.unwrap();

    assert_eq!(state.results.len(), 5);
    assert!(state.last_saved_path.is_none());
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn resume_from_requires_checkpoint_enabled() {
    let dir = TempDir::new().unwrap();
    let dataset: Arc<dyn DatasetSource> = Arc::new(InMemoryDataset::new("suite", items(2)));
    let mut config = base_config(dir.path());
    config.checkpoint_enabled = false;
    config.resume_from = Some(dir.path().join("does-not-matter.csv"));

    let evaluator = Evaluator::new("echo", echo_task(), dataset, vec!["exact_match".to_string()], MetricRegistry::with_builtins(), config);
    let err = evaluator.run().await.unwrap_err();
    assert!(matches!(err, evalrun::error::EvalError::ResumeMismatch(_)));
}

#[tokio::test]
async fn s4_resume_schedules_only_remaining_items() {
    let dir = TempDir::new().unwrap();
    let dataset: Arc<dyn DatasetSource> = Arc::new(InMemoryDataset::new("suite", items(6)));

    let mut config = base_config(dir.path());
    config.run_name = Some("fixed-run".to_string());

    let evaluator = Evaluator::new("echo", echo_task(), dataset.clone(), vec!["exact_match".to_string()], MetricRegistry::with_builtins(), config.clone());
    let first = evaluator.run().await.unwrap();
    assert_eq!(first.results.len(), 6);
    let checkpoint_path = first.last_saved_path.clone().unwrap();

    // Truncate the checkpoint to simulate a crash after only 3 rows were
    // durably written, then resume against the same file.
    let content = std::fs::read_to_string(&checkpoint_path).unwrap();
    let mut lines: Vec<&str> = content.lines().collect();
    lines.truncate(4); // header + 3 rows
    std::fs::write(&checkpoint_path, lines.join("\n") + "\n").unwrap();

    let mut resume_config = base_config(dir.path());
    resume_config.run_name = Some("fixed-run".to_string());
    resume_config.resume_from = Some(checkpoint_path.clone());

    let resumed = Evaluator::new("echo", echo_task(), dataset, vec!["exact_match".to_string()], MetricRegistry::with_builtins(), resume_config);
    let second = resumed.run().await.unwrap();

    assert_eq!(second.results.len(), 6);
    let final_content = std::fs::read_to_string(&checkpoint_path).unwrap();
    assert_eq!(final_content.lines().count(), 7); // header + 6 rows, no duplicates

    // The first 3 items were preloaded from the truncated checkpoint rather
    // than re-run; their `input` must still survive the round trip instead
    // of collapsing to `Value::Null`.
    for i in 0..3 {
        let item_id = format!("item-{i}");
        let result = second.results.get(&item_id).unwrap_or_else(|| panic!("missing preloaded result for {item_id}"));
        assert_eq!(result.input, json!(format!("value-{i}")));
    }
}

#[tokio::test]
async fn s4_resume_rejects_dataset_mismatch() {
    let dir = TempDir::new().unwrap();
    let dataset_a: Arc<dyn DatasetSource> = Arc::new(InMemoryDataset::new("suite-a", items(2)));
    let mut config = base_config(dir.path());
    config.run_name = Some("mismatch-run".to_string());

    let evaluator = Evaluator::new("echo", echo_task(), dataset_a, vec!["exact_match".to_string()], MetricRegistry::with_builtins(), config.clone());
    let first = evaluator.run().await.unwrap();
    let checkpoint_path = first.last_saved_path.unwrap();

    let dataset_b: Arc<dyn DatasetSource> = Arc::new(InMemoryDataset::new("suite-b", items(2)));
    let mut resume_config = base_config(dir.path());
    resume_config.run_name = Some("mismatch-run".to_string());
    resume_config.resume_from = Some(checkpoint_path);

    let resumed = Evaluator::new("echo", echo_task(), dataset_b, vec!["exact_match".to_string()], MetricRegistry::with_builtins(), resume_config);
    let err = resumed.run().await.unwrap_err();
    assert!(matches!(err, evalrun::error::EvalError::ResumeMismatch(_)));
}

#[tokio::test]
async fn s3_interrupt_leaves_durable_partial_checkpoint() {
    let dir = TempDir::new().unwrap();
    let dataset: Arc<dyn DatasetSource> = Arc::new(InMemoryDataset::new("suite", items(40)));
    let mut config = base_config(dir.path());
    config.max_concurrency = 2;
    config.interrupt_grace_seconds = 1.0;

    struct SlowEcho;
    #[async_trait]
    impl CooperativeFn for SlowEcho {
        async fn call(&self, args: &Value) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(args.get("payload").cloned().unwrap_or(Value::Null))
        }
    }
    let task = Task::Function(FunctionTask::cooperative(ParamSpec { params: vec!["payload".to_string()], ..Default::default() }, Arc::new(SlowEcho)));

    let evaluator = Evaluator::new("echo", task, dataset, vec!["exact_match".to_string()], MetricRegistry::with_builtins(), config);
    let token = evaluator.cancellation_token();

    let run_fut = evaluator.run();
    tokio::pin!(run_fut);

    // Fires well inside the first batch's in-flight window (50ms per item,
    // 2 concurrent workers) so cancellation interrupts before most items
    // are scheduled, without racing the first batch's own completion.
    tokio::select! {
        _ = &mut run_fut => panic!("run finished before interrupt was issued"),
        _ = tokio::time::sleep(Duration::from_millis(10)) => {
            token.cancel();
        }
    }

    let state = run_fut.await.unwrap();
    assert!(state.interrupted);
    assert!(state.last_saved_path.is_some());
    assert!(state.results.len() + state.errors.len() < 40);
}

#[tokio::test]
async fn unknown_metric_is_recorded_as_error_object_without_failing_the_item() {
    let dir = TempDir::new().unwrap();
    let dataset: Arc<dyn DatasetSource> = Arc::new(InMemoryDataset::new("suite", items(1)));
    let config = base_config(dir.path());

    let evaluator = Evaluator::new("echo", echo_task(), dataset, vec!["not_a_real_metric".to_string()], MetricRegistry::with_builtins(), config);
    let state = evaluator.run().await.unwrap();

    assert_eq!(state.results.len(), 1);
    let result = state.results.values().next().unwrap();
    assert!(result.scores["not_a_real_metric"].is_error());
}

#[tokio::test]
async fn s5_blocking_callable_runs_to_completion_via_thread_offload() {
    struct UppercaseBlocking;
    impl BlockingFn for UppercaseBlocking {
        fn call(&self, args: &Value) -> anyhow::Result<Value> {
            let payload = args.get("payload").and_then(Value::as_str).unwrap_or_default();
            Ok(json!(payload.to_uppercase()))
        }
    }

    let dir = TempDir::new().unwrap();
    let dataset: Arc<dyn DatasetSource> = Arc::new(InMemoryDataset::new("suite", items(3)));
    let config = base_config(dir.path());

    let task = Task::Function(FunctionTask::blocking(
        ParamSpec { params: vec!["payload".to_string()], ..Default::default() },
        Arc::new(UppercaseBlocking),
    ));
    let evaluator = Evaluator::new("uppercase", task, dataset, vec!["exact_match".to_string()], MetricRegistry::with_builtins(), config);
    let state = evaluator.run().await.unwrap();

    assert_eq!(state.results.len(), 3);
    assert!(state.results.values().all(|r| r.output.as_str().unwrap().chars().all(|c| !c.is_lowercase())));
}

#[tokio::test]
async fn s6_multi_model_fan_out_runs_one_evaluation_per_model() {
    let dir = TempDir::new().unwrap();
    let dataset: Arc<dyn DatasetSource> = Arc::new(InMemoryDataset::new("suite", items(4)));
    let mut config = base_config(dir.path());
    config.models = Some(vec!["openai/gpt-4o".to_string(), "anthropic/claude-3".to_string()]);
    config.max_parallel_runs = Some(2);

    let observers: Vec<Arc<dyn evalrun::observers::Observer>> = vec![Arc::new(NullObserver)];
    let outcome = run_evaluation("echo", echo_task(), dataset, vec!["exact_match".to_string()], MetricRegistry::with_builtins(), config, observers)
        .await
        .unwrap();

    let EvaluationOutcome::MultiRun(states) = outcome else {
        panic!("expected a multi-run outcome when config.models names more than one model");
    };
    assert_eq!(states.len(), 2);
    for state in &states {
        assert_eq!(state.results.len(), 4);
    }
}
