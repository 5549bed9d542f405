//! The scheduler: one work channel pre-loaded with every pending item plus
//! N sentinels, N worker tasks draining it, one writer task serializing
//! checkpoint rows. Interrupt handling is driven by a `CancellationToken`
//! raced against normal completion, with a grace period before aborting
//! any workers still in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::adapter::{Task, TaskContext};
use crate::checkpoint::{iter_checkpoint_rows, load_checkpoint_state, parse_checkpoint_row, uses_synthetic_ids, CheckpointRow, CheckpointWriter, ParsedRow};
use crate::dataset::DatasetSource;
use crate::error::EvalError;
use crate::metrics::MetricRegistry;
use crate::observers::{CompositeObserver, Observer};
use crate::platform::{EventType, PlatformEventStream};
use crate::types::{build_run_identifiers, compute_run_config_id, strip_model_provider, Config, Item, ItemError, ItemResult, RunState, Score};

/// Strips the provider prefix and lays out the path as
/// `{output_dir}/{task}/{model_stripped}/{YYYY-MM-DD}/{run_id}.csv`. The
/// run id itself already embeds `{task}-{dataset}-{model_stripped}-{ts}`
/// when derived from `(task_name, dataset_name)`, so the file stem is just
/// the run id.
pub fn build_output_path(output_dir: &Path, task_name: &str, model: Option<&str>, run_id: &str, now: DateTime<Local>) -> PathBuf {
    let model_stripped = model.map(strip_model_provider).unwrap_or_default();
    let date_dir = now.format("%Y-%m-%d").to_string();
    output_dir.join(task_name).join(model_stripped).join(date_dir).join(format!("{run_id}.csv"))
}

enum WorkMsg {
    Item { index: usize, item_id: String, item: Item },
    Sentinel,
}

enum WriterMsg {
    Success { item_id: String, row: CheckpointRow, result: ItemResult },
    Error { item_id: String, row: CheckpointRow, error: ItemError },
}

/// The fully-resolved scheduler. Built once per run via [`Evaluator::new`]
/// and consumed by [`Evaluator::run`].
pub struct Evaluator {
    task: Task,
    dataset: Arc<dyn DatasetSource>,
    task_name: String,
    metrics: Vec<String>,
    registry: MetricRegistry,
    config: Config,
    observers: CompositeObserver,
    platform: Option<PlatformEventStream>,
    cancellation: CancellationToken,
}

impl Evaluator {
    pub fn new(task_name: impl Into<String>, task: Task, dataset: Arc<dyn DatasetSource>, metrics: Vec<String>, registry: MetricRegistry, config: Config) -> Self {
        let platform = match (&config.platform_url, &config.platform_api_key) {
            (Some(url), Some(key)) => url::Url::parse(url).ok().map(|u| PlatformEventStream::new(u, key.clone())),
            _ => None,
        };
        Self {
            task,
            dataset,
            task_name: task_name.into(),
            metrics,
            registry,
            config,
            observers: CompositeObserver::new(),
            platform,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn Observer>) {
        self.observers.add(observer);
    }

    /// A token the caller can cancel (e.g. from a Ctrl-C handler) to
    /// trigger the interrupt sequence: workers stop picking up new items,
    /// in-flight items get a grace period to finish, and anything still
    /// running past that is aborted.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    #[instrument(skip_all, fields(task_name = %self.task_name, dataset_name = %self.dataset.name(), max_concurrency = self.config.max_concurrency))]
    pub async fn run(&self) -> Result<RunState, EvalError> {
        let items = self
            .dataset
            .get_items()
            .await
            .map_err(|e| EvalError::DatasetMissing(format!("loading dataset '{}': {e}", self.dataset.name())))?;

        let now = Local::now();
        let base_name = format!("{}-{}", self.task_name, self.dataset.name());
        let model_stripped = strip_model_provider(self.config.model.as_deref().unwrap_or(""));

        let (run_name, display_name) = match &self.config.run_name {
            Some(explicit) => (explicit.clone(), explicit.clone()),
            None => build_run_identifiers(&base_name, &model_stripped, now, false),
        };

        let mut metrics_sorted = self.metrics.clone();
        metrics_sorted.sort();

        let resume_state = match &self.config.resume_from {
            Some(_) if !self.config.checkpoint_enabled => {
                return Err(EvalError::ResumeMismatch("resume_from requires checkpoint_enabled".to_string()));
            }
            Some(path) => {
                let state = load_checkpoint_state(path)?;
                if state.dataset_name != self.dataset.name() {
                    return Err(EvalError::ResumeMismatch(format!(
                        "checkpoint dataset '{}' does not match '{}'",
                        state.dataset_name,
                        self.dataset.name()
                    )));
                }
                if state.metrics != metrics_sorted {
                    return Err(EvalError::ResumeMismatch(format!(
                        "checkpoint metrics {:?} do not match configured metrics {:?}",
                        state.metrics, metrics_sorted
                    )));
                }
                if self.config.resume_rerun_errors {
                    return Err(EvalError::ResumeMismatch(
                        "resume_rerun_errors is not supported when appending to the same checkpoint file".to_string(),
                    ));
                }
                Some(state)
            }
            None => None,
        };

        let synthetic_ids = resume_state.as_ref().map(|s| uses_synthetic_ids(&s.completed_item_ids)).unwrap_or(false);

        let item_id_for = |index: usize, item: &Item| -> String {
            if synthetic_ids {
                format!("item_{index}")
            } else {
                item.id.clone().unwrap_or_else(|| format!("item_{index}"))
            }
        };

        let run_config = json!({
            "max_concurrency": self.config.max_concurrency,
            "timeout_seconds": self.config.timeout_seconds,
            "run_name": self.config.run_name,
            "model": self.config.model,
        });

        let mut state = RunState::new(self.dataset.name().to_string(), run_name.clone(), display_name, self.metrics.clone(), run_config.clone(), epoch_seconds());
        state.run_metadata = self.config.run_metadata.clone();
        state.run_metadata.insert("run_config_id".to_string(), json!(compute_run_config_id(&run_config)));

        let checkpoint_path = self.config.checkpoint_enabled.then(|| match &resume_state {
            Some(s) => s.path.clone(),
            None => build_output_path(&self.config.output_dir, &self.task_name, self.config.model.as_deref(), &run_name, now),
        });

        let mut completed_ids = std::collections::HashSet::new();
        if let Some(resume) = &resume_state {
            completed_ids = resume.completed_item_ids.union(&resume.error_item_ids).cloned().collect();
            self.preload_resumed_rows(checkpoint_path.as_ref().expect("resume requires checkpoint_enabled"), &completed_ids, &mut state)?;
        }

        let mut pending = Vec::new();
        for (index, item) in items.iter().enumerate() {
            let item_id = item_id_for(index, item);
            state.inputs.insert(item_id.clone(), item.input.clone());
            state.metadatas.insert(item_id.clone(), json!(item.metadata));
            if !completed_ids.contains(&item_id) {
                pending.push((index, item_id, item.clone()));
            }
        }

        self.observers.on_run_started(&run_name, items.len(), &self.metrics).ok();
        if let Some(platform) = &self.platform {
            platform
                .emit_sync(
                    EventType::RunStarted,
                    json!({"run_name": run_name, "dataset_name": self.dataset.name(), "total_items": items.len()}),
                )
                .await;
        }

        let writer = checkpoint_path
            .as_ref()
            .map(|path| CheckpointWriter::open(path, &self.metrics, self.config.checkpoint_flush_each_item, self.config.checkpoint_fsync))
            .transpose()?;

        let (work_tx, work_rx) = mpsc::unbounded_channel::<WorkMsg>();
        for (index, item_id, item) in pending {
            let _ = work_tx.send(WorkMsg::Item { index, item_id, item });
        }
        for _ in 0..self.config.max_concurrency {
            let _ = work_tx.send(WorkMsg::Sentinel);
        }
        drop(work_tx);
        let work_rx = Arc::new(AsyncMutex::new(work_rx));

        let (write_tx, write_rx) = mpsc::unbounded_channel::<WriterMsg>();
        let (writer_done_tx, writer_done_rx) = oneshot::channel();
        tokio::spawn(Self::writer_loop(writer, write_rx, writer_done_tx));

        let mut workers = JoinSet::new();
        for _ in 0..self.config.max_concurrency {
            let work_rx = work_rx.clone();
            let write_tx = write_tx.clone();
            let task = self.task.clone();
            let registry = self.registry.clone();
            let metrics = self.metrics.clone();
            let observers = self.observers.clone();
            let platform = self.platform.clone();
            let model = self.config.model.clone();
            let timeout = Duration::from_secs_f64(self.config.timeout_seconds);
            let run_name = run_name.clone();
            let run_metadata = json!(state.run_metadata);
            let run_config = run_config.clone();
            let dataset_name = self.dataset.name().to_string();
            let cancellation = self.cancellation.clone();

            workers.spawn(Self::worker_loop(WorkerCtx {
                work_rx,
                write_tx,
                task,
                registry,
                metrics,
                observers,
                platform,
                model,
                timeout,
                run_name,
                run_metadata,
                run_config,
                dataset_name,
                cancellation,
            }));
        }
        drop(write_tx);

        let grace = Duration::from_secs_f64(self.config.interrupt_grace_seconds);
        let interrupted = tokio::select! {
            _ = async { while workers.join_next().await.is_some() {} } => false,
            _ = self.cancellation.cancelled() => {
                match tokio::time::timeout(grace, async { while workers.join_next().await.is_some() {} }).await {
                    Ok(_) => {}
                    Err(_) => {
                        warn!("interrupt grace period elapsed, aborting remaining workers");
                        workers.abort_all();
                        while workers.join_next().await.is_some() {}
                    }
                }
                true
            }
        };

        let (results, errors) = writer_done_rx.await.map_err(|_| EvalError::WriterFailure("writer task terminated unexpectedly".to_string()))?;
        state.results.extend(results);
        state.errors.extend(errors);
        state.interrupted = interrupted;
        state.last_saved_path = checkpoint_path.clone();
        state.finish(epoch_seconds());

        let success_rate = state.success_rate();
        self.observers.on_run_completed(&run_name, success_rate, items.len()).ok();
        if let Some(platform) = &self.platform {
            platform
                .emit_sync(EventType::RunCompleted, json!({"run_name": run_name, "success_rate": success_rate, "interrupted": interrupted}))
                .await;
        }

        // A derived, non-canonical snapshot alongside the checkpoint —
        // see stats.rs. The checkpoint CSV remains the source of truth;
        // losing this file loses nothing resume can't reconstruct. There's
        // nowhere to put it when checkpointing itself is disabled.
        if let Some(checkpoint_path) = &checkpoint_path {
            if let Err(e) = crate::stats::save_summary_json(&state, &checkpoint_path.with_extension("json")) {
                warn!(error = %e, "failed to write derived JSON summary");
            }
        }

        info!(success_rate, total = items.len(), interrupted, "run finished");
        Ok(state)
    }

    fn preload_resumed_rows(&self, path: &Path, completed_item_ids: &std::collections::HashSet<String>, state: &mut RunState) -> Result<(), EvalError> {
        let (headers, mut reader) = iter_checkpoint_rows(path)?;
        for record in reader.records() {
            let record = record.map_err(|e| EvalError::WriterFailure(e.to_string()))?;
            let Some((item_id, parsed)) = parse_checkpoint_row(&headers, &record, &self.metrics) else {
                continue;
            };
            if !completed_item_ids.contains(&item_id) {
                continue;
            }
            match parsed {
                ParsedRow::Success(result) => {
                    state.results.insert(item_id, result);
                }
                ParsedRow::Error(error) => {
                    state.errors.insert(item_id, error);
                }
            }
        }
        Ok(())
    }

    /// `writer` is `None` when `checkpoint_enabled` is false: rows are
    /// still tallied into `results`/`errors` in memory, just never
    /// persisted to a CSV file. Keeping this task as the sole consumer of
    /// `WriterMsg` either way preserves the single-writer discipline on
    /// those maps regardless of the config flag.
    async fn writer_loop(mut writer: Option<CheckpointWriter>, mut rx: mpsc::UnboundedReceiver<WriterMsg>, done: oneshot::Sender<(HashMap<String, ItemResult>, HashMap<String, ItemError>)>) {
        let mut results = HashMap::new();
        let mut errors = HashMap::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                WriterMsg::Success { item_id, row, result } => {
                    if let Some(writer) = &mut writer {
                        if let Err(e) = writer.append_row(&row) {
                            warn!(error = %e, item_id, "checkpoint write failed");
                        }
                    }
                    results.insert(item_id, result);
                }
                WriterMsg::Error { item_id, row, error } => {
                    if let Some(writer) = &mut writer {
                        if let Err(e) = writer.append_row(&row) {
                            warn!(error = %e, item_id, "checkpoint write failed");
                        }
                    }
                    errors.insert(item_id, error);
                }
            }
        }
        if let Some(writer) = writer {
            if let Err(e) = writer.close() {
                warn!(error = %e, "checkpoint writer close failed");
            }
        }
        let _ = done.send((results, errors));
    }

    async fn worker_loop(ctx: WorkerCtx) {
        loop {
            let msg = {
                let mut rx = ctx.work_rx.lock().await;
                rx.recv().await
            };
            let Some(msg) = msg else { break };
            match msg {
                WorkMsg::Sentinel => break,
                WorkMsg::Item { index, item_id, item } => {
                    if ctx.cancellation.is_cancelled() {
                        // Interrupt requested: drain the remaining work
                        // channel without processing so resume can pick
                        // these items back up.
                        continue;
                    }
                    ctx.process_item(index, item_id, item).await;
                }
            }
        }
    }
}

#[derive(Clone)]
struct WorkerCtx {
    work_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<WorkMsg>>>,
    write_tx: mpsc::UnboundedSender<WriterMsg>,
    task: Task,
    registry: MetricRegistry,
    metrics: Vec<String>,
    observers: CompositeObserver,
    platform: Option<PlatformEventStream>,
    model: Option<String>,
    timeout: Duration,
    run_name: String,
    run_metadata: Value,
    run_config: Value,
    dataset_name: String,
    cancellation: CancellationToken,
}

fn epoch_seconds() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn epoch_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

impl WorkerCtx {
    #[instrument(skip_all, fields(run_name = %self.run_name, item_id = %item_id, index))]
    async fn process_item(&self, index: usize, item_id: String, item: Item) {
        let trace_id = Uuid::now_v7().to_string();
        let task_started_at_ms = epoch_millis();

        self.observers.on_item_started(index, &item_id, &item.input, item.expected_output.as_ref()).ok();
        if let Some(platform) = &self.platform {
            platform.emit(EventType::ItemStarted, json!({"index": index, "item_id": item_id, "trace_id": trace_id}));
        }

        let ctx = TaskContext {
            model_name: self.model.clone(),
            trace_id: Some(trace_id.clone()),
        };

        let task_start = Instant::now();
        let task_outcome = tokio::time::timeout(self.timeout, self.task.invoke(item.input.clone(), ctx)).await;
        let task_elapsed = task_start.elapsed().as_secs_f64();

        let output = match task_outcome {
            Err(_) => {
                self.fail_item(index, &item_id, task_started_at_ms, &trace_id, "timeout".to_string(), item.input.clone(), item.metadata.clone())
                    .await;
                return;
            }
            Ok(Err(e)) => {
                self.fail_item(index, &item_id, task_started_at_ms, &trace_id, e.to_string(), item.input.clone(), item.metadata.clone())
                    .await;
                return;
            }
            Ok(Ok(output)) => output,
        };

        if self.cancellation.is_cancelled() {
            self.fail_item(index, &item_id, task_started_at_ms, &trace_id, "cancelled".to_string(), item.input.clone(), item.metadata.clone())
                .await;
            return;
        }

        let mut scores = HashMap::new();
        for metric_name in &self.metrics {
            let kind = match self.registry.get(metric_name) {
                Ok(kind) => kind,
                Err(e) => {
                    scores.insert(metric_name.clone(), Score::Object(crate::types::ScoreValue { score: Some(json!(0)), metadata: None, error: Some(e.to_string()) }));
                    continue;
                }
            };
            let metric_span = tracing::debug_span!("metric", metric = %metric_name, item_id = %item_id);
            let score = match kind
                .run(output.clone(), item.expected_output.clone(), item.input.clone())
                .instrument(metric_span)
                .await
            {
                Ok(score) => score,
                Err(e) => Score::Object(crate::types::ScoreValue { score: Some(json!(0)), metadata: None, error: Some(e.to_string()) }),
            };
            self.observers.on_metric_scored(index, &item_id, metric_name, &score).ok();
            if let Some(platform) = &self.platform {
                platform.emit(EventType::MetricScored, json!({"index": index, "item_id": item_id, "metric": metric_name}));
            }
            scores.insert(metric_name.clone(), score);
        }

        let result = ItemResult {
            input: item.input.clone(),
            output,
            expected: item.expected_output.clone(),
            scores,
            trace_id: Some(trace_id),
            trace_url: None,
            time_seconds: task_elapsed,
            task_started_at_ms,
            success: true,
        };

        let row = CheckpointRow::from_success(&self.dataset_name, &self.run_name, &self.run_metadata, &self.run_config, &item_id, &result, json!(item.metadata));

        let latency_ms = (task_elapsed * 1000.0) as u64;
        self.observers.on_item_completed(index, &item_id, &result, latency_ms).ok();
        if let Some(platform) = &self.platform {
            platform.emit(EventType::ItemCompleted, json!({"index": index, "item_id": item_id, "latency_ms": latency_ms}));
        }

        let _ = self.write_tx.send(WriterMsg::Success { item_id, row, result });
    }

    async fn fail_item(&self, index: usize, item_id: &str, task_started_at_ms: i64, trace_id: &str, message: String, input: Value, metadata: HashMap<String, Value>) {
        let error = ItemError {
            error_message: message.clone(),
            trace_id: Some(trace_id.to_string()),
            task_started_at_ms: Some(task_started_at_ms),
        };
        let row = CheckpointRow::from_error(&self.dataset_name, &self.run_name, &self.run_metadata, &self.run_config, item_id, input, json!(metadata), &error, &self.metrics);

        self.observers.on_item_failed(index, item_id, &message).ok();
        if let Some(platform) = &self.platform {
            platform.emit(EventType::ItemFailed, json!({"index": index, "item_id": item_id, "error": message}));
        }

        let _ = self.write_tx.send(WriterMsg::Error { item_id: item_id.to_string(), row, error });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn output_path_matches_convention() {
        let now = chrono::Local.with_ymd_and_hms(2026, 3, 5, 10, 0, 0).unwrap();
        let path = build_output_path(Path::new("qym_results"), "summarize", Some("openai/gpt-4o"), "summarize-suite-gpt-4o-260305-1000", now);
        assert_eq!(path, PathBuf::from("qym_results/summarize/gpt-4o/2026-03-05/summarize-suite-gpt-4o-260305-1000.csv"));
    }

    #[test]
    fn output_path_without_model_collapses_empty_segment() {
        let now = chrono::Local.with_ymd_and_hms(2026, 3, 5, 10, 0, 0).unwrap();
        let path = build_output_path(Path::new("out"), "task", None, "task-ds-260305-1000", now);
        assert_eq!(path, PathBuf::from("out/task/2026-03-05/task-ds-260305-1000.csv"));
    }
}
