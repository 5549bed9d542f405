//! Core data types shared across the evaluation runner: dataset items,
//! normalized scores, per-item results, and the run-level state container.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A single dataset record. Produced once by the dataset source at run
/// start and immutable for the lifetime of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: Option<String>,
    pub input: Value,
    pub expected_output: Option<Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// A metric result, normalized at the boundary so downstream code (stats,
/// serialization, resume parsing) never has to branch on the metric's raw
/// return shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Score {
    Number(f64),
    Bool(bool),
    Text(String),
    Object(ScoreValue),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreValue {
    pub score: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Score {
    /// The numeric main value, if this score carries one. An error object
    /// has no defined numeric score.
    pub fn numeric(&self) -> Option<f64> {
        match self {
            Score::Number(n) => Some(*n),
            Score::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Score::Text(_) => None,
            Score::Object(v) => {
                if v.error.is_some() {
                    None
                } else {
                    v.score.as_ref().and_then(Value::as_f64)
                }
            }
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Score::Object(v) => v.error.as_deref(),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }
}

/// Per-item success record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult {
    pub input: Value,
    pub output: Value,
    pub expected: Option<Value>,
    pub scores: HashMap<String, Score>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_url: Option<String>,
    pub time_seconds: f64,
    pub task_started_at_ms: i64,
    pub success: bool,
}

/// Per-item failure record. Carries no scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemError {
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_started_at_ms: Option<i64>,
}

/// The aggregate run state. The Evaluator is the sole owner for the run's
/// lifetime; once `end_time` is set the state is read-only except for a
/// late URL backfill on the `langfuse_url` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub dataset_name: String,
    pub run_name: String,
    pub display_name: String,
    pub metrics: Vec<String>,
    #[serde(default)]
    pub run_metadata: HashMap<String, Value>,
    pub run_config: Value,
    pub start_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub metadatas: HashMap<String, Value>,
    #[serde(default)]
    pub results: HashMap<String, ItemResult>,
    #[serde(default)]
    pub errors: HashMap<String, ItemError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub langfuse_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_saved_path: Option<PathBuf>,
    #[serde(default)]
    pub interrupted: bool,
}

impl RunState {
    pub fn new(dataset_name: String, run_name: String, display_name: String, metrics: Vec<String>, run_config: Value, start_time: f64) -> Self {
        Self {
            dataset_name,
            run_name,
            display_name,
            metrics,
            run_metadata: HashMap::new(),
            run_config,
            start_time,
            end_time: None,
            inputs: HashMap::new(),
            metadatas: HashMap::new(),
            results: HashMap::new(),
            errors: HashMap::new(),
            langfuse_url: None,
            last_saved_path: None,
            interrupted: false,
        }
    }

    pub fn success_rate(&self) -> f64 {
        let attempted = self.results.len() + self.errors.len();
        if attempted == 0 {
            return 0.0;
        }
        self.results.len() as f64 / attempted as f64
    }

    pub fn finish(&mut self, end_time: f64) {
        self.end_time = Some(end_time);
    }
}

/// Top-level run configuration, covering the full set of recognized
/// configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "Config::default_timeout")]
    pub timeout_seconds: f64,
    #[serde(default)]
    pub run_name: Option<String>,
    #[serde(default)]
    pub run_metadata: HashMap<String, Value>,
    /// Single model string. Mutually exclusive with `models`; a list there
    /// triggers multi-run fan-out via the Multi-Run Runner instead.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub models: Option<Vec<String>>,
    #[serde(default)]
    pub resume_from: Option<PathBuf>,
    #[serde(default = "Config::default_true")]
    pub checkpoint_enabled: bool,
    /// Must be `"csv"`; the checkpoint format is not pluggable (spec §6.6).
    #[serde(default = "Config::default_checkpoint_format")]
    pub checkpoint_format: String,
    #[serde(default = "Config::default_true")]
    pub checkpoint_flush_each_item: bool,
    #[serde(default)]
    pub checkpoint_fsync: bool,
    #[serde(default = "Config::default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "Config::default_grace")]
    pub interrupt_grace_seconds: f64,
    #[serde(default)]
    pub platform_url: Option<String>,
    #[serde(default)]
    pub platform_api_key: Option<String>,
    #[serde(default)]
    pub resume_rerun_errors: bool,
    #[serde(default)]
    pub max_parallel_runs: Option<usize>,
}

impl Config {
    fn default_max_concurrency() -> usize {
        10
    }
    fn default_timeout() -> f64 {
        30.0
    }
    fn default_true() -> bool {
        true
    }
    fn default_checkpoint_format() -> String {
        "csv".to_string()
    }
    fn default_output_dir() -> PathBuf {
        PathBuf::from("qym_results")
    }
    fn default_grace() -> f64 {
        5.0
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: Self::default_max_concurrency(),
            timeout_seconds: Self::default_timeout(),
            run_name: None,
            run_metadata: HashMap::new(),
            model: None,
            models: None,
            resume_from: None,
            checkpoint_enabled: true,
            checkpoint_format: Self::default_checkpoint_format(),
            checkpoint_flush_each_item: true,
            checkpoint_fsync: false,
            output_dir: Self::default_output_dir(),
            interrupt_grace_seconds: Self::default_grace(),
            platform_url: None,
            platform_api_key: None,
            resume_rerun_errors: false,
            max_parallel_runs: None,
        }
    }
}

/// Strips a `provider/model` prefix, returning the substring after the
/// first `/` if present, else the input unchanged.
pub fn strip_model_provider(model_name: &str) -> String {
    if model_name.is_empty() {
        return String::new();
    }
    match model_name.find('/') {
        Some(idx) if idx > 0 => model_name[idx + 1..].to_string(),
        _ => model_name.to_string(),
    }
}

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-\d{6}-\d{4}").unwrap())
}

static RUN_ID_COUNTERS: OnceLock<Mutex<HashMap<String, u32>>> = OnceLock::new();

fn run_id_counters() -> &'static Mutex<HashMap<String, u32>> {
    RUN_ID_COUNTERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Derives `(run_id, display_name)` per the fixed format
/// `{base}-{model_stripped}-{YYMMDD-HHMM}[-{counter}]`.
///
/// If `base_name` already carries a `-YYMMDD-HHMM` segment (e.g. a
/// previously-derived run name passed back in for resume), it is treated
/// as already finalized: the timestamp is stripped for the display name
/// and no new one is stamped.
pub fn build_run_identifiers(base_name: &str, model_name: &str, now: chrono::DateTime<chrono::Local>, add_suffix: bool) -> (String, String) {
    if timestamp_re().is_match(base_name) {
        let display = timestamp_re().replace(base_name, "").to_string();
        let display = if add_suffix && !display.ends_with("_task") {
            format!("{display}_task")
        } else {
            display
        };
        return (base_name.to_string(), display);
    }

    let timestamp = now.format("%y%m%d-%H%M").to_string();
    let base_run_id = if model_name.is_empty() {
        format!("{base_name}-{timestamp}")
    } else {
        format!("{base_name}-{model_name}-{timestamp}")
    };

    let mut counters = run_id_counters().lock().expect("run id counter mutex poisoned");
    let run_id = match counters.get(&base_run_id) {
        None => {
            counters.insert(base_run_id.clone(), 0);
            base_run_id.clone()
        }
        Some(_) => {
            let count = counters.entry(base_run_id.clone()).or_insert(0);
            *count += 1;
            format!("{base_run_id}-{count}")
        }
    };

    let display = if model_name.is_empty() {
        base_name.to_string()
    } else {
        format!("{base_name}-{model_name}")
    };
    let display = if add_suffix && !display.ends_with("_task") {
        format!("{display}_task")
    } else {
        display
    };

    (run_id, display)
}

/// A stable hash of a run configuration, excluding ephemeral fields
/// (`run_name`, `resume_from`, `run_metadata`), so external tooling can
/// group runs by identical configuration.
pub fn compute_run_config_id(config: &Value) -> String {
    const EPHEMERAL: &[&str] = &["run_name", "resume_from", "run_metadata"];
    let stable: BTreeMap<&str, &Value> = config
        .as_object()
        .map(|map| {
            map.iter()
                .filter(|(k, _)| !EPHEMERAL.contains(&k.as_str()))
                .map(|(k, v)| (k.as_str(), v))
                .collect()
        })
        .unwrap_or_default();
    let raw = serde_json::to_string(&stable).unwrap_or_default();
    let digest = Sha256::digest(raw.as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_provider_prefix() {
        assert_eq!(strip_model_provider("openai/gpt-4o"), "gpt-4o");
        assert_eq!(strip_model_provider("gpt-4o"), "gpt-4o");
        assert_eq!(strip_model_provider(""), "");
    }

    #[test]
    fn run_identifiers_are_unique_on_collision() {
        let now = chrono::Local::now();
        let (id1, display1) = build_run_identifiers("suite-a", "gpt-4o", now, false);
        let (id2, display2) = build_run_identifiers("suite-a", "gpt-4o", now, false);
        assert_ne!(id1, id2);
        assert_eq!(display1, display2);
        assert!(id2.ends_with("-1"));
    }

    #[test]
    fn already_stamped_base_name_is_reused() {
        let now = chrono::Local::now();
        let (id, display) = build_run_identifiers("suite-a-gpt4o-260101-0101", "", now, false);
        assert_eq!(id, "suite-a-gpt4o-260101-0101");
        assert_eq!(display, "suite-a-gpt4o");
    }

    #[test]
    fn run_config_id_ignores_ephemeral_fields() {
        use serde_json::json;
        let a = json!({"max_concurrency": 10, "timeout_seconds": 30.0, "run_name": "run-a"});
        let b = json!({"max_concurrency": 10, "timeout_seconds": 30.0, "run_name": "run-b"});
        assert_eq!(compute_run_config_id(&a), compute_run_config_id(&b));

        let c = json!({"max_concurrency": 4, "timeout_seconds": 30.0, "run_name": "run-a"});
        assert_ne!(compute_run_config_id(&a), compute_run_config_id(&c));
        assert_eq!(compute_run_config_id(&a).len(), 16);
    }
}
