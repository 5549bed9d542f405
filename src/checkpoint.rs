//! Append-only CSV checkpoint log. This is the canonical persisted form
//! of a run: every other output (JSON, a rendered summary) is derived
//! from it, never the other way around.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::error::EvalError;
use crate::types::{ItemError, ItemResult, Score, ScoreValue};

const BASE_FIELDS: &[&str] = &[
    "dataset_name",
    "run_name",
    "run_metadata",
    "run_config",
    "trace_id",
    "item_id",
    "input",
    "item_metadata",
    "output",
    "expected_output",
    "time",
    "task_started_at_ms",
];

/// Builds the fixed header: base fields, then `{metric}_score` /
/// `{metric}__meta__json` per metric, in declaration order.
pub fn build_checkpoint_header(metrics: &[String]) -> Vec<String> {
    let mut header: Vec<String> = BASE_FIELDS.iter().map(|s| s.to_string()).collect();
    for metric in metrics {
        header.push(format!("{metric}_score"));
        header.push(format!("{metric}__meta__json"));
    }
    header
}

/// One row's worth of scores plus the identifying fields needed to
/// serialize it. A separate type from [`ItemResult`]/[`ItemError`] since a
/// row may represent either (the error case carries a synthetic
/// `"N/A"`/`"ERROR: ..."` payload rather than structured data).
pub struct CheckpointRow {
    pub dataset_name: String,
    pub run_name: String,
    pub run_metadata: Value,
    pub run_config: Value,
    pub trace_id: Option<String>,
    pub item_id: String,
    pub input: Value,
    pub item_metadata: Value,
    pub output: Value,
    pub expected_output: Option<Value>,
    pub time_seconds: Option<f64>,
    pub task_started_at_ms: Option<i64>,
    pub scores: HashMap<String, Score>,
}

impl CheckpointRow {
    pub fn from_success(dataset_name: &str, run_name: &str, run_metadata: &Value, run_config: &Value, item_id: &str, result: &ItemResult, item_metadata: Value) -> Self {
        Self {
            dataset_name: dataset_name.to_string(),
            run_name: run_name.to_string(),
            run_metadata: run_metadata.clone(),
            run_config: run_config.clone(),
            trace_id: result.trace_id.clone(),
            item_id: item_id.to_string(),
            input: result.input.clone(),
            item_metadata,
            output: result.output.clone(),
            expected_output: result.expected.clone(),
            time_seconds: Some(result.time_seconds),
            task_started_at_ms: Some(result.task_started_at_ms),
            scores: result.scores.clone(),
        }
    }

    pub fn from_error(dataset_name: &str, run_name: &str, run_metadata: &Value, run_config: &Value, item_id: &str, input: Value, item_metadata: Value, error: &ItemError, metrics: &[String]) -> Self {
        let mut scores = HashMap::new();
        for metric in metrics {
            scores.insert(
                metric.clone(),
                Score::Text("N/A".to_string()),
            );
        }
        Self {
            dataset_name: dataset_name.to_string(),
            run_name: run_name.to_string(),
            run_metadata: run_metadata.clone(),
            run_config: run_config.clone(),
            trace_id: error.trace_id.clone(),
            item_id: item_id.to_string(),
            input,
            item_metadata,
            output: json!(format!("ERROR: {}", error.error_message)),
            expected_output: None,
            time_seconds: None,
            task_started_at_ms: error.task_started_at_ms,
            scores,
        }
    }
}

fn value_to_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn score_cells(score: Option<&Score>) -> (String, String) {
    match score {
        None => (String::new(), String::new()),
        Some(Score::Number(n)) => (n.to_string(), String::new()),
        Some(Score::Bool(b)) => (b.to_string(), String::new()),
        Some(Score::Text(t)) => (t.clone(), String::new()),
        Some(Score::Object(ScoreValue { score, metadata, error })) => {
            let score_cell = if let Some(err) = error {
                format!("ERROR: {err}")
            } else {
                match score {
                    Some(Value::Null) | None => String::new(),
                    Some(v) => value_to_cell(v),
                }
            };
            let meta_cell = metadata.as_ref().map(|m| m.to_string()).unwrap_or_default();
            (score_cell, meta_cell)
        }
    }
}

/// Serializes one [`CheckpointRow`] into header-ordered string cells.
pub fn serialize_checkpoint_row(row: &CheckpointRow, metrics: &[String]) -> Vec<String> {
    let mut cells = vec![
        row.dataset_name.clone(),
        row.run_name.clone(),
        row.run_metadata.to_string(),
        row.run_config.to_string(),
        row.trace_id.clone().unwrap_or_default(),
        row.item_id.clone(),
        value_to_cell(&row.input),
        row.item_metadata.to_string(),
        value_to_cell(&row.output),
        row.expected_output.as_ref().map(value_to_cell).unwrap_or_default(),
        row.time_seconds.map(|t| t.to_string()).unwrap_or_default(),
        row.task_started_at_ms.map(|t| t.to_string()).unwrap_or_default(),
    ];
    for metric in metrics {
        let (score_cell, meta_cell) = score_cells(row.scores.get(metric));
        cells.push(score_cell);
        cells.push(meta_cell);
    }
    cells
}

/// A single dedicated writer owns the open file handle; workers only ever
/// enqueue rows to it via a channel (see `evaluator.rs`). This keeps
/// writes totally ordered without per-worker locking.
pub struct CheckpointWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    metrics: Vec<String>,
    flush_each_item: bool,
    fsync: bool,
}

impl CheckpointWriter {
    /// Opens `path` for append, creating parent directories as needed.
    /// Writes the header only if the file is new or empty; an existing
    /// non-empty file is assumed to already carry a matching header (the
    /// scheduler is responsible for verifying that at resume time).
    ///
    /// `flush_each_item` trades throughput for durability: when false, rows
    /// accumulate in the `BufWriter` and only reach the OS on `close()`.
    /// `fsync` only has an effect when `flush_each_item` is also true, since
    /// there's nothing to sync to disk otherwise.
    pub fn open(path: &Path, metrics: &[String], flush_each_item: bool, fsync: bool) -> Result<Self, EvalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EvalError::WriterFailure(format!("creating checkpoint directory: {e}")))?;
        }
        let needs_header = !path.exists() || path.metadata().map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| EvalError::WriterFailure(format!("opening checkpoint file: {e}")))?;
        let mut writer = BufWriter::new(file);

        if needs_header {
            let header = build_checkpoint_header(metrics);
            let mut record = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
            record.write_record(&header).map_err(|e| EvalError::WriterFailure(e.to_string()))?;
            let bytes = record.into_inner().map_err(|e| EvalError::WriterFailure(e.to_string()))?;
            writer.write_all(&bytes).map_err(|e| EvalError::WriterFailure(e.to_string()))?;
            writer.flush().map_err(|e| EvalError::WriterFailure(e.to_string()))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            metrics: metrics.to_vec(),
            flush_each_item,
            fsync,
        })
    }

    /// Writes exactly one row. Whether it reaches the OS buffer immediately
    /// depends on `flush_each_item`; `fsync` is an explicit opt-in (default
    /// off) for crash-consistency at the cost of throughput, nested inside
    /// that same per-row flush.
    pub fn append_row(&mut self, row: &CheckpointRow) -> Result<(), EvalError> {
        let cells = serialize_checkpoint_row(row, &self.metrics);
        let mut record = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
        record.write_record(&cells).map_err(|e| EvalError::WriterFailure(e.to_string()))?;
        let bytes = record.into_inner().map_err(|e| EvalError::WriterFailure(e.to_string()))?;
        self.writer.write_all(&bytes).map_err(|e| EvalError::WriterFailure(e.to_string()))?;
        if self.flush_each_item {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EvalError> {
        self.writer.flush().map_err(|e| EvalError::WriterFailure(e.to_string()))?;
        if self.fsync {
            self.writer.get_ref().sync_all().map_err(|e| EvalError::WriterFailure(e.to_string()))?;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<(), EvalError> {
        self.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Resume-state reconstructed from an existing checkpoint file.
#[derive(Debug, Clone, Default)]
pub struct CheckpointState {
    pub path: PathBuf,
    pub dataset_name: String,
    pub run_name: String,
    pub metrics: Vec<String>,
    pub completed_item_ids: HashSet<String>,
    pub error_item_ids: HashSet<String>,
}

fn parse_numeric_score(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();
    match lower.as_str() {
        "n/a" | "na" | "none" => return None,
        "true" | "yes" | "y" => return Some(1.0),
        "false" | "no" | "n" => return Some(0.0),
        "1" | "1.0" => return Some(1.0),
        "0" | "0.0" => return Some(0.0),
        _ => {}
    }
    if trimmed == "✓" {
        return Some(1.0);
    }
    if trimmed == "✗" {
        return Some(0.0);
    }
    if let Some(pct) = trimmed.strip_suffix('%') {
        return pct.trim().parse::<f64>().ok().map(|n| n / 100.0);
    }
    trimmed.parse::<f64>().ok()
}

fn is_error_row(output: &str, first_metric_score: Option<&str>) -> bool {
    if output.starts_with("ERROR:") || output.starts_with("ERROR ") {
        return true;
    }
    if let Some(score) = first_metric_score {
        let normalized = score.trim().to_uppercase();
        return normalized.contains("ERROR") || normalized == "N/A";
    }
    false
}

/// Reads the header row of `path`, deriving the sorted metric-name set
/// from columns ending `_score` (excluding `__meta__` columns), then
/// classifies every row as completed or errored.
pub fn load_checkpoint_state(path: &Path) -> Result<CheckpointState, EvalError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| EvalError::WriterFailure(format!("opening checkpoint for resume: {e}")))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| EvalError::WriterFailure(e.to_string()))?
        .iter()
        .map(|s| s.to_string())
        .collect();

    let metrics: BTreeSet<String> = headers
        .iter()
        .filter(|h| h.ends_with("_score") && !h.contains("__meta__"))
        .map(|h| h.trim_end_matches("_score").to_string())
        .collect();
    let metrics: Vec<String> = metrics.into_iter().collect();

    let item_id_idx = headers.iter().position(|h| h == "item_id");
    let output_idx = headers.iter().position(|h| h == "output");
    let dataset_name_idx = headers.iter().position(|h| h == "dataset_name");
    let run_name_idx = headers.iter().position(|h| h == "run_name");
    let first_score_idx = metrics.first().and_then(|m| headers.iter().position(|h| h == &format!("{m}_score")));

    let mut state = CheckpointState {
        path: path.to_path_buf(),
        metrics,
        ..Default::default()
    };
    let mut first_row = true;

    for record in reader.records() {
        let record = record.map_err(|e| EvalError::WriterFailure(e.to_string()))?;
        let item_id = item_id_idx.and_then(|i| record.get(i)).unwrap_or_default().to_string();
        if item_id.is_empty() {
            continue;
        }
        if first_row {
            if let Some(i) = dataset_name_idx {
                state.dataset_name = record.get(i).unwrap_or_default().to_string();
            }
            if let Some(i) = run_name_idx {
                state.run_name = record.get(i).unwrap_or_default().to_string();
            }
            first_row = false;
        }

        let output = output_idx.and_then(|i| record.get(i)).unwrap_or_default();
        let first_score = first_score_idx.and_then(|i| record.get(i));
        if is_error_row(output, first_score) {
            state.error_item_ids.insert(item_id);
        } else {
            state.completed_item_ids.insert(item_id);
        }
    }

    Ok(state)
}

/// True if any completed id matches the synthetic `item_<index>` pattern
/// the scheduler falls back to when the dataset itself has no stable ids.
/// Per spec, once any row uses this scheme the whole resumed run switches
/// to it, to keep numbering consistent.
pub fn uses_synthetic_ids(completed_item_ids: &HashSet<String>) -> bool {
    completed_item_ids.iter().any(|id| {
        id.strip_prefix("item_")
            .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false)
    })
}

/// A parsed checkpoint row's recovered content: either a success result or
/// an error, keyed by `item_id`.
pub enum ParsedRow {
    Success(ItemResult),
    Error(ItemError),
}

/// Maps one checkpoint row back to an [`ItemResult`] or [`ItemError`].
pub fn parse_checkpoint_row(headers: &[String], record: &csv::StringRecord, metrics: &[String]) -> Option<(String, ParsedRow)> {
    let get = |name: &str| -> Option<&str> { headers.iter().position(|h| h == name).and_then(|i| record.get(i)) };

    let item_id = get("item_id")?.to_string();
    let output_raw = get("output").unwrap_or_default();
    let first_score_raw = metrics.first().and_then(|m| get(&format!("{m}_score")));

    let input: Value = get("input").map(|s| serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string()))).unwrap_or(Value::Null);
    let expected_output: Option<Value> = get("expected_output").and_then(|s| {
        if s.is_empty() {
            None
        } else {
            serde_json::from_str(s).ok().or_else(|| Some(Value::String(s.to_string())))
        }
    });
    let trace_id = get("trace_id").filter(|s| !s.is_empty()).map(str::to_string);
    let time_seconds = get("time").and_then(|s| s.parse::<f64>().ok());
    let task_started_at_ms = get("task_started_at_ms").and_then(|s| s.trim().parse::<f64>().ok()).map(|f| f as i64);

    if is_error_row(output_raw, first_score_raw) {
        let message = output_raw.strip_prefix("ERROR:").or_else(|| output_raw.strip_prefix("ERROR")).unwrap_or(output_raw).trim().to_string();
        return Some((
            item_id,
            ParsedRow::Error(ItemError {
                error_message: message,
                trace_id,
                task_started_at_ms,
            }),
        ));
    }

    let output: Value = serde_json::from_str(output_raw).unwrap_or_else(|_| Value::String(output_raw.to_string()));
    let mut scores = HashMap::new();
    for metric in metrics {
        let score_col = format!("{metric}_score");
        let meta_col = format!("{metric}__meta__json");
        let raw_score = get(&score_col).unwrap_or_default();
        let raw_meta = get(&meta_col).filter(|s| !s.is_empty());

        let score = if raw_score.is_empty() {
            continue;
        } else if let Some(meta_json) = raw_meta {
            let metadata: Option<Value> = serde_json::from_str(meta_json).ok();
            Score::Object(ScoreValue {
                score: parse_numeric_score(raw_score).map(|n| json!(n)).or_else(|| Some(json!(raw_score))),
                metadata,
                error: None,
            })
        } else if let Some(n) = parse_numeric_score(raw_score) {
            Score::Number(n)
        } else {
            Score::Text(raw_score.to_string())
        };
        scores.insert(metric.clone(), score);
    }

    Some((
        item_id,
        ParsedRow::Success(ItemResult {
            input,
            output,
            expected: expected_output,
            scores,
            trace_id,
            trace_url: None,
            time_seconds: time_seconds.unwrap_or(0.0),
            task_started_at_ms: task_started_at_ms.unwrap_or(0),
            success: true,
        }),
    ))
}

/// Iterates every data row of an existing checkpoint file, yielding
/// `(headers, record)` pairs for [`parse_checkpoint_row`] to consume.
pub fn iter_checkpoint_rows(path: &Path) -> Result<(Vec<String>, csv::Reader<File>), EvalError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| EvalError::WriterFailure(e.to_string()))?;
    let headers: Vec<String> = reader.headers().map_err(|e| EvalError::WriterFailure(e.to_string()))?.iter().map(|s| s.to_string()).collect();
    Ok((headers, reader))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemResult;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn sample_result() -> ItemResult {
        let mut scores = HashMap::new();
        scores.insert("exact_match".to_string(), Score::Number(1.0));
        ItemResult {
            input: json!("x"),
            output: json!("X"),
            expected: Some(json!("X")),
            scores,
            trace_id: Some("trace-1".to_string()),
            trace_url: None,
            time_seconds: 0.01,
            task_started_at_ms: 1000,
            success: true,
        }
    }

    #[test]
    fn header_has_base_plus_two_per_metric() {
        let header = build_checkpoint_header(&["exact_match".to_string(), "regex".to_string()]);
        assert_eq!(header.len(), 12 + 4);
        assert_eq!(header[12], "exact_match_score");
        assert_eq!(header[13], "exact_match__meta__json");
    }

    #[test]
    fn numeric_score_parsing_table() {
        assert_eq!(parse_numeric_score(""), None);
        assert_eq!(parse_numeric_score("N/A"), None);
        assert_eq!(parse_numeric_score("true"), Some(1.0));
        assert_eq!(parse_numeric_score("no"), Some(0.0));
        assert_eq!(parse_numeric_score("✓"), Some(1.0));
        assert_eq!(parse_numeric_score("✗"), Some(0.0));
        assert_eq!(parse_numeric_score("75%"), Some(0.75));
        assert_eq!(parse_numeric_score("0.42"), Some(0.42));
    }

    #[test]
    fn write_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.csv");
        let metrics = vec!["exact_match".to_string()];

        let mut writer = CheckpointWriter::open(&path, &metrics, true, false).unwrap();
        let row = CheckpointRow::from_success("ds", "run-1", &json!({}), &json!({}), "a", &sample_result(), json!({}));
        writer.append_row(&row).unwrap();
        writer.close().unwrap();

        let state = load_checkpoint_state(&path).unwrap();
        assert_eq!(state.dataset_name, "ds");
        assert_eq!(state.run_name, "run-1");
        assert_eq!(state.metrics, vec!["exact_match".to_string()]);
        assert!(state.completed_item_ids.contains("a"));
        assert!(state.error_item_ids.is_empty());
    }

    #[test]
    fn unflushed_rows_are_still_durable_after_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.csv");
        let metrics = vec!["exact_match".to_string()];

        let mut writer = CheckpointWriter::open(&path, &metrics, false, false).unwrap();
        let row = CheckpointRow::from_success("ds", "run-1", &json!({}), &json!({}), "a", &sample_result(), json!({}));
        writer.append_row(&row).unwrap();
        writer.close().unwrap();

        let state = load_checkpoint_state(&path).unwrap();
        assert!(state.completed_item_ids.contains("a"));
    }

    #[test]
    fn error_row_detection() {
        assert!(is_error_row("ERROR: boom", None));
        assert!(is_error_row("fine", Some("N/A")));
        assert!(!is_error_row("fine", Some("1.0")));
    }

    #[test]
    fn synthetic_id_detection() {
        let mut ids = HashSet::new();
        ids.insert("item_12".to_string());
        assert!(uses_synthetic_ids(&ids));
        let mut ids2 = HashSet::new();
        ids2.insert("a".to_string());
        assert!(!uses_synthetic_ids(&ids2));
    }
}
