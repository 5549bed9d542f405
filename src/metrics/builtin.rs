//! Built-in metrics shipped with the crate: `exact_match` (ported from
//! `evaluators/exact_match.rs`'s chat/JSON response comparison to a plain
//! `serde_json::Value` equality check) and `regex_match` (ported from
//! `evaluators/regex.rs` from an LLM-inference-response comparison to a
//! plain string/regex match over `output`).

use regex::Regex;
use serde_json::Value;

use super::SyncMetric;
use crate::types::{Score, ScoreValue};

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// `1.0`/`0.0` on whether `output` and `expected` stringify to the same
/// text. An absent `expected` yields an unscored result rather than a
/// match or a mismatch.
pub struct ExactMatch;

impl SyncMetric for ExactMatch {
    fn score(&self, output: &Value, expected: Option<&Value>, _input: &Value) -> anyhow::Result<Score> {
        let Some(expected) = expected else {
            return Ok(Score::Object(ScoreValue {
                score: None,
                metadata: None,
                error: None,
            }));
        };
        if output.is_null() {
            return Ok(Score::Number(0.0));
        }
        Ok(Score::Bool(stringify(output) == stringify(expected)))
    }
}

/// Whether `output`'s stringified text matches a fixed regex pattern.
/// `expected` and `input` are ignored — the pattern is baked in at
/// construction.
pub struct RegexMatch {
    pattern: Regex,
}

impl RegexMatch {
    pub fn new(pattern: &str) -> anyhow::Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| anyhow::anyhow!("invalid regex pattern '{pattern}': {e}"))?;
        Ok(Self { pattern })
    }
}

impl SyncMetric for RegexMatch {
    fn score(&self, output: &Value, _expected: Option<&Value>, _input: &Value) -> anyhow::Result<Score> {
        let text = stringify(output);
        Ok(Score::Bool(self.pattern.is_match(&text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exact_match_compares_stringified_values() {
        let metric = ExactMatch;
        assert!(matches!(metric.score(&json!("X"), Some(&json!("X")), &Value::Null).unwrap(), Score::Bool(true)));
        assert!(matches!(metric.score(&json!("X"), Some(&json!("Y")), &Value::Null).unwrap(), Score::Bool(false)));
    }

    #[test]
    fn exact_match_with_no_expected_is_unscored() {
        let metric = ExactMatch;
        let score = metric.score(&json!("X"), None, &Value::Null).unwrap();
        assert!(score.numeric().is_none());
        assert!(!score.is_error());
    }

    #[test]
    fn regex_match_checks_pattern() {
        let metric = RegexMatch::new(r"^\d+$").unwrap();
        assert!(matches!(metric.score(&json!("1234"), None, &Value::Null).unwrap(), Score::Bool(true)));
        assert!(matches!(metric.score(&json!("12a4"), None, &Value::Null).unwrap(), Score::Bool(false)));
    }

    #[test]
    fn invalid_pattern_is_rejected_at_construction() {
        assert!(RegexMatch::new("(unclosed").is_err());
    }
}
