//! Structured error kinds for the evaluation runner.
//!
//! Row-level errors (`TaskFailure`, `MetricFailure`, `Timeout`) never abort a
//! run; they are recorded against the offending item and the scheduler moves
//! on. The remaining variants are structural and fatal: they are raised at
//! construction or at run start, before any worker begins.

use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum EvalError {
    #[error("task failed: {0}")]
    TaskFailure(String),

    #[error("metric '{metric}' failed: {source}")]
    MetricFailure {
        metric: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("item timed out after {0:?}")]
    Timeout(Duration),

    #[error("could not bind task adapter: {0}")]
    AdapterMismatch(String),

    #[error("resume mismatch: {0}")]
    ResumeMismatch(String),

    #[error("dataset not found: {0}")]
    DatasetMissing(String),

    #[error("credentials missing: {0}")]
    CredentialsMissing(String),

    #[error("platform stream unavailable: {0}")]
    PlatformUnavailable(String),

    #[error("checkpoint writer failed: {0}")]
    WriterFailure(String),
}

pub type EvalResult<T> = std::result::Result<T, EvalError>;
