//! Evaluation runner: a concurrent scheduler that drives dataset items
//! through (task → metrics → scoring), a checkpoint/resume engine
//! guaranteeing at-most-once appended results under crash or interrupt,
//! and an observer fan-out that delivers ordered per-item lifecycle
//! events to a terminal dashboard and/or a remote platform.
//!
//! [`run_evaluation`] is the composition root: it wires a [`DatasetSource`]
//! through an [`Evaluator`] (or, when `config.models` is set, a
//! [`MultiRunRunner`]), attaches the requested observers, and returns the
//! final [`RunState`]. Embedding programs supply the user [`Task`]
//! directly — there is no dynamic task-loading surface, since tasks are
//! native Rust closures/objects rather than strings naming an importable
//! callable.

pub mod adapter;
pub mod checkpoint;
pub mod cli;
pub mod dataset;
pub mod error;
pub mod evaluator;
pub mod helpers;
pub mod metrics;
pub mod multi_runner;
pub mod observers;
pub mod platform;
pub mod stats;
pub mod types;

use std::sync::Arc;

use tracing::instrument;

use crate::adapter::Task;
use crate::dataset::DatasetSource;
use crate::error::EvalError;
use crate::evaluator::Evaluator;
use crate::metrics::MetricRegistry;
use crate::multi_runner::MultiRunRunner;
use crate::observers::Observer;
use crate::types::{Config, RunState};

/// One completed run, or several when `config.models` triggered fan-out.
pub enum EvaluationOutcome {
    Single(RunState),
    MultiRun(Vec<RunState>),
}

impl EvaluationOutcome {
    /// All contained run states, regardless of whether this was a single
    /// run or a multi-model fan-out.
    pub fn runs(&self) -> Vec<&RunState> {
        match self {
            EvaluationOutcome::Single(state) => vec![state],
            EvaluationOutcome::MultiRun(states) => states.iter().collect(),
        }
    }
}

/// Runs one evaluation end to end. Dispatches to [`MultiRunRunner`] when
/// `config.models` names more than zero models, otherwise a single
/// [`Evaluator`] run using `config.model`.
#[instrument(skip_all, fields(task_name = %task_name.as_ref()))]
pub async fn run_evaluation(
    task_name: impl AsRef<str>,
    task: Task,
    dataset: Arc<dyn DatasetSource>,
    metrics: Vec<String>,
    registry: MetricRegistry,
    config: Config,
    observers: Vec<Arc<dyn Observer>>,
) -> Result<EvaluationOutcome, EvalError> {
    let task_name = task_name.as_ref().to_string();

    if let Some(models) = &config.models {
        if !models.is_empty() {
            let mut runner = MultiRunRunner::new(task_name, task, dataset, metrics, registry, config);
            for observer in observers {
                runner.add_observer(observer);
            }
            let states = runner.run().await?;
            return Ok(EvaluationOutcome::MultiRun(states));
        }
    }

    let mut evaluator = Evaluator::new(task_name, task, dataset, metrics, registry, config);
    for observer in observers {
        evaluator.add_observer(observer);
    }
    let state = evaluator.run().await?;
    Ok(EvaluationOutcome::Single(state))
}
