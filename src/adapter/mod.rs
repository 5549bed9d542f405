//! Uniform call interface over heterogeneous user task shapes.
//!
//! A [`Task`] is a sum type over the three shapes a user can hand the
//! evaluator: a plain function, a chain-like object with an `invoke`
//! method, and an API-client-like object with a `create` operation.
//! Callers pick the matching variant explicitly at construction time
//! rather than relying on runtime shape detection.

mod blocking;
mod chain;
mod client;
mod function;

pub use blocking::BlockingWarnings;
pub use chain::ChainLike;
pub use client::ClientLike;
pub use function::{CooperativeFn, FunctionTask};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EvalError;

/// Arguments available to a task invocation, beyond the item's input.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    /// The full, provider-prefixed model string (if any). Bound verbatim —
    /// the run id and paths use the stripped form, but the task itself
    /// always sees the full string.
    pub model_name: Option<String>,
    pub trace_id: Option<String>,
}

/// How an ordinary (non-reserved) parameter is classified during
/// construction. `ParamSpec` captures everything [`resolve_args`] needs
/// without any runtime reflection.
#[derive(Debug, Clone, Default)]
pub struct ParamSpec {
    /// Ordinary parameter names, in declaration order.
    pub params: Vec<String>,
    /// Name bound to `model`/`model_name` in the callable's signature.
    pub model_param: Option<String>,
    /// Name bound to `trace_id` in the callable's signature.
    pub trace_id_param: Option<String>,
    /// Whether the callable accepts an open keyword catch-all.
    pub accepts_kwargs: bool,
}

/// The outcome of argument resolution: what to pass positionally, and
/// what to pass as named arguments (only meaningful for [`Task::Function`]
/// callables implemented over a keyword-accepting shape; most Rust
/// callables will simply destructure `named` themselves).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedArgs {
    pub positional: Vec<Value>,
    pub named: std::collections::BTreeMap<String, Value>,
}

/// Pure argument-resolution algorithm (spec §4.1). No I/O, no signature
/// reflection — `spec` is supplied explicitly at construction.
pub fn resolve_args(spec: &ParamSpec, input: &Value, model_name: Option<&str>, trace_id: Option<&str>) -> ResolvedArgs {
    let mut named = std::collections::BTreeMap::new();
    let mut positional = Vec::new();

    if let Some(model_param) = &spec.model_param {
        named.insert(model_param.clone(), model_name.map(Value::from).unwrap_or(Value::Null));
    } else if spec.accepts_kwargs {
        if let Some(model) = model_name {
            named.insert("model".to_string(), Value::from(model));
        }
    }

    if let Some(trace_param) = &spec.trace_id_param {
        named.insert(trace_param.clone(), trace_id.map(Value::from).unwrap_or(Value::Null));
    } else if spec.accepts_kwargs {
        if let Some(tid) = trace_id {
            named.insert("trace_id".to_string(), Value::from(tid));
        }
    }

    match input {
        Value::Object(map) => {
            let matches_key = spec.params.iter().any(|p| map.contains_key(p));
            let has_multiple_params = spec.params.len() > 1;

            if matches_key || has_multiple_params || spec.accepts_kwargs {
                for (key, value) in map {
                    if spec.params.contains(key) || spec.accepts_kwargs {
                        named.insert(key.clone(), value.clone());
                    }
                }
                if !matches_key && spec.params.len() == 1 {
                    let only = &spec.params[0];
                    named.entry(only.clone()).or_insert_with(|| input.clone());
                }
            } else if spec.params.len() == 1 {
                named.insert(spec.params[0].clone(), input.clone());
            }
            // zero params, no kwargs: nothing to pass, side-effect only task
        }
        other => {
            if spec.params.len() == 1 {
                named.insert(spec.params[0].clone(), other.clone());
            } else if spec.params.len() > 1 {
                positional.push(other.clone());
            }
            // zero params: nothing to pass
        }
    }

    ResolvedArgs { positional, named }
}

/// A uniform, callable task. Constructed once per evaluation and shared
/// (via `Arc`) across worker tasks.
#[derive(Clone)]
pub enum Task {
    Function(Arc<FunctionTask>),
    Chain(Arc<dyn ChainLike>),
    Client(Arc<dyn ClientLike>),
}

#[async_trait]
pub trait Invoke: Send + Sync {
    async fn invoke(&self, input: Value, ctx: TaskContext) -> anyhow::Result<Value>;
}

impl Task {
    pub async fn invoke(&self, input: Value, ctx: TaskContext) -> anyhow::Result<Value> {
        match self {
            Task::Function(f) => f.invoke(input, ctx).await,
            Task::Chain(c) => c.invoke(input, ctx).await,
            Task::Client(c) => c.invoke(input, ctx).await,
        }
    }
}

/// Construction-time auto-detection has no Rust equivalent to rely on —
/// callers construct the specific `Task` variant they mean.
/// `unsupported_task_type` exists only to give callers building a thin
/// dynamic-dispatch layer (e.g. a plugin loader) a consistent fatal-error
/// shape when nothing matches.
pub fn unsupported_task_type(description: &str) -> EvalError {
    EvalError::AdapterMismatch(format!("cannot determine task adapter for {description}: must be a function, chain (`invoke`), or client (`create`)"))
}
