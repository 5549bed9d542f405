//! The function task: wraps a plain callable, applying argument
//! resolution and blocking detection (for cooperative callables) or
//! unconditional thread-pool offload (for blocking ones).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::blocking::BlockingWarnings;
use super::{resolve_args, ParamSpec, TaskContext};

/// A user-supplied async callable. Implementations should be cheap to
/// clone (they're invoked once per dataset item) or wrap their state in
/// an `Arc` internally.
#[async_trait]
pub trait CooperativeFn: Send + Sync {
    async fn call(&self, args: &Value) -> anyhow::Result<Value>;
    fn name(&self) -> &str {
        "<cooperative_fn>"
    }
}

/// A user-supplied callable that performs blocking I/O or CPU work and
/// must never run directly on the scheduler's worker. Always offloaded to
/// `spawn_blocking`, unconditionally, with no probing.
pub trait BlockingFn: Send + Sync {
    fn call(&self, args: &Value) -> anyhow::Result<Value>;
    fn name(&self) -> &str {
        "<blocking_fn>"
    }
}

enum Callable {
    Cooperative(Arc<dyn CooperativeFn>, BlockingWarnings),
    Blocking(Arc<dyn BlockingFn>),
}

/// A callable task with its resolved parameter spec.
pub struct FunctionTask {
    spec: ParamSpec,
    callable: Callable,
}

impl FunctionTask {
    pub fn cooperative(spec: ParamSpec, f: Arc<dyn CooperativeFn>) -> Arc<Self> {
        Arc::new(Self {
            spec,
            callable: Callable::Cooperative(f, BlockingWarnings::default()),
        })
    }

    pub fn blocking(spec: ParamSpec, f: Arc<dyn BlockingFn>) -> Arc<Self> {
        Arc::new(Self {
            spec,
            callable: Callable::Blocking(f),
        })
    }

    pub async fn invoke(&self, input: Value, ctx: TaskContext) -> anyhow::Result<Value> {
        let resolved = resolve_args(&self.spec, &input, ctx.model_name.as_deref(), ctx.trace_id.as_deref());
        let args = if resolved.positional.is_empty() {
            Value::Object(resolved.named.into_iter().collect())
        } else {
            // Ambiguous positional case (spec §4.1 step 5, multi-param
            // non-mapping input): pass the raw input through unchanged,
            // since Rust callables have no positional-arg binding to
            // target without named parameters.
            input.clone()
        };

        match &self.callable {
            Callable::Cooperative(f, warnings) => {
                let callable_id = Arc::as_ptr(f) as *const () as usize;
                warnings.run_probed(f.name(), callable_id, f.call(&args)).await
            }
            Callable::Blocking(f) => {
                let f = f.clone();
                let args = args.clone();
                tokio::task::spawn_blocking(move || f.call(&args))
                    .await
                    .map_err(|e| anyhow::anyhow!("blocking task panicked: {e}"))?
            }
        }
    }
}
