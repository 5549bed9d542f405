//! The client task: wraps an API-client-like object exposing a `create`
//! operation, the way an OpenAI-style client does. If the input is a
//! mapping and a model name is set, `model` is injected into the payload
//! unless already present.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::TaskContext;

#[async_trait]
pub trait ClientLike: Send + Sync {
    async fn create(&self, payload: Value) -> anyhow::Result<Value>;
}

impl dyn ClientLike {
    pub async fn invoke(&self, input: Value, ctx: TaskContext) -> anyhow::Result<Value> {
        let payload = match (&ctx.model_name, input) {
            (Some(model), Value::Object(mut map)) => {
                map.entry("model").or_insert_with(|| json!(model));
                Value::Object(map)
            }
            (_, other) => other,
        };
        self.create(payload).await
    }
}
