//! The chain task: wraps an object exposing an `invoke`-shaped call, the
//! way a LangChain runnable does. Input dicts are passed through
//! unchanged; non-dict input is wrapped under an `input` key (or the
//! chain's declared input key, if it reports one).

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::TaskContext;

#[async_trait]
pub trait ChainLike: Send + Sync {
    /// The chain's first declared input key, if any (mirrors LangChain's
    /// `input_keys[0]`). Used only to name the wrapper key for non-dict
    /// input; chains with no declared key fall back to `"input"`.
    fn input_key(&self) -> Option<&str> {
        None
    }

    async fn invoke_raw(&self, input: Value) -> anyhow::Result<Value>;
}

impl dyn ChainLike {
    pub async fn invoke(&self, input: Value, ctx: TaskContext) -> anyhow::Result<Value> {
        let mut chain_input = match input {
            Value::Object(map) => map,
            other => {
                let key = self.input_key().unwrap_or("input");
                let mut map = Map::new();
                map.insert(key.to_string(), other);
                map
            }
        };

        if let Some(model) = &ctx.model_name {
            chain_input.entry("model").or_insert_with(|| json!(model));
            chain_input.entry("model_name").or_insert_with(|| json!(model));
        }

        let output = self.invoke_raw(Value::Object(chain_input)).await?;

        Ok(match output {
            Value::Object(ref map) => {
                if let Some(v) = map.get("output") {
                    v.clone()
                } else {
                    output
                }
            }
            other => other,
        })
    }
}
