//! State access nodes: read, write, counter increment.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::item::Item;
use crate::node::{Node, NodeContext, NodeError, NodeResult};
use crate::state::StateMap;

/// Reads state and writes the selected slice into each item.
///
/// Parameters:
/// - `keys` — state keys to read; omitted reads everything.
/// - `into` — destination item field (default `"state"`).
/// - `for_prompt` — when true, pending keys fall back to their Last-Stable
///   values (default false).
pub struct ReadStateNode {
    params: Value,
}

impl ReadStateNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Node for ReadStateNode {
    fn type_name(&self) -> &str {
        "ReadState"
    }

    async fn run(&self, items: &[Item], ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let keys: Option<Vec<String>> = match self.params.get("keys") {
            None | Some(Value::Null) => None,
            Some(Value::Array(list)) => Some(
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            ),
            Some(other) => {
                return Err(NodeError::InvalidParams(format!(
                    "ReadState.keys must be a list, got {other}"
                )));
            }
        };
        let into = self
            .params
            .get("into")
            .and_then(Value::as_str)
            .unwrap_or("state");
        let for_prompt = self
            .params
            .get("for_prompt")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let slice = ctx.state.read(keys.as_deref(), for_prompt);
        let slice_value = serde_json::to_value(&slice)?;

        let out_items: Vec<Item> = items
            .iter()
            .map(|item| {
                let mut out = item.clone();
                out.insert(into.to_string(), slice_value.clone());
                out
            })
            .collect();
        let logs = vec![format!(
            "ReadState into={into} keys={}",
            keys.as_ref()
                .map(|k| k.join(","))
                .unwrap_or_else(|| "<all>".to_string())
        )];
        Ok(NodeResult::with_items(out_items).with_logs(logs))
    }
}

/// Writes updates into the state manager through the synchronous path.
///
/// Items pass through unchanged; this node is pure side effect. Two sources
/// of updates combine, mapped values winning ties:
/// - `updates` — literal key/value pairs.
/// - `from_item_map` — item-field → state-field mapping, read from the first
///   item of the batch.
pub struct WriteStateNode {
    params: Value,
}

impl WriteStateNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Node for WriteStateNode {
    fn type_name(&self) -> &str {
        "WriteState"
    }

    async fn run(&self, items: &[Item], ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let mut combined = StateMap::default();
        if let Some(direct) = self.params.get("updates").and_then(Value::as_object) {
            for (key, value) in direct {
                combined.insert(key.clone(), value.clone());
            }
        }
        if let Some(mapping) = self.params.get("from_item_map").and_then(Value::as_object) {
            // Only the first item feeds mapped updates.
            if let Some(first) = items.first() {
                for (source, dest) in mapping {
                    if let (Some(value), Some(dest)) = (first.get(source), dest.as_str()) {
                        combined.insert(dest.to_string(), value.clone());
                    }
                }
            }
        }

        let logs = if combined.is_empty() {
            vec!["WriteState no-op: no updates".to_string()]
        } else {
            let mut keys: Vec<&String> = combined.keys().collect();
            keys.sort();
            let line = format!(
                "WriteState committed: {}",
                keys.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(",")
            );
            ctx.state.write_sync(combined);
            vec![line]
        };

        Ok(NodeResult::with_items(items.to_vec()).with_logs(logs))
    }
}

/// Adds one to a numeric state field through the synchronous write path.
///
/// Parameters:
/// - `field` — the counter field name (required).
pub struct IncrementCounterNode {
    params: Value,
}

impl IncrementCounterNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Node for IncrementCounterNode {
    fn type_name(&self) -> &str {
        "IncrementCounter"
    }

    async fn run(&self, items: &[Item], ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let field = self
            .params
            .get("field")
            .and_then(Value::as_str)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| {
                NodeError::InvalidParams(
                    "IncrementCounter requires 'field' (non-empty string)".to_string(),
                )
            })?;

        let current = ctx
            .state
            .working_state()
            .get(field)
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let next = current + 1;
        let mut updates = StateMap::default();
        updates.insert(field.to_string(), json!(next));
        ctx.state.write_sync(updates);

        let logs = vec![format!("IncrementCounter: {field} -> {next}")];
        Ok(NodeResult::with_items(items.to_vec()).with_logs(logs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::new_item;
    use crate::node::safe_run;
    use crate::resources::Resources;
    use crate::state::StateManager;
    use std::sync::Arc;

    fn ctx() -> NodeContext {
        let mut state = StateMap::default();
        state.insert("turn_count".into(), json!(2));
        state.insert("mood".into(), json!("wary"));
        NodeContext::new(
            "sess_state",
            Arc::new(StateManager::new(state)),
            Resources::new(),
        )
    }

    #[tokio::test]
    async fn read_state_selects_keys() {
        let node = ReadStateNode::new(json!({"keys": ["mood"], "into": "slice"}));
        let result = safe_run(&node, &[new_item()], &ctx()).await;
        assert_eq!(result.items[0]["slice"], json!({"mood": "wary"}));
    }

    #[tokio::test]
    async fn write_state_combines_direct_and_mapped() {
        let ctx = ctx();
        let node = WriteStateNode::new(json!({
            "updates": {"weather": "rain"},
            "from_item_map": {"llm_response": "last_narrative"}
        }));
        let mut item = new_item();
        item.insert("llm_response".into(), json!("a reply"));
        let result = safe_run(&node, &[item.clone()], &ctx).await;
        // Items pass through untouched.
        assert_eq!(result.items, vec![item]);
        let state = ctx.state.working_state();
        assert_eq!(state["weather"], json!("rain"));
        assert_eq!(state["last_narrative"], json!("a reply"));
    }

    #[tokio::test]
    async fn increment_counter_bumps_field() {
        let ctx = ctx();
        let node = IncrementCounterNode::new(json!({"field": "turn_count"}));
        safe_run(&node, &[new_item()], &ctx).await;
        assert_eq!(ctx.state.working_state()["turn_count"], json!(3));
    }

    #[tokio::test]
    async fn increment_counter_requires_field() {
        let node = IncrementCounterNode::new(json!({}));
        let result = safe_run(&node, &[new_item()], &ctx()).await;
        assert_eq!(result.errors.len(), 1);
    }
}
