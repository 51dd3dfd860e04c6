//! Whitelisted code-function node.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};

use crate::item::{Item, str_field};
use crate::message::Message;
use crate::node::{Node, NodeContext, NodeError, NodeResult};
use crate::resources::state_system_prompt;

/// Runs a named function from the context's code-function whitelist against
/// each item and merges the produced fields back in.
///
/// Parameters:
/// - `function` — name of a function registered on
///   [`Resources`](crate::resources::Resources).
/// - `outputs` — optional list restricting which produced keys are merged;
///   omitted means all of them.
///
/// An unknown function name falls back to the default context selector,
/// which builds a `messages` list from the prompt-facing state and the item's
/// `user_input` — the most common use of this node.
pub struct CodeNode {
    params: Value,
}

impl CodeNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

/// Fallback context/message builder used when no function is named or the
/// named one is absent.
fn default_context_selector(
    item: &Item,
    ctx: &NodeContext,
) -> Result<FxHashMap<String, Value>, NodeError> {
    let state_for_prompt = ctx.state.read_for_prompt();
    let system_content = state_system_prompt(&state_for_prompt);
    let mut messages = vec![Message::system(&system_content)];
    if let Some(user_text) = str_field(item, "user_input") {
        let trimmed = user_text.trim();
        if !trimmed.is_empty() {
            messages.push(Message::user(trimmed));
        }
    }

    let mut produced = FxHashMap::default();
    produced.insert("messages".to_string(), serde_json::to_value(messages)?);
    produced.insert(
        "context_slots".to_string(),
        json!({"state_for_prompt": state_for_prompt}),
    );
    Ok(produced)
}

#[async_trait]
impl Node for CodeNode {
    fn type_name(&self) -> &str {
        "Code"
    }

    async fn run(&self, items: &[Item], ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let fn_name = self.params.get("function").and_then(Value::as_str);
        let outputs: Option<Vec<String>> = self
            .params
            .get("outputs")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            });

        let chosen = fn_name.and_then(|name| {
            let found = ctx.resources.code_fn(name);
            if found.is_none() {
                tracing::warn!(function = name, "code function not found; using default");
            }
            found
        });

        let mut out_items = Vec::with_capacity(items.len());
        let mut logs = Vec::new();
        for item in items {
            let produced = match &chosen {
                Some(func) => func(item, ctx),
                None => default_context_selector(item, ctx),
            };
            match produced {
                Ok(produced) => {
                    let mut out = item.clone();
                    match &outputs {
                        Some(keys) => {
                            for key in keys {
                                if let Some(value) = produced.get(key) {
                                    out.insert(key.clone(), value.clone());
                                }
                            }
                        }
                        None => {
                            for (key, value) in produced {
                                out.insert(key, value);
                            }
                        }
                    }
                    out_items.push(out);
                    logs.push(format!(
                        "Code: applied {}",
                        fn_name.unwrap_or("<default>")
                    ));
                }
                Err(err) => {
                    tracing::error!(error = %err, "code function failed on item");
                    out_items.push(item.clone());
                    logs.push(format!("Code error: {err}"));
                }
            }
        }

        Ok(NodeResult::with_items(out_items).with_logs(logs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::new_item;
    use crate::node::safe_run;
    use crate::resources::Resources;
    use crate::state::{StateManager, StateMap};
    use std::sync::Arc;

    fn ctx_with(resources: Resources) -> NodeContext {
        let mut state = StateMap::default();
        state.insert("location".into(), json!("tavern"));
        NodeContext::new("sess_code", Arc::new(StateManager::new(state)), resources)
    }

    #[tokio::test]
    async fn default_selector_builds_messages() {
        let node = CodeNode::new(json!({}));
        let mut item = new_item();
        item.insert("user_input".into(), json!("look"));
        let result = safe_run(&node, &[item], &ctx_with(Resources::new())).await;
        let messages = result.items[0]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0]["content"].as_str().unwrap().contains("location"));
    }

    #[tokio::test]
    async fn named_function_with_output_filter() {
        let resources = Resources::new().with_code_fn(
            "probe",
            Arc::new(|_item: &Item, _ctx: &NodeContext| {
                let mut produced = FxHashMap::default();
                produced.insert("wanted".to_string(), json!(1));
                produced.insert("ignored".to_string(), json!(2));
                Ok(produced)
            }),
        );
        let node = CodeNode::new(json!({"function": "probe", "outputs": ["wanted"]}));
        let result = safe_run(&node, &[new_item()], &ctx_with(resources)).await;
        let item = &result.items[0];
        assert_eq!(item["wanted"], json!(1));
        assert!(!item.contains_key("ignored"));
    }

    #[tokio::test]
    async fn unknown_function_falls_back() {
        let node = CodeNode::new(json!({"function": "ghost"}));
        let result = safe_run(&node, &[new_item()], &ctx_with(Resources::new())).await;
        assert!(result.items[0].contains_key("messages"));
    }
}
