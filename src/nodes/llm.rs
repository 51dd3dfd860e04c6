//! Language-model invocation node.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::item::{Item, str_field};
use crate::message::{Message, sanitize_messages};
use crate::node::{Node, NodeContext, NodeError, NodeResult};
use crate::resources::state_system_prompt;

/// Calls the language model and writes its reply into each item.
///
/// Parameters:
/// - `model` — logical model name passed to the [`LlmClient`]
///   (default `"narrative-llm"`).
/// - `messages_from` — item field holding the message list (default
///   `"messages"`).
/// - `response_field` — item field receiving the reply (default
///   `"llm_response"`).
///
/// Items without a usable message list get a minimal fallback: a system
/// message rendered from the prompt-facing state plus the item's
/// `user_input`.
///
/// [`LlmClient`]: crate::resources::LlmClient
pub struct LlmChatNode {
    params: Value,
}

impl LlmChatNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

fn fallback_messages(item: &Item, ctx: &NodeContext) -> Vec<Message> {
    let state_for_prompt = ctx.state.read_for_prompt();
    let mut messages = vec![Message::system(&state_system_prompt(&state_for_prompt))];
    if let Some(user_text) = str_field(item, "user_input") {
        let trimmed = user_text.trim();
        if !trimmed.is_empty() {
            messages.push(Message::user(trimmed));
        }
    }
    messages
}

#[async_trait]
impl Node for LlmChatNode {
    fn type_name(&self) -> &str {
        "LlmChat"
    }

    async fn run(&self, items: &[Item], ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let model = self
            .params
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("narrative-llm");
        let messages_field = self
            .params
            .get("messages_from")
            .and_then(Value::as_str)
            .unwrap_or("messages");
        let response_field = self
            .params
            .get("response_field")
            .and_then(Value::as_str)
            .unwrap_or("llm_response");

        let llm = ctx
            .resources
            .llm()
            .ok_or(NodeError::MissingResource { name: "llm" })?;

        let mut out_items = Vec::with_capacity(items.len());
        let mut logs = Vec::new();
        for item in items {
            let messages = match item.get(messages_field) {
                Some(raw) if raw.is_array() => sanitize_messages(raw),
                _ => fallback_messages(item, ctx),
            };
            match llm.call_model(&messages, model).await {
                Ok(reply) => {
                    let mut out = item.clone();
                    out.insert(response_field.to_string(), json!(reply));
                    out_items.push(out);
                    logs.push(format!("LlmChat: model={model}, field={response_field}"));
                }
                Err(err) => {
                    tracing::error!(model, error = %err, "LlmChat call failed");
                    out_items.push(item.clone());
                    logs.push(format!("LlmChat error: {err}"));
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
    use crate::resources::{MockLlm, Resources};
    use crate::state::StateManager;
    use std::sync::Arc;

    fn ctx() -> NodeContext {
        NodeContext::new(
            "sess_llm",
            Arc::new(StateManager::new(Default::default())),
            Resources::new().with_llm(Arc::new(MockLlm)),
        )
    }

    #[tokio::test]
    async fn writes_reply_into_response_field() {
        let node = LlmChatNode::new(json!({"model": "narrative-llm"}));
        let mut item = new_item();
        item.insert("user_input".into(), json!("go north"));
        let result = safe_run(&node, &[item], &ctx()).await;
        assert!(result.errors.is_empty());
        let reply = result.items[0]["llm_response"].as_str().unwrap();
        assert!(reply.contains("night market"));
    }

    #[tokio::test]
    async fn uses_messages_field_when_present() {
        let node = LlmChatNode::new(json!({"model": "analyzer-llm", "response_field": "mood"}));
        let mut item = new_item();
        item.insert(
            "messages".into(),
            json!([{"role": "user", "content": "attack the guard"}]),
        );
        let result = safe_run(&node, &[item], &ctx()).await;
        assert!(
            result.items[0]["mood"]
                .as_str()
                .unwrap()
                .contains("aggressive")
        );
    }

    #[tokio::test]
    async fn missing_llm_resource_is_recoverable() {
        let bare = NodeContext::new(
            "sess_llm",
            Arc::new(StateManager::new(Default::default())),
            Resources::new(),
        );
        let node = LlmChatNode::new(json!({}));
        let mut item = new_item();
        item.insert("user_input".into(), json!("hi"));
        let result = safe_run(&node, &[item.clone()], &bare).await;
        assert_eq!(result.items, vec![item]);
        assert_eq!(result.errors.len(), 1);
    }
}
