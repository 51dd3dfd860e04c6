//! Capability-scoped resources available to nodes.
//!
//! Nodes never reach for globals: everything external they may touch — the
//! language-model caller and the whitelist of named code functions — is
//! handed to them through [`Resources`] on the execution context. The map is
//! assembled once per request/job by the engine.
//!
//! The language-model caller is an external collaborator: only the
//! [`LlmClient`] trait ships here, plus [`MockLlm`], a deterministic
//! stand-in that keeps the engine fully exercisable offline and doubles as
//! the test double.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::json;
use thiserror::Error;

use crate::item::{Item, str_field};
use crate::message::Message;
use crate::node::{NodeContext, NodeError};
use crate::state::StateMap;

/// Error surface of a language-model call.
#[derive(Debug, Error, Diagnostic)]
pub enum LlmError {
    #[error("llm transport error: {0}")]
    #[diagnostic(code(loomflow::llm::transport))]
    Transport(String),

    #[error("llm response missing content")]
    #[diagnostic(code(loomflow::llm::empty_response))]
    EmptyResponse,
}

/// A language-model caller: messages in, text out.
///
/// Model names are logical (`"narrative-llm"`, `"analyzer-llm"`); resolving
/// them to concrete deployments is the implementation's business.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call_model(&self, messages: &[Message], model: &str) -> Result<String, LlmError>;
}

/// A whitelisted code function: consumes one item plus the execution context
/// and produces fields to merge back into the item.
pub type CodeFn =
    dyn Fn(&Item, &NodeContext) -> Result<FxHashMap<String, serde_json::Value>, NodeError>
        + Send
        + Sync;

/// Resource map handed to nodes through the execution context.
#[derive(Clone, Default)]
pub struct Resources {
    llm: Option<Arc<dyn LlmClient>>,
    code_funcs: FxHashMap<String, Arc<CodeFn>>,
}

impl Resources {
    /// Empty resource map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard per-request assembly: the given model caller plus the two
    /// shipped message builders.
    #[must_use]
    pub fn standard(llm: Arc<dyn LlmClient>) -> Self {
        Self::new()
            .with_llm(llm)
            .with_code_fn("build_analyzer_messages", Arc::new(build_analyzer_messages))
            .with_code_fn("build_guidance_messages", Arc::new(build_guidance_messages))
    }

    /// Attach a language-model caller.
    #[must_use]
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Register a named code function.
    #[must_use]
    pub fn with_code_fn(
        mut self,
        name: &str,
        func: Arc<CodeFn>,
    ) -> Self {
        self.code_funcs.insert(name.to_string(), func);
        self
    }

    /// The language-model caller, if any is registered.
    #[must_use]
    pub fn llm(&self) -> Option<Arc<dyn LlmClient>> {
        self.llm.clone()
    }

    /// Look up a whitelisted code function by name.
    #[must_use]
    pub fn code_fn(&self, name: &str) -> Option<Arc<CodeFn>> {
        self.code_funcs.get(name).cloned()
    }
}

/// Render a state map into a compact system prompt block.
///
/// Keys are sorted so the rendering is stable across runs.
#[must_use]
pub fn state_system_prompt(state: &StateMap) -> String {
    let mut keys: Vec<&String> = state.keys().collect();
    keys.sort();
    if keys.is_empty() {
        return "[world_state]\n(empty)".to_string();
    }
    let body: Vec<String> = keys
        .iter()
        .map(|k| format!("{k}={}", state[k.as_str()]))
        .collect();
    format!("[world_state]\n{}", body.join("\n"))
}

/// Build the message list for the analyzer/status-update path from the
/// prompt-facing state and the item's `text` (falling back to
/// `llm_response` / `narrative`).
pub fn build_analyzer_messages(
    item: &Item,
    ctx: &NodeContext,
) -> Result<FxHashMap<String, serde_json::Value>, NodeError> {
    let state_for_prompt = ctx.state.read_for_prompt();
    let system_content = state_system_prompt(&state_for_prompt);

    let text = str_field(item, "text")
        .or_else(|| str_field(item, "llm_response"))
        .or_else(|| str_field(item, "narrative"))
        .unwrap_or_default();

    let mut messages = vec![Message::system(&system_content)];
    if !text.is_empty() {
        messages.push(Message::user(text));
    }

    let mut produced = FxHashMap::default();
    produced.insert("messages".to_string(), serde_json::to_value(messages)?);
    Ok(produced)
}

/// Build the message list for the guidance path: a narrow slice of state
/// plus the most recent narrative text, asking for behind-the-scenes
/// direction.
pub fn build_guidance_messages(
    item: &Item,
    ctx: &NodeContext,
) -> Result<FxHashMap<String, serde_json::Value>, NodeError> {
    let state_for_prompt = ctx.state.read_for_prompt();
    let mut system_lines = vec!["[guidance_context]".to_string()];
    for key in ["location", "protagonist_mood", "turn_count"] {
        if let Some(value) = state_for_prompt.get(key) {
            system_lines.push(format!("{key}={value}"));
        }
    }

    let recent = str_field(item, "narrative")
        .or_else(|| str_field(item, "text"))
        .unwrap_or_default();
    let user_content = if recent.is_empty() {
        "Suggest behind-the-scenes direction for the next story beat.".to_string()
    } else {
        format!("Based on the recent narrative, suggest behind-the-scenes direction:\n{recent}")
    };

    let messages = vec![
        Message::system(&system_lines.join("\n")),
        Message::user(&user_content),
    ];

    let mut produced = FxHashMap::default();
    produced.insert("messages".to_string(), serde_json::to_value(messages)?);
    Ok(produced)
}

/// Deterministic offline language model.
///
/// Responses are canned per logical model name, keyed on the input just
/// enough to make state transitions observable in tests and demos.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockLlm;

#[async_trait]
impl LlmClient for MockLlm {
    async fn call_model(&self, messages: &[Message], model: &str) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.has_role(Message::USER))
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let response = match model {
            "narrative-llm" => {
                "Neon rain sheets off the awnings as you slip deeper into the night market."
                    .to_string()
            }
            "analyzer-llm" => {
                if last_user.contains("attack") || last_user.contains("flee") {
                    "[updated mood] adrenaline-spiked and aggressive".to_string()
                } else {
                    "[updated mood] wary, but settling".to_string()
                }
            }
            "guidance-llm" => {
                "Introduce the informant earlier than planned; keep the broker offstage."
                    .to_string()
            }
            other => format!("[unknown model reply] {other}"),
        };
        Ok(response)
    }
}
