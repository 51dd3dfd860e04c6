//! Node execution contract for the loomflow workflow engine.
//!
//! This module provides the core abstractions for executable workflow steps:
//! the [`Node`] trait, the execution context handed to every node, the
//! [`NodeResult`] value nodes return, and the mandatory safe-execution
//! wrapper that makes every node call non-throwing from the executor's point
//! of view.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use thiserror::Error;

use crate::item::{Item, copy_batch};
use crate::resources::Resources;
use crate::state::StateManager;

/// Core trait defining executable atomic workflow nodes.
///
/// A node is one unit of computation: it receives a batch of [`Item`]s plus
/// an execution context and produces a [`NodeResult`]. Composite semantics
/// (sequences, conditionals, sub-flows) live in the executor; nodes only ever
/// see flat batches.
///
/// # Contract
///
/// - Implementations must not mutate the input batch; the slice is shared and
///   the caller may keep using it after the call. Produce new items instead.
/// - Per-item failures should be recoverable: keep the item unchanged, record
///   the error in the result, and continue. Reserve `Err(NodeError)` for
///   failures that invalidate the whole invocation (e.g., unusable
///   parameters).
/// - Every invocation goes through [`safe_run`], which normalizes input,
///   captures timing metrics, and converts an `Err` into an error-carrying
///   result.
///
/// # Examples
///
/// ```rust
/// use loomflow::item::Item;
/// use loomflow::node::{Node, NodeContext, NodeError, NodeResult};
/// use async_trait::async_trait;
/// use serde_json::json;
///
/// struct TagNode;
///
/// #[async_trait]
/// impl Node for TagNode {
///     fn type_name(&self) -> &str {
///         "Tag"
///     }
///
///     async fn run(&self, items: &[Item], _ctx: &NodeContext) -> Result<NodeResult, NodeError> {
///         let out: Vec<Item> = items
///             .iter()
///             .map(|it| {
///                 let mut copy = it.clone();
///                 copy.insert("tagged".into(), json!(true));
///                 copy
///             })
///             .collect();
///         Ok(NodeResult::with_items(out))
///     }
/// }
/// ```
#[async_trait]
pub trait Node: Send + Sync {
    /// The registry type name of this node (e.g., `"LlmChat"`).
    fn type_name(&self) -> &str;

    /// Execute this node against a batch of items.
    async fn run(&self, items: &[Item], ctx: &NodeContext) -> Result<NodeResult, NodeError>;
}

/// Factory signature for constructing a node from an IR parameter bag.
pub type NodeFactory = Arc<dyn Fn(Value) -> Arc<dyn Node> + Send + Sync>;

/// Execution context passed to nodes during workflow execution.
///
/// Carries the identity of the session being served, the dual-view state
/// manager, and the capability-scoped resource map (language-model caller,
/// whitelisted code functions). Logging is ambient through `tracing`.
#[derive(Clone)]
pub struct NodeContext {
    /// Identifier of the session this execution serves.
    pub session_id: String,
    /// Dual-view state manager for this execution.
    pub state: Arc<StateManager>,
    /// Capability-scoped resources available to nodes.
    pub resources: Resources,
}

impl NodeContext {
    /// Build a context for one execution.
    #[must_use]
    pub fn new(session_id: impl Into<String>, state: Arc<StateManager>, resources: Resources) -> Self {
        Self {
            session_id: session_id.into(),
            state,
            resources,
        }
    }
}

/// Result of one node invocation.
///
/// A result with a non-empty `errors` list still carries a best-effort output
/// batch (typically the unmodified input): node failure is non-fatal to the
/// surrounding pipeline by default.
#[derive(Clone, Debug, Default)]
pub struct NodeResult {
    /// Output batch produced by the node.
    pub items: Vec<Item>,
    /// Human-readable log lines, concatenated in order by composite nodes.
    pub logs: Vec<String>,
    /// Metrics mapping; [`safe_run`] guarantees at least `type`,
    /// `duration_ms`, `items_in` and `items_out`.
    pub metrics: FxHashMap<String, Value>,
    /// Recoverable errors captured during execution.
    pub errors: Vec<String>,
}

impl NodeResult {
    /// Create a result carrying only an output batch.
    #[must_use]
    pub fn with_items(items: Vec<Item>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }

    /// Attach log lines.
    #[must_use]
    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }

    /// Attach a metrics mapping.
    #[must_use]
    pub fn with_metrics(mut self, metrics: FxHashMap<String, Value>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Attach recoverable errors.
    #[must_use]
    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }
}

/// Errors that can occur during node execution.
///
/// These are invocation-fatal from the node's perspective; [`safe_run`]
/// converts them into an error-carrying [`NodeResult`] so the pipeline keeps
/// going.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// A node parameter is missing or has the wrong shape.
    #[error("invalid node parameters: {0}")]
    #[diagnostic(
        code(loomflow::node::invalid_params),
        help("Check the node's parameter bag in the flow document.")
    )]
    InvalidParams(String),

    /// A required resource is absent from the execution context.
    #[error("missing resource: {name}")]
    #[diagnostic(
        code(loomflow::node::missing_resource),
        help("Register the resource on the Resources map before executing.")
    )]
    MissingResource { name: &'static str },

    /// External provider (e.g., language model) failure.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(loomflow::node::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    #[diagnostic(code(loomflow::node::serde_json))]
    Serde(#[from] serde_json::Error),
}

/// Invoke a node through the mandatory safe-execution layer.
///
/// Normalizes the input (defensive per-item copy), runs the node, fills in
/// any missing standard metrics fields, and converts an `Err` into a result
/// whose batch equals the normalized input, whose error list carries the
/// failure message, and whose metrics still report timing. Callers can rely
/// on this never failing.
pub async fn safe_run(node: &dyn Node, items: &[Item], ctx: &NodeContext) -> NodeResult {
    let start = Instant::now();
    let normalized = copy_batch(items);
    let items_in = normalized.len();

    let mut result = match node.run(&normalized, ctx).await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(
                node = node.type_name(),
                session = %ctx.session_id,
                error = %err,
                "node execution failed"
            );
            NodeResult::with_items(normalized)
                .with_logs(vec![format!("error:{err}")])
                .with_errors(vec![err.to_string()])
        }
    };

    let elapsed_ms = start.elapsed().as_millis() as u64;
    result
        .metrics
        .entry("type".to_string())
        .or_insert_with(|| json!(node.type_name()));
    result
        .metrics
        .entry("duration_ms".to_string())
        .or_insert_with(|| json!(elapsed_ms));
    result
        .metrics
        .entry("items_in".to_string())
        .or_insert_with(|| json!(items_in));
    let items_out = result.items.len();
    result
        .metrics
        .entry("items_out".to_string())
        .or_insert_with(|| json!(items_out));
    result
}
