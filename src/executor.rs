//! The flow executor: recursive interpretation of flow documents.
//!
//! `execute_ref` resolves a document by `id@version` and evaluates it
//! starting at its entry node. Composite semantics:
//!
//! - **Sequence** — children run in declared order, each receiving the batch
//!   produced by the previous one; logs concatenate in order.
//! - **If** — a restricted condition (see [`crate::condition`]) selects the
//!   `then` or `else` children, which then run like a Sequence. Evaluation
//!   failure selects `else`; a missing condition is a validation failure.
//! - **Subflow** — the referenced document runs against input-mapped copies
//!   of the parent items, with a shared execution context, and its output is
//!   merged back positionally through the output map.
//! - anything else — an atomic node resolved from the registry and invoked
//!   through the safe-execution wrapper.
//!
//! Execution is fully synchronous from the caller's perspective: children are
//! awaited strictly in order and the call returns only once the whole graph,
//! nested sub-flows included, has completed. Cyclic sub-flow references are
//! not statically detected.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::instrument;

use crate::condition::Condition;
use crate::ir::{FlowDocument, IrError, IrLoader, NodeSpec, SubflowSpec};
use crate::item::Item;
use crate::node::{NodeContext, NodeResult, safe_run};
use crate::registry::{NodeRegistry, RegistryError};

/// Errors surfaced by flow execution.
///
/// All variants are client-facing failures, never process crashes: the
/// caller maps validation and not-found conditions to request errors.
#[derive(Debug, Error, Diagnostic)]
pub enum ExecError {
    /// Document lookup or validation failure from the loader.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Ir(#[from] IrError),

    /// Structural failure discovered during dispatch (unknown child id,
    /// malformed composite spec).
    #[error("flow validation failed: {message}")]
    #[diagnostic(code(loomflow::executor::validation))]
    Validation { message: String },

    /// The registry has no implementation for an atomic node's type.
    #[error(transparent)]
    #[diagnostic(transparent)]
    UnknownNodeType(#[from] RegistryError),
}

impl ExecError {
    fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

type NodeMap = FxHashMap<String, NodeSpec>;

/// The central control-flow engine: interprets loaded flow documents and
/// dispatches atomic nodes.
pub struct FlowExecutor {
    registry: Arc<NodeRegistry>,
    loader: Arc<IrLoader>,
}

impl FlowExecutor {
    #[must_use]
    pub fn new(registry: Arc<NodeRegistry>, loader: Arc<IrLoader>) -> Self {
        Self { registry, loader }
    }

    /// The loader backing this executor.
    #[must_use]
    pub fn loader(&self) -> &Arc<IrLoader> {
        &self.loader
    }

    /// Execute a registered flow by `id@version`.
    #[instrument(skip(self, items, ctx), err)]
    pub async fn execute_ref(
        &self,
        flow_ref: &str,
        items: &[Item],
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecError> {
        let doc = self.loader.get(flow_ref)?;
        let node_map = self.loader.node_map(flow_ref)?;
        self.run_entry(&doc, &node_map, items, ctx).await
    }

    /// Execute an unregistered document directly (same validation path as
    /// registration).
    pub async fn execute_doc(
        &self,
        doc: &FlowDocument,
        items: &[Item],
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecError> {
        IrLoader::validate(doc)?;
        let mut node_map = NodeMap::default();
        for spec in &doc.nodes {
            node_map.insert(spec.id.clone(), spec.clone());
        }
        self.run_entry(doc, &node_map, items, ctx).await
    }

    async fn run_entry(
        &self,
        doc: &FlowDocument,
        node_map: &NodeMap,
        items: &[Item],
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecError> {
        let entry_spec = Self::node_spec(node_map, &doc.entry)?;
        self.run_spec(entry_spec, node_map, items.to_vec(), ctx)
            .await
    }

    fn node_spec<'m>(node_map: &'m NodeMap, node_id: &str) -> Result<&'m NodeSpec, ExecError> {
        node_map
            .get(node_id)
            .ok_or_else(|| ExecError::validation(format!("unknown node id: {node_id}")))
    }

    /// Core dispatch: decide how to run one node spec.
    ///
    /// Boxed so Sequence/Subflow recursion has a nameable future type.
    fn run_spec<'a>(
        &'a self,
        spec: &'a NodeSpec,
        node_map: &'a NodeMap,
        items: Vec<Item>,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<NodeResult, ExecError>> {
        Box::pin(async move {
            let node_type = spec.node_type.trim();
            if node_type.is_empty() {
                return Err(ExecError::validation(format!(
                    "node '{}' missing 'type'",
                    spec.id
                )));
            }
            match node_type {
                "Sequence" => self.run_sequence(spec, node_map, items, ctx).await,
                "If" => self.run_conditional(spec, node_map, items, ctx).await,
                "Subflow" => self.run_subflow(spec, items, ctx).await,
                _ => self.run_atomic(spec, items, ctx).await,
            }
        })
    }

    async fn run_sequence(
        &self,
        spec: &NodeSpec,
        node_map: &NodeMap,
        items: Vec<Item>,
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecError> {
        let children = spec.children.clone().unwrap_or_default();
        let mut logs = Vec::new();
        let mut current = items;
        for child_id in &children {
            let child_spec = Self::node_spec(node_map, child_id)?;
            let result = self
                .run_spec(child_spec, node_map, current, ctx)
                .await?;
            logs.extend(result.logs);
            current = result.items;
        }
        let mut metrics = FxHashMap::default();
        metrics.insert("type".to_string(), json!("Sequence"));
        metrics.insert("items_out".to_string(), json!(current.len()));
        Ok(NodeResult::with_items(current)
            .with_logs(logs)
            .with_metrics(metrics))
    }

    async fn run_conditional(
        &self,
        spec: &NodeSpec,
        node_map: &NodeMap,
        items: Vec<Item>,
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecError> {
        let conditional = spec.conditional.clone().unwrap_or_default();
        let expr = conditional.condition.as_deref().unwrap_or_default();
        if expr.trim().is_empty() {
            return Err(ExecError::validation(format!(
                "If node '{}' requires a string condition",
                spec.id
            )));
        }
        let truthy = Self::evaluate_condition(expr, &items);
        let selected = if truthy {
            &conditional.then_ids
        } else {
            &conditional.else_ids
        };

        let mut logs = vec![format!(
            "If[{}] condition={}",
            spec.id,
            if truthy { "then" } else { "else" }
        )];
        let mut current = items;
        for child_id in selected {
            let child_spec = Self::node_spec(node_map, child_id)?;
            let result = self
                .run_spec(child_spec, node_map, current, ctx)
                .await?;
            logs.extend(result.logs);
            current = result.items;
        }
        let mut metrics = FxHashMap::default();
        metrics.insert("type".to_string(), json!("If"));
        Ok(NodeResult::with_items(current)
            .with_logs(logs)
            .with_metrics(metrics))
    }

    /// Evaluate an If condition against `{first item, full batch, len}`.
    ///
    /// Any parse or evaluation failure is treated as falsy rather than
    /// propagated.
    fn evaluate_condition(expr: &str, items: &[Item]) -> bool {
        let condition = match Condition::parse(expr) {
            Ok(condition) => condition,
            Err(err) => {
                tracing::debug!(expr, error = %err, "condition parse failed; selecting else");
                return false;
            }
        };
        let first = items
            .first()
            .and_then(|it| serde_json::to_value(it).ok())
            .unwrap_or_else(|| json!({}));
        let batch = serde_json::to_value(items).unwrap_or_else(|_| json!([]));
        match condition.evaluate(&first, &batch) {
            Ok(truthy) => truthy,
            Err(err) => {
                tracing::debug!(expr, error = %err, "condition evaluation failed; selecting else");
                false
            }
        }
    }

    async fn run_subflow(
        &self,
        spec: &NodeSpec,
        items: Vec<Item>,
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecError> {
        let subflow: &SubflowSpec = spec.subflow.as_ref().ok_or_else(|| {
            ExecError::validation(format!("Subflow node '{}' missing 'subflow' spec", spec.id))
        })?;
        if subflow.flow_ref.parse::<crate::ir::FlowRef>().is_err() {
            return Err(ExecError::validation(format!(
                "Subflow node '{}' ref must be 'id@version', got '{}'",
                spec.id, subflow.flow_ref
            )));
        }
        if !subflow.share_state {
            // The isolation flag is currently inert: the child always shares
            // the parent's state manager.
            tracing::debug!(
                flow = %subflow.flow_ref,
                "share_state=false requested; running shared anyway"
            );
        }

        let mapped = Self::apply_input_map(&items, &subflow.input_map);
        tracing::info!(flow = %subflow.flow_ref, share_state = subflow.share_state, "subflow call");
        let sub_result = self.execute_ref(&subflow.flow_ref, &mapped, ctx).await?;

        let merged = Self::apply_output_map(&items, &sub_result.items, &subflow.output_map);
        let mut logs = sub_result.logs;
        logs.push(format!("Subflow[{}] executed", subflow.flow_ref));
        let mut metrics = FxHashMap::default();
        metrics.insert("type".to_string(), json!("Subflow"));
        metrics.insert("items_out".to_string(), json!(merged.len()));
        Ok(NodeResult::with_items(merged)
            .with_logs(logs)
            .with_metrics(metrics))
    }

    /// Map parent items to sub-flow input: plain copies, plus `dest = source`
    /// for every rename pair present in the item.
    fn apply_input_map(items: &[Item], input_map: &FxHashMap<String, String>) -> Vec<Item> {
        if input_map.is_empty() {
            return items.to_vec();
        }
        items
            .iter()
            .map(|item| {
                let mut out = item.clone();
                for (source, dest) in input_map {
                    if let Some(value) = item.get(source) {
                        out.insert(dest.clone(), value.clone());
                    }
                }
                out
            })
            .collect()
    }

    /// Merge sub-flow output back into the parent batch.
    ///
    /// No output map ⇒ the sub-flow's batch is used directly. Otherwise the
    /// batches align positionally: each merged item starts from a copy of the
    /// parent item and takes `dest = source` for every pair present in the
    /// sub item; surplus sub items are appended unmodified.
    fn apply_output_map(
        parent_items: &[Item],
        sub_items: &[Item],
        output_map: &FxHashMap<String, String>,
    ) -> Vec<Item> {
        if output_map.is_empty() {
            return sub_items.to_vec();
        }
        let aligned = parent_items.len().min(sub_items.len());
        let mut merged = Vec::with_capacity(sub_items.len());
        for i in 0..aligned {
            let mut base = parent_items[i].clone();
            for (source, dest) in output_map {
                if let Some(value) = sub_items[i].get(source) {
                    base.insert(dest.clone(), value.clone());
                }
            }
            merged.push(base);
        }
        for sub_item in &sub_items[aligned..] {
            merged.push(sub_item.clone());
        }
        merged
    }

    async fn run_atomic(
        &self,
        spec: &NodeSpec,
        items: Vec<Item>,
        ctx: &NodeContext,
    ) -> Result<NodeResult, ExecError> {
        let params = if spec.params.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            spec.params.clone()
        };
        let node = self.registry.build(&spec.node_type, params)?;
        Ok(safe_run(node.as_ref(), &items, ctx).await)
    }
}
