//! Batch shaping nodes: map, filter, merge, split.
//!
//! Field selection uses the restricted path syntax of
//! [`crate::condition::resolve_path`] and filtering reuses the conditional
//! expression evaluator — there is deliberately no general-purpose expression
//! engine here.

use async_trait::async_trait;
use serde_json::Value;

use crate::condition::{Condition, resolve_path};
use crate::item::Item;
use crate::node::{Node, NodeContext, NodeError, NodeResult};

/// Sets fields on each item from restricted path expressions.
///
/// Parameters:
/// - `set` — map of destination field → path expression evaluated against
///   the item (e.g., `{"title": "payload.meta.title"}`).
/// - `overwrite` — whether existing destination fields are replaced
///   (default true).
pub struct MapNode {
    params: Value,
}

impl MapNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Node for MapNode {
    fn type_name(&self) -> &str {
        "Map"
    }

    async fn run(&self, items: &[Item], _ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let mapping = self
            .params
            .get("set")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let overwrite = self
            .params
            .get("overwrite")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let mut out_items = Vec::with_capacity(items.len());
        let mut logs = Vec::new();
        for item in items {
            let item_value = serde_json::to_value(item)?;
            let mut out = item.clone();
            for (dest, expr) in &mapping {
                let Some(expr) = expr.as_str() else {
                    continue;
                };
                if out.contains_key(dest) && !overwrite {
                    continue;
                }
                let value = resolve_path(&item_value, expr).unwrap_or(Value::Null);
                out.insert(dest.clone(), value);
            }
            out_items.push(out);
            logs.push(format!("Map applied {} rule(s)", mapping.len()));
        }
        Ok(NodeResult::with_items(out_items).with_logs(logs))
    }
}

/// Keeps only the items whose condition holds.
///
/// Parameters:
/// - `where` — restricted boolean expression (same grammar as If
///   conditions); evaluated per item with `item` bound to that item. An
///   evaluation failure keeps the item.
pub struct FilterNode {
    params: Value,
}

impl FilterNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Node for FilterNode {
    fn type_name(&self) -> &str {
        "Filter"
    }

    async fn run(&self, items: &[Item], _ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let expr = self
            .params
            .get("where")
            .and_then(Value::as_str)
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| {
                NodeError::InvalidParams("Filter requires a 'where' expression".to_string())
            })?;
        let condition = Condition::parse(expr)
            .map_err(|err| NodeError::InvalidParams(format!("Filter 'where': {err}")))?;

        let mut out_items = Vec::new();
        let mut logs = Vec::new();
        for item in items {
            let item_value = serde_json::to_value(item)?;
            let batch_value = Value::Array(vec![item_value.clone()]);
            match condition.evaluate(&item_value, &batch_value) {
                Ok(keep) => {
                    if keep {
                        out_items.push(item.clone());
                    }
                    logs.push(format!(
                        "Filter[{expr}]: {}",
                        if keep { "keep" } else { "drop" }
                    ));
                }
                Err(err) => {
                    tracing::error!(expr, error = %err, "filter evaluation failed; keeping item");
                    out_items.push(item.clone());
                    logs.push(format!("Filter error: {err}"));
                }
            }
        }
        Ok(NodeResult::with_items(out_items).with_logs(logs))
    }
}

/// Folds a nested object field into the item root.
///
/// Parameters:
/// - `from_field` — source field whose value must be an object (required).
/// - `overwrite` — whether colliding root fields are replaced (default true).
/// - `prefix` — optional prefix prepended to merged key names.
pub struct MergeNode {
    params: Value,
}

impl MergeNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Node for MergeNode {
    fn type_name(&self) -> &str {
        "Merge"
    }

    async fn run(&self, items: &[Item], _ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let from_field = self
            .params
            .get("from_field")
            .and_then(Value::as_str)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| NodeError::InvalidParams("Merge requires 'from_field'".to_string()))?;
        let overwrite = self
            .params
            .get("overwrite")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let prefix = self
            .params
            .get("prefix")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut out_items = Vec::with_capacity(items.len());
        let mut logs = Vec::new();
        for item in items {
            match item.get(from_field).and_then(Value::as_object) {
                Some(payload) => {
                    let mut out = item.clone();
                    for (key, value) in payload {
                        let dest_key = format!("{prefix}{key}");
                        if out.contains_key(&dest_key) && !overwrite {
                            continue;
                        }
                        out.insert(dest_key, value.clone());
                    }
                    logs.push(format!("Merge from={from_field} keys={}", payload.len()));
                    out_items.push(out);
                }
                None => {
                    tracing::error!(from_field, "merge source missing or not an object");
                    logs.push(format!("Merge error: '{from_field}' must be an object"));
                    out_items.push(item.clone());
                }
            }
        }
        Ok(NodeResult::with_items(out_items).with_logs(logs))
    }
}

/// Fans one item out into several, one per element of a source field.
///
/// Two modes, chosen by the source value's shape:
/// 1. list — one copy per element;
/// 2. string — split on `delimiter` first, then as the list mode.
///
/// Parameters:
/// - `from_field` — source field (required).
/// - `dest_field` — field receiving the element in each copy
///   (default `"element"`).
/// - `delimiter` — string-mode separator (default `","`).
pub struct SplitNode {
    params: Value,
}

impl SplitNode {
    #[must_use]
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Node for SplitNode {
    fn type_name(&self) -> &str {
        "Split"
    }

    async fn run(&self, items: &[Item], _ctx: &NodeContext) -> Result<NodeResult, NodeError> {
        let from_field = self
            .params
            .get("from_field")
            .and_then(Value::as_str)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| NodeError::InvalidParams("Split requires 'from_field'".to_string()))?;
        let dest_field = self
            .params
            .get("dest_field")
            .and_then(Value::as_str)
            .unwrap_or("element");
        let delimiter = self
            .params
            .get("delimiter")
            .and_then(Value::as_str)
            .unwrap_or(",");

        let mut out_items = Vec::new();
        let mut logs = Vec::new();
        for item in items {
            let elements: Option<Vec<Value>> = match item.get(from_field) {
                Some(Value::Array(list)) => Some(list.clone()),
                Some(Value::String(text)) => Some(
                    text.split(delimiter)
                        .map(|part| Value::String(part.to_string()))
                        .collect(),
                ),
                _ => None,
            };
            match elements {
                Some(elements) => {
                    logs.push(format!(
                        "Split {} element(s) from {from_field} into {dest_field}",
                        elements.len()
                    ));
                    for element in elements {
                        let mut out = item.clone();
                        out.insert(dest_field.to_string(), element);
                        out_items.push(out);
                    }
                }
                None => {
                    tracing::error!(from_field, "split source must be list or string");
                    logs.push("Split error: source must be list or string".to_string());
                    out_items.push(item.clone());
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
    use crate::state::StateManager;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> NodeContext {
        NodeContext::new(
            "sess_tx",
            Arc::new(StateManager::new(Default::default())),
            Resources::new(),
        )
    }

    fn item_with(pairs: &[(&str, Value)]) -> Item {
        let mut item = new_item();
        for (k, v) in pairs {
            item.insert((*k).to_string(), v.clone());
        }
        item
    }

    #[tokio::test]
    async fn map_sets_fields_from_paths() {
        let node = MapNode::new(json!({"set": {"title": "payload.title"}}));
        let item = item_with(&[("payload", json!({"title": "Night Market"}))]);
        let result = safe_run(&node, &[item], &ctx()).await;
        assert_eq!(result.items[0]["title"], json!("Night Market"));
    }

    #[tokio::test]
    async fn map_respects_overwrite_false() {
        let node = MapNode::new(json!({"set": {"x": "src"}, "overwrite": false}));
        let item = item_with(&[("x", json!("keep")), ("src", json!("new"))]);
        let result = safe_run(&node, &[item], &ctx()).await;
        assert_eq!(result.items[0]["x"], json!("keep"));
    }

    #[tokio::test]
    async fn filter_keeps_matching_items() {
        let node = FilterNode::new(json!({"where": "item.score > 3"}));
        let items = vec![
            item_with(&[("score", json!(5))]),
            item_with(&[("score", json!(1))]),
        ];
        let result = safe_run(&node, &items, &ctx()).await;
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0]["score"], json!(5));
    }

    #[tokio::test]
    async fn filter_without_where_errors() {
        let node = FilterNode::new(json!({}));
        let result = safe_run(&node, &[new_item()], &ctx()).await;
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn merge_folds_object_into_root() {
        let node = MergeNode::new(json!({"from_field": "meta", "prefix": "m_"}));
        let item = item_with(&[("meta", json!({"a": 1}))]);
        let result = safe_run(&node, &[item], &ctx()).await;
        assert_eq!(result.items[0]["m_a"], json!(1));
    }

    #[tokio::test]
    async fn split_list_and_string_modes() {
        let node = SplitNode::new(json!({"from_field": "parts", "dest_field": "part"}));
        let list_item = item_with(&[("parts", json!(["a", "b"]))]);
        let result = safe_run(&node, &[list_item], &ctx()).await;
        assert_eq!(result.items.len(), 2);
        assert_eq!(result.items[1]["part"], json!("b"));

        let string_item = item_with(&[("parts", json!("x|y|z"))]);
        let node = SplitNode::new(json!({"from_field": "parts", "delimiter": "|"}));
        let result = safe_run(&node, &[string_item], &ctx()).await;
        assert_eq!(result.items.len(), 3);
        assert_eq!(result.items[0]["element"], json!("x"));
    }
}
