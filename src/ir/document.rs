//! Typed model of flow documents.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to a flow document: `id@version`.
///
/// # Examples
///
/// ```
/// use loomflow::ir::FlowRef;
///
/// let r: FlowRef = "main@1".parse().unwrap();
/// assert_eq!(r.id, "main");
/// assert_eq!(r.version, 1);
/// assert_eq!(r.to_string(), "main@1");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowRef {
    pub id: String,
    pub version: u64,
}

impl FlowRef {
    #[must_use]
    pub fn new(id: impl Into<String>, version: u64) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

impl fmt::Display for FlowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

impl std::str::FromStr for FlowRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, version) = s
            .rsplit_once('@')
            .ok_or_else(|| format!("flow ref must be 'id@version': {s}"))?;
        if id.is_empty() {
            return Err(format!("flow ref has empty id: {s}"));
        }
        let version = version
            .parse::<u64>()
            .map_err(|_| format!("flow ref has non-numeric version: {s}"))?;
        Ok(Self::new(id, version))
    }
}

/// A complete flow document: identity, entry point, and node specs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowDocument {
    pub id: String,
    pub version: u64,
    /// Node id where execution starts.
    pub entry: String,
    /// Ordered node specs; ids must be unique within the document.
    pub nodes: Vec<NodeSpec>,
}

impl FlowDocument {
    /// The `id@version` reference of this document.
    #[must_use]
    pub fn flow_ref(&self) -> FlowRef {
        FlowRef::new(self.id.clone(), self.version)
    }
}

/// One node spec inside a document.
///
/// Composite types carry extra structure: `Sequence` uses `children`, `If`
/// uses `if`, `Subflow` uses `subflow`. Atomic types carry only `params`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    /// Parameter bag handed to atomic node factories.
    #[serde(default)]
    pub params: Value,
    /// Ordered child ids for `Sequence` nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<String>>,
    /// Branching structure for `If` nodes.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub conditional: Option<ConditionalSpec>,
    /// Sub-flow invocation for `Subflow` nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subflow: Option<SubflowSpec>,
}

/// Branching structure of an `If` node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConditionalSpec {
    /// Restricted boolean expression; must be present and non-blank.
    #[serde(default)]
    pub condition: Option<String>,
    /// Child ids run when the condition holds.
    #[serde(rename = "then", default)]
    pub then_ids: Vec<String>,
    /// Child ids run otherwise.
    #[serde(rename = "else", default)]
    pub else_ids: Vec<String>,
}

/// Sub-flow invocation carried by a `Subflow` node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubflowSpec {
    /// Target document reference, `id@version`.
    #[serde(rename = "ref")]
    pub flow_ref: String,
    /// Parent-field → child-field renames applied on the way in.
    #[serde(default)]
    pub input_map: FxHashMap<String, String>,
    /// Child-field → parent-field renames applied on the way back.
    #[serde(default)]
    pub output_map: FxHashMap<String, String>,
    /// Parsed but currently inert: the child always shares the parent's
    /// state.
    #[serde(default = "default_share_state")]
    pub share_state: bool,
}

fn default_share_state() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flow_ref_round_trip() {
        let r: FlowRef = "status_update@3".parse().unwrap();
        assert_eq!(r, FlowRef::new("status_update", 3));
        assert_eq!(r.to_string(), "status_update@3");
    }

    #[test]
    fn flow_ref_rejects_malformed() {
        assert!("main".parse::<FlowRef>().is_err());
        assert!("@1".parse::<FlowRef>().is_err());
        assert!("main@one".parse::<FlowRef>().is_err());
    }

    #[test]
    fn document_deserializes_composites() {
        let doc: FlowDocument = serde_json::from_value(json!({
            "id": "main",
            "version": 1,
            "entry": "root",
            "nodes": [
                {"id": "root", "type": "Sequence", "children": ["gate", "call"]},
                {
                    "id": "gate",
                    "type": "If",
                    "if": {"condition": "len(items) > 0", "then": ["call"], "else": []}
                },
                {
                    "id": "call",
                    "type": "Subflow",
                    "subflow": {"ref": "sub@1", "input_map": {"a": "b"}}
                }
            ]
        }))
        .unwrap();
        assert_eq!(doc.flow_ref().to_string(), "main@1");
        assert_eq!(doc.nodes[0].children.as_deref().unwrap(), ["gate", "call"]);
        let cond = doc.nodes[1].conditional.as_ref().unwrap();
        assert_eq!(cond.condition.as_deref(), Some("len(items) > 0"));
        let sub = doc.nodes[2].subflow.as_ref().unwrap();
        assert!(sub.share_state);
        assert_eq!(sub.input_map.get("a").unwrap(), "b");
    }
}
