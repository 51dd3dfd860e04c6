//! Built-in atomic node implementations.
//!
//! Registration is an explicit startup-time table: [`register_builtin`]
//! iterates the known implementations and registers each under its declared
//! type name. Adding a node type means adding it to this list.

pub mod code;
pub mod llm;
pub mod state;
pub mod transform;

use std::sync::Arc;

use serde_json::Value;

use crate::node::Node;
use crate::registry::{NodeRegistry, RegistryError};

/// Register every built-in node type on the given registry.
///
/// Uses the override flag so repeated calls (e.g., per-test registries) are
/// harmless. Returns the number of types registered.
pub fn register_builtin(registry: &mut NodeRegistry) -> Result<usize, RegistryError> {
    let entries: [(&str, fn(Value) -> Arc<dyn Node>); 9] = [
        ("LlmChat", |params| Arc::new(llm::LlmChatNode::new(params))),
        ("Code", |params| Arc::new(code::CodeNode::new(params))),
        ("ReadState", |params| {
            Arc::new(state::ReadStateNode::new(params))
        }),
        ("WriteState", |params| {
            Arc::new(state::WriteStateNode::new(params))
        }),
        ("IncrementCounter", |params| {
            Arc::new(state::IncrementCounterNode::new(params))
        }),
        ("Map", |params| Arc::new(transform::MapNode::new(params))),
        ("Filter", |params| {
            Arc::new(transform::FilterNode::new(params))
        }),
        ("Merge", |params| Arc::new(transform::MergeNode::new(params))),
        ("Split", |params| Arc::new(transform::SplitNode::new(params))),
    ];
    for (name, build) in entries {
        registry.register(name, Arc::new(build), true)?;
    }
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_registers_all_types() {
        let mut registry = NodeRegistry::new();
        let count = register_builtin(&mut registry).unwrap();
        assert_eq!(count, 9);
        for name in [
            "LlmChat",
            "Code",
            "ReadState",
            "WriteState",
            "IncrementCounter",
            "Map",
            "Filter",
            "Merge",
            "Split",
        ] {
            assert!(registry.contains(name), "missing {name}");
        }
        // Idempotent thanks to the override flag.
        register_builtin(&mut registry).unwrap();
    }
}
