//! Node type registry.
//!
//! Maps a type-name string to a node factory. Registration is explicit and
//! happens once at startup: [`crate::nodes::register_builtin`] walks the
//! known implementation list and registers each under its declared type name.
//! There is no runtime discovery or module scanning.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::node::{Node, NodeFactory};

/// Errors produced by registry operations.
#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    /// Registration attempted over an existing name without the override flag.
    #[error("node type '{type_name}' already registered")]
    #[diagnostic(
        code(loomflow::registry::already_registered),
        help("Pass override=true to replace an existing registration.")
    )]
    AlreadyRegistered { type_name: String },

    /// Lookup of a name nobody registered. Lists the known types to aid
    /// debugging; the executor surfaces this as a per-invocation failure, not
    /// a crash.
    #[error("unknown node type '{type_name}'. Known: {known}")]
    #[diagnostic(
        code(loomflow::registry::unknown_type),
        help("Register the node type before executing flows that reference it.")
    )]
    UnknownType { type_name: String, known: String },
}

/// Registry of node type names to factories.
///
/// Constructed once at process start and read-only thereafter; the executor
/// holds it behind an `Arc`.
#[derive(Default)]
pub struct NodeRegistry {
    factories: FxHashMap<String, NodeFactory>,
}

impl NodeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `type_name`.
    ///
    /// Re-registering the same name fails unless `override_existing` is set.
    pub fn register(
        &mut self,
        type_name: &str,
        factory: NodeFactory,
        override_existing: bool,
    ) -> Result<(), RegistryError> {
        if !override_existing && self.factories.contains_key(type_name) {
            return Err(RegistryError::AlreadyRegistered {
                type_name: type_name.to_string(),
            });
        }
        tracing::debug!(type_name, "registered node type");
        self.factories.insert(type_name.to_string(), factory);
        Ok(())
    }

    /// Instantiate a node of the given type with an IR parameter bag.
    pub fn build(&self, type_name: &str, params: Value) -> Result<Arc<dyn Node>, RegistryError> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| RegistryError::UnknownType {
                type_name: type_name.to_string(),
                known: self.known_types().join(", "),
            })?;
        Ok(factory(params))
    }

    /// All registered type names, sorted.
    #[must_use]
    pub fn known_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a type name is registered.
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeContext, NodeError, NodeResult};
    use crate::item::Item;
    use async_trait::async_trait;

    struct NoopNode;

    #[async_trait]
    impl Node for NoopNode {
        fn type_name(&self) -> &str {
            "Noop"
        }

        async fn run(&self, items: &[Item], _ctx: &NodeContext) -> Result<NodeResult, NodeError> {
            Ok(NodeResult::with_items(items.to_vec()))
        }
    }

    fn noop_factory() -> NodeFactory {
        Arc::new(|_params| Arc::new(NoopNode))
    }

    #[test]
    fn register_and_build() {
        let mut registry = NodeRegistry::new();
        registry.register("Noop", noop_factory(), false).unwrap();
        let node = registry.build("Noop", Value::Null).unwrap();
        assert_eq!(node.type_name(), "Noop");
    }

    #[test]
    fn duplicate_registration_requires_override() {
        let mut registry = NodeRegistry::new();
        registry.register("Noop", noop_factory(), false).unwrap();
        let err = registry.register("Noop", noop_factory(), false).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
        registry.register("Noop", noop_factory(), true).unwrap();
    }

    #[test]
    fn unknown_type_lists_known() {
        let mut registry = NodeRegistry::new();
        registry.register("Noop", noop_factory(), false).unwrap();
        let err = registry.build("Nope", Value::Null).err().unwrap();
        let msg = err.to_string();
        assert!(msg.contains("Nope"));
        assert!(msg.contains("Noop"));
    }
}
