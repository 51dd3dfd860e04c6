//! Loading, validation and indexing of flow documents.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;

use super::document::{FlowDocument, FlowRef, NodeSpec};

/// Errors raised by the loader and by document validation.
///
/// `FlowNotFound` is deliberately distinct from validation failures and from
/// the registry's unknown-node-type error: callers map each to a different
/// client-facing failure.
#[derive(Debug, Error, Diagnostic)]
pub enum IrError {
    /// The document violates a structural rule.
    #[error("flow validation failed: {message}")]
    #[diagnostic(code(loomflow::ir::validation))]
    Validation { message: String },

    /// No document is registered under the requested reference.
    #[error("flow not found: {flow_ref}")]
    #[diagnostic(
        code(loomflow::ir::flow_not_found),
        help("Register the flow or check the id@version reference.")
    )]
    FlowNotFound { flow_ref: String },

    /// A document file could not be read.
    #[error("failed to read flow file {path}: {source}")]
    #[diagnostic(code(loomflow::ir::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A document file is not valid JSON for the document model.
    #[error("failed to parse flow file: {source}")]
    #[diagnostic(code(loomflow::ir::json))]
    Json {
        #[source]
        source: serde_json::Error,
    },
}

impl IrError {
    fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

type NodeMap = FxHashMap<String, NodeSpec>;

/// Loads flow documents from disk, validates them, and indexes them by
/// `id@version`.
///
/// A node-id → spec map is cached per document so executions do not rebuild
/// it. The loader is constructed once at startup and shared behind an `Arc`;
/// `register` takes `&self` so ad hoc documents can be added at runtime.
#[derive(Default)]
pub struct IrLoader {
    flows: RwLock<FxHashMap<String, Arc<FlowDocument>>>,
    node_maps: RwLock<FxHashMap<String, Arc<NodeMap>>>,
}

impl IrLoader {
    /// Create an empty loader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.json` document under the given directories.
    ///
    /// One invalid file does not abort the rest: it is logged at WARN and
    /// skipped. Missing directories are skipped silently (with an INFO log).
    /// Returns the number of documents registered.
    pub fn load_dirs<P: AsRef<Path>>(&self, dirs: &[P]) -> usize {
        let mut count = 0;
        for dir in dirs {
            let dir = dir.as_ref();
            if !dir.exists() {
                tracing::info!(dir = %dir.display(), "skipping non-existent flow dir");
                continue;
            }
            count += self.load_tree(dir);
        }
        tracing::info!(count, "flow documents loaded");
        count
    }

    fn load_tree(&self, dir: &Path) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %err, "failed to read flow dir");
                return 0;
            }
        };
        let mut count = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                count += self.load_tree(&path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                match self.load_file(&path) {
                    Ok(flow_ref) => {
                        tracing::info!(path = %path.display(), flow = %flow_ref, "loaded flow");
                        count += 1;
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "skipping invalid flow file");
                    }
                }
            }
        }
        count
    }

    /// Load and register a single document file; returns its reference.
    pub fn load_file(&self, path: &Path) -> Result<String, IrError> {
        let text = std::fs::read_to_string(path).map_err(|source| IrError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: FlowDocument =
            serde_json::from_str(&text).map_err(|source| IrError::Json { source })?;
        self.register(doc)
    }

    /// Validate and register an in-memory document; returns its reference.
    ///
    /// This is the same validation path file loading goes through, used for
    /// direct/ad hoc execution.
    pub fn register(&self, doc: FlowDocument) -> Result<String, IrError> {
        Self::validate(&doc)?;
        let flow_ref = doc.flow_ref().to_string();
        let node_map = Self::build_node_map(&doc)?;
        self.flows
            .write()
            .insert(flow_ref.clone(), Arc::new(doc));
        self.node_maps
            .write()
            .insert(flow_ref.clone(), Arc::new(node_map));
        tracing::debug!(flow = %flow_ref, "registered flow");
        Ok(flow_ref)
    }

    /// Fetch a registered document by `id@version`.
    pub fn get(&self, flow_ref: &str) -> Result<Arc<FlowDocument>, IrError> {
        self.flows
            .read()
            .get(flow_ref)
            .cloned()
            .ok_or_else(|| IrError::FlowNotFound {
                flow_ref: flow_ref.to_string(),
            })
    }

    /// Fetch the cached node-id → spec map for a registered document.
    pub fn node_map(&self, flow_ref: &str) -> Result<Arc<NodeMap>, IrError> {
        if let Some(map) = self.node_maps.read().get(flow_ref) {
            return Ok(Arc::clone(map));
        }
        Err(IrError::FlowNotFound {
            flow_ref: flow_ref.to_string(),
        })
    }

    /// All registered references, sorted.
    #[must_use]
    pub fn list_flows(&self) -> Vec<String> {
        let mut refs: Vec<String> = self.flows.read().keys().cloned().collect();
        refs.sort();
        refs
    }

    /// Structural validation of a document.
    ///
    /// Rules: non-empty id, non-empty entry resolving to a node, unique
    /// non-empty node ids, non-empty node types, `If` nodes carry a non-blank
    /// condition, `Subflow` nodes carry an `id@version` ref. Child-id
    /// resolution inside composites is checked at execution time.
    pub fn validate(doc: &FlowDocument) -> Result<(), IrError> {
        if doc.id.is_empty() {
            return Err(IrError::validation("flow document requires a non-empty 'id'"));
        }
        if doc.entry.is_empty() {
            return Err(IrError::validation("flow document missing 'entry'"));
        }
        let mut seen: FxHashMap<&str, ()> = FxHashMap::default();
        for spec in &doc.nodes {
            if spec.id.is_empty() {
                return Err(IrError::validation("flow node missing 'id'"));
            }
            if spec.node_type.trim().is_empty() {
                return Err(IrError::validation(format!(
                    "node '{}' missing 'type'",
                    spec.id
                )));
            }
            if seen.insert(spec.id.as_str(), ()).is_some() {
                return Err(IrError::validation(format!("duplicate node id: {}", spec.id)));
            }
            if spec.node_type == "If" {
                let condition = spec
                    .conditional
                    .as_ref()
                    .and_then(|c| c.condition.as_deref())
                    .unwrap_or_default();
                if condition.trim().is_empty() {
                    return Err(IrError::validation(format!(
                        "If node '{}' requires a string condition",
                        spec.id
                    )));
                }
            }
            if spec.node_type == "Subflow" {
                let raw = spec
                    .subflow
                    .as_ref()
                    .map(|s| s.flow_ref.as_str())
                    .unwrap_or_default();
                raw.parse::<FlowRef>().map_err(|_| {
                    IrError::validation(format!(
                        "Subflow node '{}' ref must be 'id@version', got '{raw}'",
                        spec.id
                    ))
                })?;
            }
        }
        if !seen.contains_key(doc.entry.as_str()) {
            return Err(IrError::validation(format!(
                "entry '{}' does not resolve to a node",
                doc.entry
            )));
        }
        Ok(())
    }

    fn build_node_map(doc: &FlowDocument) -> Result<NodeMap, IrError> {
        let mut map = NodeMap::default();
        for spec in &doc.nodes {
            if map.insert(spec.id.clone(), spec.clone()).is_some() {
                return Err(IrError::validation(format!("duplicate node id: {}", spec.id)));
            }
        }
        Ok(map)
    }
}
