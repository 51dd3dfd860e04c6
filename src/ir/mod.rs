//! Intermediate representation of workflow documents.
//!
//! A flow document is the declarative description of a process graph: an
//! entry node id plus an ordered collection of node specs, identified by
//! `id@version`. [`document`] holds the typed model; [`loader`] loads,
//! validates and indexes documents from disk or memory.

pub mod document;
pub mod loader;

pub use document::{ConditionalSpec, FlowDocument, FlowRef, NodeSpec, SubflowSpec};
pub use loader::{IrError, IrLoader};
