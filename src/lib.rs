//! # Loomflow: declarative workflow execution with reliable async jobs
//!
//! Loomflow interprets a versioned, declarative representation of a process
//! graph, dispatches atomic and composite steps, maintains a dual-view
//! mutable state with asynchronous-update consistency guarantees, and drives
//! an outbox-backed job pipeline that lets some state mutations complete
//! asynchronously without blocking the caller.
//!
//! ## Core concepts
//!
//! - **Flow documents**: declarative node graphs identified by `id@version`
//!   ([`ir`]), interpreted recursively by the [`executor`].
//! - **Nodes**: atomic steps consuming and producing batches of items
//!   ([`node`], [`nodes`]), resolved through an explicit [`registry`].
//! - **Dual-view state**: a Working and a Last-Stable copy of process state
//!   with a pending-key fallback for prompt-facing reads ([`state`]).
//! - **Sessions, branches, rounds, snapshots**: durable, file-backed
//!   entities with atomic writes and a round-blocking lifecycle ([`store`]).
//! - **Jobs**: recorded durably first, dispatched at-least-once with
//!   idempotency keys, driven by a background outbox poller ([`jobs`]).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use loomflow::engine::{ChatEngine, SendRequest};
//! use loomflow::executor::FlowExecutor;
//! use loomflow::ir::IrLoader;
//! use loomflow::jobs::{JobProcessor, NullJobQueue};
//! use loomflow::nodes::register_builtin;
//! use loomflow::registry::NodeRegistry;
//! use loomflow::resources::MockLlm;
//! use loomflow::store::SessionStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = NodeRegistry::new();
//! register_builtin(&mut registry)?;
//! let loader = Arc::new(IrLoader::new());
//! loader.load_dirs(&["config/workflows"]);
//!
//! let store = Arc::new(SessionStore::open("storage/sessions").await?);
//! let executor = Arc::new(FlowExecutor::new(Arc::new(registry), loader));
//! let llm = Arc::new(MockLlm);
//! let processor = Arc::new(JobProcessor::new(
//!     Arc::clone(&store),
//!     Arc::clone(&executor),
//!     llm.clone(),
//! ));
//! let engine = ChatEngine::new(
//!     store,
//!     executor,
//!     Arc::new(NullJobQueue),
//!     processor,
//!     llm,
//! );
//!
//! let session = engine.start_session(None).await?;
//! let outcome = engine
//!     .send(SendRequest::new(session.id.clone(), "hello"))
//!     .await?;
//! println!("round {} replied: {}", outcome.round_no, outcome.reply);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module guide
//!
//! - [`ir`] — flow document model, loading and validation
//! - [`executor`] — composition semantics and atomic dispatch
//! - [`node`] / [`nodes`] / [`registry`] — the node contract and built-ins
//! - [`condition`] — restricted expression evaluation for branching
//! - [`state`] — Working/Last-Stable dual state
//! - [`store`] — file-backed persistence and the round lifecycle
//! - [`jobs`] — queue abstraction, job worker, outbox poller
//! - [`engine`] — round orchestration facade
//! - [`resources`] / [`message`] — node capabilities and chat messages
//! - [`config`] / [`telemetry`] — wiring helpers

pub mod condition;
pub mod config;
pub mod engine;
pub mod executor;
pub mod ir;
pub mod item;
pub mod jobs;
pub mod message;
pub mod node;
pub mod nodes;
pub mod registry;
pub mod resources;
pub mod state;
pub mod store;
pub mod telemetry;
