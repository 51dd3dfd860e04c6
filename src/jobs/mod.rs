//! Job dispatch: queue abstraction, processing entry point, outbox poller.
//!
//! Delivery model: at-least-once dispatch with idempotency keys for
//! downstream de-duplication, not cross-process transactional guarantees.
//! Jobs are recorded durably first (outbox), then dispatched; a background
//! poll pass picks up anything whose initial dispatch was skipped or failed.

pub mod outbox;
pub mod queue;
pub mod worker;

pub use outbox::{OutboxHandle, OutboxPoller};
pub use queue::{JobQueue, NullJobQueue, QueueError, QueueStatus, WorkerJobQueue, idempotency_key};
pub use worker::{JobOutcome, JobProcessor};
