//! Pluggable job dispatch targets and the idempotency key.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::store::records::{JobRecord, JobStatus};
use crate::store::SessionStore;

use super::worker::JobProcessor;

/// Errors surfaced by queue operations. Callers log these at WARN and move
/// on; there is no automatic retry.
#[derive(Debug, Error, Diagnostic)]
pub enum QueueError {
    #[error("job dispatch failed: {0}")]
    #[diagnostic(code(loomflow::queue::dispatch))]
    Dispatch(String),

    #[error("queue is shut down")]
    #[diagnostic(code(loomflow::queue::closed))]
    Closed,
}

/// Queue-side view of a tracked job, for API-style inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStatus {
    pub id: String,
    pub status: String,
    pub queue: String,
    pub note: Option<String>,
}

/// A dispatch target for recorded jobs.
///
/// `kind()` is a hint string callers use to pick a dispatch strategy: the
/// `"null"` implementation accepts jobs without executing them, so callers
/// must detect it and fall back to inline synchronous execution (the
/// documented dev-mode behavior).
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Hand a job to the queue; returns a queue-side tracking id.
    async fn enqueue(&self, job: &JobRecord) -> Result<String, QueueError>;

    /// Best-effort cancellation; may be a no-op.
    async fn cancel(&self, tracking_id: &str) -> Result<(), QueueError>;

    /// Queue-side status of a tracked job.
    async fn status(&self, tracking_id: &str) -> Result<QueueStatus, QueueError>;

    /// Implementation hint (`"null"`, `"worker"`).
    fn kind(&self) -> &'static str;
}

/// Deterministic idempotency key for a job.
///
/// SHA-256 over the ordered identity tuple plus a canonical serialization of
/// the payload (serde_json object keys are stored sorted, so `to_string` is
/// already canonical). Identical logical jobs always hash identically; this
/// layer attaches the key for downstream de-duplication but does not itself
/// deduplicate.
#[must_use]
pub fn idempotency_key(job: &JobRecord) -> String {
    let payload = serde_json::to_string(&job.payload).unwrap_or_default();
    let identity = format!(
        "{}|{}|{}|{}|{}|{payload}",
        job.kind, job.session_id, job.branch_id, job.anchor_round, job.base_range_end
    );
    let digest = Sha256::digest(identity.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Dev-mode fallback queue: accepts jobs without executing them.
///
/// Not a delivery mechanism — callers that see `kind() == "null"` are
/// expected to run gating jobs inline instead, and the outbox poller executes
/// anything left pending.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJobQueue;

#[async_trait]
impl JobQueue for NullJobQueue {
    async fn enqueue(&self, job: &JobRecord) -> Result<String, QueueError> {
        tracing::warn!(job = %job.id, kind = %job.kind, "NullJobQueue accepted job (no execution)");
        Ok(job.id.clone())
    }

    async fn cancel(&self, tracking_id: &str) -> Result<(), QueueError> {
        tracing::info!(id = tracking_id, "NullJobQueue: cancel ignored");
        Ok(())
    }

    async fn status(&self, tracking_id: &str) -> Result<QueueStatus, QueueError> {
        Ok(QueueStatus {
            id: tracking_id.to_string(),
            status: "pending".to_string(),
            queue: "null".to_string(),
            note: Some("no worker configured".to_string()),
        })
    }

    fn kind(&self) -> &'static str {
        "null"
    }
}

struct JobEnvelope {
    job: JobRecord,
    idempotency_key: String,
}

/// Production-shaped queue: delegates jobs to a dedicated worker task over a
/// channel.
///
/// The worker task resolves the processing entry point it was configured
/// with ([`JobProcessor`]), executes each job, and records the terminal
/// status back into the store. The idempotency key rides along as envelope
/// metadata.
pub struct WorkerJobQueue {
    tx: flume::Sender<JobEnvelope>,
}

impl WorkerJobQueue {
    /// Start the worker task and return the queue handle.
    #[must_use]
    pub fn start(store: Arc<SessionStore>, processor: Arc<JobProcessor>) -> Self {
        let (tx, rx) = flume::unbounded::<JobEnvelope>();
        tokio::spawn(async move {
            while let Ok(envelope) = rx.recv_async().await {
                let job = envelope.job;
                tracing::info!(
                    job = %job.id,
                    kind = %job.kind,
                    idempotency_key = %envelope.idempotency_key,
                    "worker picked up job"
                );
                let outcome = processor.process(&job).await;
                let status = if outcome.ok {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                if let Err(err) = store
                    .update_job_status(&job.session_id, &job.id, status, Some(outcome.into_value()))
                    .await
                {
                    tracing::warn!(job = %job.id, error = %err, "failed to record job outcome");
                }
            }
            tracing::debug!("worker queue channel closed");
        });
        Self { tx }
    }
}

#[async_trait]
impl JobQueue for WorkerJobQueue {
    async fn enqueue(&self, job: &JobRecord) -> Result<String, QueueError> {
        let envelope = JobEnvelope {
            job: job.clone(),
            idempotency_key: idempotency_key(job),
        };
        self.tx
            .send(envelope)
            .map_err(|_| QueueError::Closed)?;
        Ok(job.id.clone())
    }

    async fn cancel(&self, tracking_id: &str) -> Result<(), QueueError> {
        // Jobs already in the channel cannot be plucked back out.
        tracing::info!(id = tracking_id, "WorkerJobQueue: cancel is best-effort no-op");
        Ok(())
    }

    async fn status(&self, tracking_id: &str) -> Result<QueueStatus, QueueError> {
        Ok(QueueStatus {
            id: tracking_id.to_string(),
            status: "accepted".to_string(),
            queue: "worker".to_string(),
            note: None,
        })
    }

    fn kind(&self) -> &'static str {
        "worker"
    }
}
