//! The job-processing entry point.
//!
//! Invoked either inline (dev mode / gating fallback) or by the worker queue
//! task. Errors are caught at this boundary: the caller records the outcome
//! as `completed` or `failed`, and a failed gating job deliberately leaves
//! its round `pending_blocked` — there is no retry policy.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::executor::FlowExecutor;
use crate::item::{Item, new_item};
use crate::message::Message;
use crate::node::NodeContext;
use crate::resources::{LlmClient, Resources};
use crate::state::{StateManager, StateMap};
use crate::store::SessionStore;
use crate::store::records::{JobKind, JobRecord};

/// Outcome of processing one job: `{ok, result | error}`.
#[derive(Clone, Debug)]
pub struct JobOutcome {
    pub ok: bool,
    pub kind: JobKind,
    pub body: Value,
}

impl JobOutcome {
    fn success(kind: JobKind, result: Value) -> Self {
        Self {
            ok: true,
            kind,
            body: result,
        }
    }

    fn failure(kind: JobKind, error: String) -> Self {
        Self {
            ok: false,
            kind,
            body: Value::String(error),
        }
    }

    /// The persisted result shape for the job record.
    #[must_use]
    pub fn into_value(self) -> Value {
        if self.ok {
            json!({"ok": true, "type": self.kind.to_string(), "result": self.body})
        } else {
            json!({"ok": false, "type": self.kind.to_string(), "error": self.body})
        }
    }
}

/// Executes recorded jobs against the store, the flow executor, and the
/// language model.
///
/// Constructed once at startup with its collaborators and shared behind an
/// `Arc` by the engine, the worker queue, and the outbox poller.
pub struct JobProcessor {
    store: Arc<SessionStore>,
    executor: Arc<FlowExecutor>,
    llm: Arc<dyn LlmClient>,
}

impl JobProcessor {
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        executor: Arc<FlowExecutor>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            store,
            executor,
            llm,
        }
    }

    /// Process one job. Never panics or errors out: failures are folded into
    /// the returned outcome.
    pub async fn process(&self, job: &JobRecord) -> JobOutcome {
        let outcome = match job.kind {
            JobKind::StatusUpdate => self.status_update(job).await,
            JobKind::Guidance | JobKind::Summarize => self.guidance(job).await,
        };
        match &outcome {
            JobOutcome { ok: true, .. } => {
                tracing::info!(
                    job = %job.id,
                    kind = %job.kind,
                    session = %job.session_id,
                    round = job.anchor_round,
                    "job done"
                );
            }
            JobOutcome { body, .. } => {
                tracing::error!(job = %job.id, kind = %job.kind, error = %body, "job failed");
            }
        }
        outcome
    }

    /// Gating state update: run the `status_update@1` subflow against the
    /// round's narrative text, merge the produced mood into the session's
    /// Last-Stable state, then release the round's gating blocker and
    /// complete it.
    async fn status_update(&self, job: &JobRecord) -> JobOutcome {
        let kind = job.kind;
        let text = payload_text(&job.payload);

        let session = match self.store.load_session(&job.session_id).await {
            Ok(session) => session,
            Err(err) => return JobOutcome::failure(kind, err.to_string()),
        };
        let ctx = self.job_context(&job.session_id, session.stable_state.clone());

        let mut item = new_item();
        item.insert("text".to_string(), json!(text.clone()));
        let mood = match self
            .executor
            .execute_ref("status_update@1", &[item], &ctx)
            .await
        {
            Ok(result) => first_str(&result.items, "protagonist_mood"),
            Err(err) => {
                tracing::warn!(error = %err, "status_update subflow failed; falling back to direct call");
                None
            }
        };
        let mood = match mood {
            Some(mood) => mood,
            None => match self
                .llm
                .call_model(&[Message::user(&text)], "analyzer-llm")
                .await
            {
                Ok(mood) => mood,
                Err(err) => return JobOutcome::failure(kind, err.to_string()),
            },
        };

        let mut updates = StateMap::default();
        updates.insert("protagonist_mood".to_string(), json!(mood.clone()));
        if let Err(err) = self
            .store
            .merge_session_state(&job.session_id, updates)
            .await
        {
            return JobOutcome::failure(kind, err.to_string());
        }

        // Release the blocker and settle the round. Failure here is logged,
        // not fatal: the state update itself already landed.
        let gating = vec!["gating".to_string()];
        if let Err(err) = self
            .store
            .resolve_round_blockers(&job.session_id, &job.branch_id, job.anchor_round, &gating)
            .await
        {
            tracing::warn!(error = %err, "failed to resolve round blockers");
        } else if let Err(err) = self
            .store
            .complete_round(&job.session_id, &job.branch_id, job.anchor_round)
            .await
        {
            tracing::warn!(error = %err, "failed to complete round");
        }

        JobOutcome::success(
            kind,
            json!({
                "updated": {"protagonist_mood": mood},
                "anchor_round": job.anchor_round,
                "snapshot_id": job.snapshot_id,
            }),
        )
    }

    /// Non-gating direction/summary: run the `guidance@1` subflow and return
    /// the produced text. Subflow failure degrades to a placeholder result
    /// rather than failing the job.
    async fn guidance(&self, job: &JobRecord) -> JobOutcome {
        let kind = job.kind;
        let text = payload_text(&job.payload);

        let session = match self.store.load_session(&job.session_id).await {
            Ok(session) => session,
            Err(err) => return JobOutcome::failure(kind, err.to_string()),
        };
        let ctx = self.job_context(&job.session_id, session.stable_state.clone());

        let mut item = new_item();
        item.insert("narrative".to_string(), json!(text.clone()));
        item.insert("text".to_string(), json!(text));
        match self.executor.execute_ref("guidance@1", &[item], &ctx).await {
            Ok(result) => {
                let guidance = first_str(&result.items, "guidance")
                    .or_else(|| first_str(&result.items, "guidance_text"))
                    .unwrap_or_default();
                JobOutcome::success(kind, json!({"guidance": guidance}))
            }
            Err(err) => {
                tracing::info!(kind = %kind, error = %err, "guidance subflow unavailable; placeholder result");
                JobOutcome::success(kind, json!({"placeholder": true}))
            }
        }
    }

    fn job_context(&self, session_id: &str, stable_state: StateMap) -> NodeContext {
        NodeContext::new(
            session_id,
            Arc::new(StateManager::new(stable_state)),
            Resources::standard(Arc::clone(&self.llm)),
        )
    }
}

fn payload_text(payload: &Value) -> String {
    payload
        .get("text")
        .and_then(Value::as_str)
        .or_else(|| payload.get("narrative").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

fn first_str(items: &[Item], key: &str) -> Option<String> {
    items
        .first()
        .and_then(|item| item.get(key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
