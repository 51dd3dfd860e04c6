//! Round orchestration: the control flow tying the executor, the store and
//! the job pipeline together.
//!
//! One send: begin a round (anchoring a snapshot of the session's
//! Last-Stable state), run the main flow, persist the visible reply and its
//! message context, record the gating state-update job, block the round on
//! it, dispatch the job, and write the settled state back into the session
//! record. The transport layer on top of this is out of scope; integration
//! tests and embedders drive [`ChatEngine`] directly.

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::instrument;

use crate::executor::{ExecError, FlowExecutor};
use crate::item::{Item, new_item, str_field};
use crate::jobs::queue::{JobQueue, QueueError};
use crate::jobs::worker::JobProcessor;
use crate::message::{Message, sanitize_messages};
use crate::node::NodeContext;
use crate::resources::{LlmClient, Resources};
use crate::state::{StateManager, StateMap};
use crate::store::records::{BranchRecord, JobKind, JobStatus, RoundStatus, SessionRecord};
use crate::store::{SessionStore, StoreError};

/// Errors surfaced by engine operations.
///
/// Validation and not-found conditions map to client errors; store failures
/// propagate as internal failures.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Queue(#[from] QueueError),

    #[error("session {session_id} has no active branch")]
    #[diagnostic(code(loomflow::engine::missing_branch))]
    MissingBranch { session_id: String },

    #[error("round {round_no} has no anchor snapshot")]
    #[diagnostic(code(loomflow::engine::missing_snapshot))]
    MissingSnapshot { round_no: u64 },
}

/// Parameters of one send.
#[derive(Clone, Debug)]
pub struct SendRequest {
    pub session_id: String,
    /// Branch to play on; defaults to the session's active branch.
    pub branch_id: Option<String>,
    pub user_input: String,
    /// Main flow reference, `id@version`.
    pub flow_ref: String,
    /// Extra fields attached to the seed item.
    pub extras: Option<Item>,
}

impl SendRequest {
    #[must_use]
    pub fn new(session_id: impl Into<String>, user_input: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            branch_id: None,
            user_input: user_input.into(),
            flow_ref: "main@1".to_string(),
            extras: None,
        }
    }
}

/// What one send produced.
#[derive(Clone, Debug)]
pub struct SendOutcome {
    pub round_no: u64,
    pub snapshot_id: String,
    pub reply: String,
    pub items: Vec<Item>,
    pub logs: Vec<String>,
    pub metrics: FxHashMap<String, Value>,
    /// Working state after the flow settled.
    pub state_snapshot: StateMap,
    pub round_status: RoundStatus,
}

/// Parameters of a reroll: regenerate one round's reply from its anchor
/// snapshot.
#[derive(Clone, Debug)]
pub struct RerollRequest {
    pub session_id: String,
    pub branch_id: String,
    pub round_no: u64,
    pub flow_ref: String,
    pub extras: Option<Item>,
}

/// Default starting state for sessions created without one.
#[must_use]
pub fn default_initial_state() -> StateMap {
    let mut state = StateMap::default();
    state.insert("location".to_string(), json!("tavern"));
    state.insert("turn_count".to_string(), json!(0));
    state.insert("protagonist_mood".to_string(), json!("neutral"));
    state
}

/// The orchestration facade over store, executor, queue and job processor.
///
/// All collaborators are constructed once at process start and shared; the
/// engine itself is cheap to clone behind an `Arc`.
pub struct ChatEngine {
    store: Arc<SessionStore>,
    executor: Arc<FlowExecutor>,
    queue: Arc<dyn JobQueue>,
    processor: Arc<JobProcessor>,
    llm: Arc<dyn LlmClient>,
}

impl ChatEngine {
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        executor: Arc<FlowExecutor>,
        queue: Arc<dyn JobQueue>,
        processor: Arc<JobProcessor>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            store,
            executor,
            queue,
            processor,
            llm,
        }
    }

    /// The session store backing this engine.
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Create a session (with its default branch) around an initial state.
    pub async fn start_session(
        &self,
        initial_state: Option<StateMap>,
    ) -> Result<SessionRecord, EngineError> {
        let state = initial_state.unwrap_or_else(default_initial_state);
        Ok(self.store.create_session(state).await?)
    }

    /// Play one round: anchor, execute, persist, schedule the gating job.
    #[instrument(skip(self, request), fields(session = %request.session_id), err)]
    pub async fn send(&self, request: SendRequest) -> Result<SendOutcome, EngineError> {
        let session = self.store.load_session(&request.session_id).await?;
        let branch_id = request
            .branch_id
            .clone()
            .or_else(|| non_empty(&session.active_branch_id))
            .ok_or_else(|| EngineError::MissingBranch {
                session_id: request.session_id.clone(),
            })?;
        let stable_state = session.stable_state.clone();
        let turn_count = session.turn_count;

        // Anchor the round before anything else runs: the snapshot captures
        // the pre-round stable state and conversation range [0, turn_count).
        let (round_no, snapshot_id) = self
            .store
            .begin_round(
                &request.session_id,
                &branch_id,
                &request.user_input,
                stable_state.clone(),
                0,
                turn_count,
            )
            .await?;

        let state = Arc::new(StateManager::new(stable_state));
        let ctx = NodeContext::new(
            request.session_id.clone(),
            Arc::clone(&state),
            Resources::standard(Arc::clone(&self.llm)),
        );

        let mut seed = new_item();
        seed.insert("user_input".to_string(), json!(request.user_input));
        if let Some(extras) = &request.extras {
            for (key, value) in extras {
                seed.insert(key.clone(), value.clone());
            }
        }

        let result = self
            .executor
            .execute_ref(&request.flow_ref, &[seed], &ctx)
            .await?;
        let reply = extract_reply(&result.items);

        self.store
            .save_round_reply(&request.session_id, &branch_id, round_no, &reply)
            .await?;
        let messages = extract_messages(&result.items);
        if let Err(err) = self
            .store
            .save_round_messages(&request.session_id, &branch_id, round_no, messages)
            .await
        {
            tracing::warn!(error = %err, "saving round messages failed");
        }

        // Persist the settled working state before any job runs, so a job's
        // own state merge lands on top of it rather than being clobbered.
        // The flow's counter node owns the turn count, with the round number
        // as fallback.
        let state_snapshot = state.working_state();
        let new_turn_count = state_snapshot
            .get("turn_count")
            .and_then(Value::as_u64)
            .unwrap_or(round_no);
        if let Err(err) = self
            .store
            .update_session_state(&request.session_id, state_snapshot.clone(), new_turn_count)
            .await
        {
            tracing::warn!(error = %err, "updating session state failed");
        }

        let job = self
            .store
            .record_job(
                &request.session_id,
                JobKind::StatusUpdate,
                &branch_id,
                round_no,
                turn_count,
                true,
                json!({"text": reply.clone()}),
                &snapshot_id,
            )
            .await?;
        self.store
            .set_round_blockers(
                &request.session_id,
                &branch_id,
                round_no,
                &["gating".to_string()],
            )
            .await?;
        self.dispatch_gating_job(&request.session_id, &job).await;

        let round_status = self
            .store
            .get_round(&request.session_id, &branch_id, round_no)
            .await
            .map(|round| round.status)
            .unwrap_or(RoundStatus::PendingBlocked);

        Ok(SendOutcome {
            round_no,
            snapshot_id,
            reply,
            items: result.items,
            logs: result.logs,
            metrics: result.metrics,
            state_snapshot,
            round_status,
        })
    }

    /// Dispatch the gating job: inline against the `"null"` queue (so the
    /// round's blockers cannot be left dangling in dev mode), otherwise
    /// enqueued with the outbox marker set. Failures are warned and
    /// swallowed; the outbox poller retries nothing but will pick up jobs
    /// whose dispatch never happened.
    async fn dispatch_gating_job(&self, session_id: &str, job: &crate::store::records::JobRecord) {
        if self.queue.kind() == "null" {
            let outcome = self.processor.process(job).await;
            let status = if outcome.ok {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
            if let Err(err) = self
                .store
                .update_job_status(session_id, &job.id, status, Some(outcome.into_value()))
                .await
            {
                tracing::warn!(job = %job.id, error = %err, "recording inline job outcome failed");
            } else {
                tracing::info!(job = %job.id, "gating job executed inline (null queue)");
            }
        } else {
            match self.queue.enqueue(job).await {
                Ok(tracking_id) => {
                    if let Err(err) = self.store.mark_job_enqueued(session_id, &job.id).await {
                        tracing::warn!(job = %job.id, error = %err, "marking job enqueued failed");
                    } else {
                        tracing::info!(job = %job.id, tracking = %tracking_id, "gating job enqueued");
                    }
                }
                Err(err) => {
                    tracing::warn!(job = %job.id, error = %err, "gating job dispatch failed");
                }
            }
        }
    }

    /// Regenerate a round's reply from its anchor snapshot.
    ///
    /// Runs the flow against the state captured when the round began — not
    /// the session's live state — so the reroll is reproducible. Only the
    /// visible reply is overwritten: no jobs, no blockers, no counter change.
    #[instrument(skip(self, request), fields(session = %request.session_id, round = request.round_no), err)]
    pub async fn reroll(&self, request: RerollRequest) -> Result<SendOutcome, EngineError> {
        let round = self
            .store
            .get_round(&request.session_id, &request.branch_id, request.round_no)
            .await?;
        let snapshot_id = round
            .snapshot_id
            .clone()
            .ok_or(EngineError::MissingSnapshot {
                round_no: request.round_no,
            })?;
        let snapshot = self
            .store
            .get_snapshot(&request.session_id, &snapshot_id)
            .await?;

        let state = Arc::new(StateManager::new(snapshot.stable_state.clone()));
        let ctx = NodeContext::new(
            request.session_id.clone(),
            Arc::clone(&state),
            Resources::standard(Arc::clone(&self.llm)),
        );

        let mut seed = new_item();
        seed.insert("user_input".to_string(), json!(round.user_input));
        if let Some(extras) = &request.extras {
            for (key, value) in extras {
                seed.insert(key.clone(), value.clone());
            }
        }

        let result = self
            .executor
            .execute_ref(&request.flow_ref, &[seed], &ctx)
            .await?;
        let reply = extract_reply(&result.items);
        self.store
            .save_round_reply(&request.session_id, &request.branch_id, request.round_no, &reply)
            .await?;

        let round_after = self
            .store
            .get_round(&request.session_id, &request.branch_id, request.round_no)
            .await?;
        Ok(SendOutcome {
            round_no: round_after.round_no,
            snapshot_id,
            reply,
            items: result.items,
            logs: result.logs,
            metrics: result.metrics,
            state_snapshot: state.working_state(),
            round_status: round_after.status,
        })
    }

    /// Fork a new branch, optionally anchored to a round and made active.
    pub async fn fork_branch(
        &self,
        session_id: &str,
        parent_branch_id: Option<&str>,
        from_round: Option<u64>,
        set_active: bool,
    ) -> Result<BranchRecord, EngineError> {
        let session = self.store.load_session(session_id).await?;
        let parent = parent_branch_id
            .map(str::to_string)
            .or_else(|| non_empty(&session.active_branch_id))
            .ok_or_else(|| EngineError::MissingBranch {
                session_id: session_id.to_string(),
            })?;
        let branch = self
            .store
            .create_branch(session_id, Some(&parent), from_round)
            .await?;
        if set_active {
            self.store.set_active_branch(session_id, &branch.id).await?;
        }
        Ok(branch)
    }

    /// A round's status and outstanding blockers.
    pub async fn round_status(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
    ) -> Result<(RoundStatus, Vec<String>), EngineError> {
        let round = self.store.get_round(session_id, branch_id, round_no).await?;
        Ok((round.status, round.blockers))
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn extract_reply(items: &[Item]) -> String {
    items
        .first()
        .and_then(|item| {
            str_field(item, "llm_response").or_else(|| str_field(item, "narrative"))
        })
        .unwrap_or_default()
        .to_string()
}

fn extract_messages(items: &[Item]) -> Vec<Message> {
    items
        .first()
        .and_then(|item| item.get("messages"))
        .map(sanitize_messages)
        .unwrap_or_default()
}
