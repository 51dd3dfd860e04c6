//! Persisted record shapes for the session store.
//!
//! Explicit serde-friendly structs decoupled from in-memory types; the store
//! code stays lean and declarative. Creation times are RFC3339 strings to
//! keep `chrono::DateTime` out of the serialized shape. This module does no
//! I/O.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;
use crate::state::StateMap;

/// RFC3339 timestamp for record creation fields.
#[must_use]
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// One session: identity, turn counter, active branch, and the persisted
/// Last-Stable state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub created_at: String,
    /// Monotonically increasing turn counter, advanced after each round.
    pub turn_count: u64,
    pub active_branch_id: String,
    /// Last-Stable state as of the most recent settled write.
    #[serde(default)]
    pub stable_state: StateMap,
}

/// One branch in the session's branch tree.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BranchRecord {
    pub id: String,
    pub session_id: String,
    pub created_at: String,
    /// Parent branch, absent for the session's default branch.
    #[serde(default)]
    pub parent_branch_id: Option<String>,
    /// Round the fork anchors to, when forked explicitly.
    #[serde(default)]
    pub fork_from_round: Option<u64>,
}

/// Round lifecycle: `open → pending_blocked → completed`, `completed` being
/// terminal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Open,
    PendingBlocked,
    Completed,
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::PendingBlocked => write!(f, "pending_blocked"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// One round of interaction on a branch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RoundRecord {
    /// `{branch_id}:{round_no}`.
    pub id: String,
    pub session_id: String,
    pub branch_id: String,
    pub round_no: u64,
    pub user_input: String,
    /// The externally visible reply; present once generation finishes.
    #[serde(default)]
    pub reply: Option<String>,
    /// Full message context used to produce the reply.
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: String,
    pub status: RoundStatus,
    /// Named blockers outstanding on this round.
    #[serde(default)]
    pub blockers: Vec<String>,
    /// Anchor snapshot, attached right after round creation.
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

/// Immutable capture of state and conversation range at round start.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRecord {
    pub id: String,
    pub session_id: String,
    pub branch_id: String,
    pub anchor_round: u64,
    pub created_at: String,
    #[serde(default)]
    pub stable_state: StateMap,
    pub range_start: u64,
    pub range_end: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Closed set of job types.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobKind {
    /// Update state from the round's narrative output (gating).
    StatusUpdate,
    /// Produce behind-the-scenes direction for the next beat (non-gating).
    Guidance,
    /// Summarize a conversation span (non-gating).
    Summarize,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StatusUpdate => write!(f, "StatusUpdate"),
            Self::Guidance => write!(f, "Guidance"),
            Self::Summarize => write!(f, "Summarize"),
        }
    }
}

/// Job status: `pending → enqueued → completed | failed`.
///
/// The outbox marker [`JobRecord::enqueued`] is distinct from this status:
/// the marker records that dispatch happened; the status tracks the job's
/// life on the processing side.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Enqueued,
    Completed,
    Failed,
}

/// One recorded job, the durable intent-to-dispatch of the outbox pattern.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: String,
    pub session_id: String,
    pub branch_id: String,
    pub anchor_round: u64,
    pub snapshot_id: String,
    #[serde(rename = "type")]
    pub kind: JobKind,
    /// End of the conversation range this job's inputs depend on.
    pub base_range_end: u64,
    /// Whether the anchor round is blocked on this job.
    pub gating: bool,
    pub status: JobStatus,
    /// Outbox marker: set once the job has been handed to a queue.
    pub enqueued: bool,
    pub created_at: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub result: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_status_wire_form_is_snake_case() {
        assert_eq!(
            serde_json::to_value(RoundStatus::PendingBlocked).unwrap(),
            json!("pending_blocked")
        );
    }

    #[test]
    fn job_kind_wire_form_is_pascal_case() {
        assert_eq!(
            serde_json::to_value(JobKind::StatusUpdate).unwrap(),
            json!("StatusUpdate")
        );
    }

    #[test]
    fn job_record_round_trips() {
        let job = JobRecord {
            id: "job_1".into(),
            session_id: "sess_1".into(),
            branch_id: "br_1".into(),
            anchor_round: 1,
            snapshot_id: "snap_1".into(),
            kind: JobKind::Guidance,
            base_range_end: 0,
            gating: false,
            status: JobStatus::Pending,
            enqueued: false,
            created_at: now_rfc3339(),
            payload: json!({"text": "t"}),
            result: None,
        };
        let text = serde_json::to_string(&job).unwrap();
        assert!(text.contains("\"type\":\"Guidance\""));
        let parsed: JobRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, job);
    }
}
