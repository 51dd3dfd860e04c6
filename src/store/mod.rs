//! Durable, file-backed persistence of sessions, branches, rounds, snapshots
//! and jobs.
//!
//! Layout, one session per top-level directory under the base:
//!
//! ```text
//! {base}/{session_id}/session.json
//! {base}/{session_id}/branches/{branch_id}/branch.json
//! {base}/{session_id}/branches/{branch_id}/rounds/{round_no}.json
//! {base}/{session_id}/snapshots/{snapshot_id}.json
//! {base}/{session_id}/jobs/{job_id}.json
//! ```
//!
//! Consistency discipline: every write serializes to a `.tmp` sibling and
//! renames over the target, under an in-process lock keyed by the target
//! path. Cross-process concurrency is explicitly not guarded — this store is
//! safe for single-process deployment only; anything beyond that needs an
//! external lock service or a single-writer constraint.

pub mod records;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::message::Message;
use crate::state::StateMap;
use records::{
    BranchRecord, JobKind, JobRecord, JobStatus, RoundRecord, RoundStatus, SessionRecord,
    SnapshotRecord, now_rfc3339,
};

/// Errors from the persistence layer. These propagate to the caller; there
/// is no implicit recovery.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// The addressed record does not exist.
    #[error("record not found: {path}")]
    #[diagnostic(code(loomflow::store::not_found))]
    NotFound { path: PathBuf },

    /// Filesystem failure while reading or writing a record.
    #[error("store I/O failure at {path}: {source}")]
    #[diagnostic(code(loomflow::store::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record on disk (or being written) is not valid for its shape.
    #[error("record serialization failed: {source}")]
    #[diagnostic(code(loomflow::store::serde))]
    Serde {
        #[source]
        source: serde_json::Error,
    },
}

/// File-backed session store with atomic writes and in-process path locks.
pub struct SessionStore {
    base_dir: PathBuf,
    locks: Mutex<FxHashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionStore {
    /// Open (creating if needed) a store rooted at `base_dir`.
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: base_dir.clone(),
                source,
            })?;
        Ok(Self {
            base_dir,
            locks: Mutex::new(FxHashMap::default()),
        })
    }

    /// The store's root directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    // ---------- sessions ----------

    /// Create a session with its default branch; returns the session record.
    pub async fn create_session(&self, initial_state: StateMap) -> Result<SessionRecord, StoreError> {
        let session_id = new_id("sess_");
        let default_branch_id = new_id("br_");
        let record = SessionRecord {
            id: session_id.clone(),
            created_at: now_rfc3339(),
            turn_count: 0,
            active_branch_id: default_branch_id.clone(),
            stable_state: initial_state,
        };
        self.write_record(&self.session_path(&session_id), &record)
            .await?;
        self.ensure_branch(&session_id, &default_branch_id, None, None)
            .await?;
        tracing::info!(session = %session_id, branch = %default_branch_id, "session created");
        Ok(record)
    }

    /// Read a session record.
    pub async fn load_session(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        self.read_record(&self.session_path(session_id)).await
    }

    /// Persist the session's Last-Stable state and turn counter after a
    /// synchronous write settles.
    pub async fn update_session_state(
        &self,
        session_id: &str,
        stable_state: StateMap,
        turn_count: u64,
    ) -> Result<(), StoreError> {
        let path = self.session_path(session_id);
        let mut record: SessionRecord = self.read_record(&path).await?;
        record.stable_state = stable_state;
        record.turn_count = turn_count;
        self.write_record(&path, &record).await
    }

    /// Merge updates into the session's Last-Stable state, leaving the turn
    /// counter alone. Used by the job worker when an asynchronous update
    /// commits.
    pub async fn merge_session_state(
        &self,
        session_id: &str,
        updates: StateMap,
    ) -> Result<(), StoreError> {
        let path = self.session_path(session_id);
        let mut record: SessionRecord = self.read_record(&path).await?;
        for (key, value) in updates {
            record.stable_state.insert(key, value);
        }
        self.write_record(&path, &record).await
    }

    /// All session ids currently on disk, sorted. Drives the outbox poller.
    pub async fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.base_dir.clone(),
                source,
            })?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir()
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
            {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    // ---------- branches ----------

    /// Create a new branch, optionally recording its fork origin.
    pub async fn create_branch(
        &self,
        session_id: &str,
        parent_branch_id: Option<&str>,
        fork_from_round: Option<u64>,
    ) -> Result<BranchRecord, StoreError> {
        let branch_id = new_id("br_");
        self.ensure_branch(session_id, &branch_id, parent_branch_id, fork_from_round)
            .await
    }

    /// Read a branch record.
    pub async fn get_branch(
        &self,
        session_id: &str,
        branch_id: &str,
    ) -> Result<BranchRecord, StoreError> {
        self.read_record(&self.branch_dir(session_id, branch_id).join("branch.json"))
            .await
    }

    /// Point the session's active-branch pointer at `branch_id`.
    pub async fn set_active_branch(
        &self,
        session_id: &str,
        branch_id: &str,
    ) -> Result<(), StoreError> {
        let path = self.session_path(session_id);
        let mut record: SessionRecord = self.read_record(&path).await?;
        record.active_branch_id = branch_id.to_string();
        self.write_record(&path, &record).await
    }

    async fn ensure_branch(
        &self,
        session_id: &str,
        branch_id: &str,
        parent_branch_id: Option<&str>,
        fork_from_round: Option<u64>,
    ) -> Result<BranchRecord, StoreError> {
        let record = BranchRecord {
            id: branch_id.to_string(),
            session_id: session_id.to_string(),
            created_at: now_rfc3339(),
            parent_branch_id: parent_branch_id.map(str::to_string),
            fork_from_round,
        };
        self.write_record(
            &self.branch_dir(session_id, branch_id).join("branch.json"),
            &record,
        )
        .await?;
        Ok(record)
    }

    // ---------- rounds & snapshots ----------

    /// Begin a round anchored on the caller's input: computes the next round
    /// number from the session's turn counter, writes an `open` round record,
    /// and creates + attaches its immutable snapshot.
    ///
    /// Does not advance the turn counter itself; the main flow's counter node
    /// owns that.
    pub async fn begin_round(
        &self,
        session_id: &str,
        branch_id: &str,
        user_input: &str,
        stable_state: StateMap,
        range_start: u64,
        range_end: u64,
    ) -> Result<(u64, String), StoreError> {
        let session = self.load_session(session_id).await?;
        let round_no = session.turn_count + 1;

        let round_path = self.round_path(session_id, branch_id, round_no);
        let mut round = RoundRecord {
            id: format!("{branch_id}:{round_no}"),
            session_id: session_id.to_string(),
            branch_id: branch_id.to_string(),
            round_no,
            user_input: user_input.to_string(),
            reply: None,
            messages: Vec::new(),
            created_at: now_rfc3339(),
            status: RoundStatus::Open,
            blockers: Vec::new(),
            snapshot_id: None,
        };
        self.write_record(&round_path, &round).await?;

        let snapshot_id = self
            .create_snapshot(
                session_id,
                branch_id,
                round_no,
                stable_state,
                range_start,
                range_end,
                vec!["anchor".to_string()],
            )
            .await?;
        round.snapshot_id = Some(snapshot_id.clone());
        self.write_record(&round_path, &round).await?;

        Ok((round_no, snapshot_id))
    }

    /// Record the round's externally visible reply.
    pub async fn save_round_reply(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
        reply: &str,
    ) -> Result<(), StoreError> {
        self.update_round(session_id, branch_id, round_no, |round| {
            round.reply = Some(reply.to_string());
        })
        .await
    }

    /// Record the full message context used to produce the reply.
    pub async fn save_round_messages(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
        messages: Vec<Message>,
    ) -> Result<(), StoreError> {
        self.update_round(session_id, branch_id, round_no, |round| {
            round.messages = messages;
        })
        .await
    }

    /// Replace the round's blocker set. Non-empty ⇒ `pending_blocked`,
    /// empty ⇒ `open`; a `completed` round never leaves `completed`.
    pub async fn set_round_blockers(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
        keys: &[String],
    ) -> Result<(), StoreError> {
        let mut uniq: Vec<String> = keys.to_vec();
        uniq.sort();
        uniq.dedup();
        self.update_round(session_id, branch_id, round_no, move |round| {
            round.blockers = uniq;
            if round.status != RoundStatus::Completed {
                round.status = if round.blockers.is_empty() {
                    RoundStatus::Open
                } else {
                    RoundStatus::PendingBlocked
                };
            }
        })
        .await
    }

    /// Remove the named blockers; when none remain the round returns to
    /// `open` (unless already `completed`).
    pub async fn resolve_round_blockers(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
        keys: &[String],
    ) -> Result<(), StoreError> {
        let remove: Vec<String> = keys.to_vec();
        self.update_round(session_id, branch_id, round_no, move |round| {
            round.blockers.retain(|k| !remove.contains(k));
            if round.status != RoundStatus::Completed {
                round.status = if round.blockers.is_empty() {
                    RoundStatus::Open
                } else {
                    RoundStatus::PendingBlocked
                };
            }
        })
        .await
    }

    /// Force the round to `completed`. Terminal: nothing transitions a round
    /// away from `completed` afterwards.
    pub async fn complete_round(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
    ) -> Result<(), StoreError> {
        self.update_round(session_id, branch_id, round_no, |round| {
            round.status = RoundStatus::Completed;
        })
        .await
    }

    /// Read a round record.
    pub async fn get_round(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
    ) -> Result<RoundRecord, StoreError> {
        self.read_record(&self.round_path(session_id, branch_id, round_no))
            .await
    }

    /// The branch's highest-numbered round, if any round exists.
    pub async fn latest_round(
        &self,
        session_id: &str,
        branch_id: &str,
    ) -> Result<Option<RoundRecord>, StoreError> {
        let rounds_dir = self.branch_dir(session_id, branch_id).join("rounds");
        if !rounds_dir.exists() {
            return Ok(None);
        }
        let mut latest: Option<RoundRecord> = None;
        let mut entries = tokio::fs::read_dir(&rounds_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: rounds_dir.clone(),
                source,
            })?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match self.read_record::<RoundRecord>(&path).await {
                Ok(round) => {
                    if latest.as_ref().is_none_or(|r| round.round_no > r.round_no) {
                        latest = Some(round);
                    }
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable round");
                }
            }
        }
        Ok(latest)
    }

    /// Create and persist a snapshot entry; returns its id. Snapshots are
    /// immutable once written.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_snapshot(
        &self,
        session_id: &str,
        branch_id: &str,
        anchor_round: u64,
        stable_state: StateMap,
        range_start: u64,
        range_end: u64,
        tags: Vec<String>,
    ) -> Result<String, StoreError> {
        let snapshot_id = new_id("snap_");
        let record = SnapshotRecord {
            id: snapshot_id.clone(),
            session_id: session_id.to_string(),
            branch_id: branch_id.to_string(),
            anchor_round,
            created_at: now_rfc3339(),
            stable_state,
            range_start,
            range_end,
            tags,
        };
        self.write_record(
            &self
                .session_dir(session_id)
                .join("snapshots")
                .join(format!("{snapshot_id}.json")),
            &record,
        )
        .await?;
        Ok(snapshot_id)
    }

    /// Read a snapshot record.
    pub async fn get_snapshot(
        &self,
        session_id: &str,
        snapshot_id: &str,
    ) -> Result<SnapshotRecord, StoreError> {
        self.read_record(
            &self
                .session_dir(session_id)
                .join("snapshots")
                .join(format!("{snapshot_id}.json")),
        )
        .await
    }

    // ---------- jobs (outbox) ----------

    /// Record a job entry with `enqueued=false`: the durable
    /// intent-to-dispatch the outbox poller guarantees eventually goes out.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_job(
        &self,
        session_id: &str,
        kind: JobKind,
        branch_id: &str,
        anchor_round: u64,
        base_range_end: u64,
        gating: bool,
        payload: Value,
        snapshot_id: &str,
    ) -> Result<JobRecord, StoreError> {
        let job_id = new_id("job_");
        let record = JobRecord {
            id: job_id.clone(),
            session_id: session_id.to_string(),
            branch_id: branch_id.to_string(),
            anchor_round,
            snapshot_id: snapshot_id.to_string(),
            kind,
            base_range_end,
            gating,
            status: JobStatus::Pending,
            enqueued: false,
            created_at: now_rfc3339(),
            payload,
            result: None,
        };
        self.write_record(&self.job_path(session_id, &job_id), &record)
            .await?;
        Ok(record)
    }

    /// Mark a job as handed to a queue: sets the outbox marker and moves the
    /// status to `enqueued`.
    pub async fn mark_job_enqueued(
        &self,
        session_id: &str,
        job_id: &str,
    ) -> Result<(), StoreError> {
        let path = self.job_path(session_id, job_id);
        let mut record: JobRecord = self.read_record(&path).await?;
        record.enqueued = true;
        record.status = JobStatus::Enqueued;
        self.write_record(&path, &record).await
    }

    /// Update a job's status and (optionally) its result.
    pub async fn update_job_status(
        &self,
        session_id: &str,
        job_id: &str,
        status: JobStatus,
        result: Option<Value>,
    ) -> Result<(), StoreError> {
        let path = self.job_path(session_id, job_id);
        let mut record: JobRecord = self.read_record(&path).await?;
        record.status = status;
        if result.is_some() {
            record.result = result;
        }
        self.write_record(&path, &record).await
    }

    /// Read a job record.
    pub async fn get_job(&self, session_id: &str, job_id: &str) -> Result<JobRecord, StoreError> {
        self.read_record(&self.job_path(session_id, job_id)).await
    }

    /// Jobs still awaiting dispatch: `enqueued == false` and status
    /// `pending`, sorted by id for a stable pass order. Unreadable job files
    /// are skipped.
    pub async fn list_pending_jobs(
        &self,
        session_id: &str,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let jobs_dir = self.session_dir(session_id).join("jobs");
        if !jobs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&jobs_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: jobs_dir.clone(),
                source,
            })?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match self.read_record::<JobRecord>(&path).await {
                Ok(job) => {
                    if !job.enqueued && job.status == JobStatus::Pending {
                        out.push(job);
                    }
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable job");
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    // ---------- paths & I/O ----------

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(session_id)
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("session.json")
    }

    fn branch_dir(&self, session_id: &str, branch_id: &str) -> PathBuf {
        self.session_dir(session_id).join("branches").join(branch_id)
    }

    fn round_path(&self, session_id: &str, branch_id: &str, round_no: u64) -> PathBuf {
        self.branch_dir(session_id, branch_id)
            .join("rounds")
            .join(format!("{round_no}.json"))
    }

    fn job_path(&self, session_id: &str, job_id: &str) -> PathBuf {
        self.session_dir(session_id)
            .join("jobs")
            .join(format!("{job_id}.json"))
    }

    async fn update_round<F>(
        &self,
        session_id: &str,
        branch_id: &str,
        round_no: u64,
        mutate: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(&mut RoundRecord),
    {
        let path = self.round_path(session_id, branch_id, round_no);
        let mut record: RoundRecord = self.read_record(&path).await?;
        mutate(&mut record);
        self.write_record(&path, &record).await
    }

    fn path_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Atomic write: serialize compact, write `{path}.tmp`, rename over the
    /// target, all under this path's in-process lock.
    async fn write_record<T: Serialize>(&self, path: &Path, record: &T) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let text = serde_json::to_string(record).map_err(|source| StoreError::Serde { source })?;
        let tmp_path = path.with_extension("json.tmp");
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;
        tokio::fs::write(&tmp_path, text)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn read_record<T: DeserializeOwned>(&self, path: &Path) -> Result<T, StoreError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&text).map_err(|source| StoreError::Serde { source })
    }
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn temp_store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path().join("sessions")).await.unwrap();
        (dir, store)
    }

    fn initial_state() -> StateMap {
        let mut state = StateMap::default();
        state.insert("turn_count".into(), json!(0));
        state
    }

    #[tokio::test]
    async fn session_create_and_load() {
        let (_dir, store) = temp_store().await;
        let session = store.create_session(initial_state()).await.unwrap();
        let loaded = store.load_session(&session.id).await.unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.turn_count, 0);
        let branch = store
            .get_branch(&session.id, &session.active_branch_id)
            .await
            .unwrap();
        assert!(branch.parent_branch_id.is_none());
    }

    #[tokio::test]
    async fn files_are_newline_free() {
        let (_dir, store) = temp_store().await;
        let session = store.create_session(initial_state()).await.unwrap();
        let path = store.session_path(&session.id);
        let text = std::fs::read_to_string(path).unwrap();
        assert!(!text.contains('\n'));
    }

    #[tokio::test]
    async fn round_lifecycle_state_machine() {
        let (_dir, store) = temp_store().await;
        let session = store.create_session(initial_state()).await.unwrap();
        let branch = session.active_branch_id.clone();
        let (round_no, snapshot_id) = store
            .begin_round(&session.id, &branch, "hello", initial_state(), 0, 0)
            .await
            .unwrap();
        assert_eq!(round_no, 1);

        let round = store.get_round(&session.id, &branch, round_no).await.unwrap();
        assert_eq!(round.status, RoundStatus::Open);
        assert_eq!(round.snapshot_id.as_deref(), Some(snapshot_id.as_str()));

        store
            .set_round_blockers(&session.id, &branch, round_no, &["gating".to_string()])
            .await
            .unwrap();
        let round = store.get_round(&session.id, &branch, round_no).await.unwrap();
        assert_eq!(round.status, RoundStatus::PendingBlocked);

        store
            .resolve_round_blockers(&session.id, &branch, round_no, &["gating".to_string()])
            .await
            .unwrap();
        let round = store.get_round(&session.id, &branch, round_no).await.unwrap();
        assert_eq!(round.status, RoundStatus::Open);

        store
            .complete_round(&session.id, &branch, round_no)
            .await
            .unwrap();
        let round = store.get_round(&session.id, &branch, round_no).await.unwrap();
        assert_eq!(round.status, RoundStatus::Completed);

        // Completed is terminal: later blocker churn never reopens it.
        store
            .set_round_blockers(&session.id, &branch, round_no, &["late".to_string()])
            .await
            .unwrap();
        let round = store.get_round(&session.id, &branch, round_no).await.unwrap();
        assert_eq!(round.status, RoundStatus::Completed);
        store
            .resolve_round_blockers(&session.id, &branch, round_no, &["late".to_string()])
            .await
            .unwrap();
        let round = store.get_round(&session.id, &branch, round_no).await.unwrap();
        assert_eq!(round.status, RoundStatus::Completed);
    }

    #[tokio::test]
    async fn snapshot_captures_state_and_range() {
        let (_dir, store) = temp_store().await;
        let session = store.create_session(initial_state()).await.unwrap();
        let branch = session.active_branch_id.clone();
        let mut state = initial_state();
        state.insert("mood".into(), json!("wary"));
        let (round_no, snapshot_id) = store
            .begin_round(&session.id, &branch, "hi", state.clone(), 0, 4)
            .await
            .unwrap();
        let snapshot = store.get_snapshot(&session.id, &snapshot_id).await.unwrap();
        assert_eq!(snapshot.anchor_round, round_no);
        assert_eq!(snapshot.range_start, 0);
        assert_eq!(snapshot.range_end, 4);
        assert_eq!(snapshot.stable_state, state);
        assert_eq!(snapshot.tags, vec!["anchor".to_string()]);
    }

    #[tokio::test]
    async fn job_outbox_listing() {
        let (_dir, store) = temp_store().await;
        let session = store.create_session(initial_state()).await.unwrap();
        let branch = session.active_branch_id.clone();
        let job = store
            .record_job(
                &session.id,
                JobKind::StatusUpdate,
                &branch,
                1,
                0,
                true,
                json!({"text": "t"}),
                "snap_x",
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.enqueued);

        let pending = store.list_pending_jobs(&session.id).await.unwrap();
        assert_eq!(pending.len(), 1);

        store.mark_job_enqueued(&session.id, &job.id).await.unwrap();
        let pending = store.list_pending_jobs(&session.id).await.unwrap();
        assert!(pending.is_empty());
        let loaded = store.get_job(&session.id, &job.id).await.unwrap();
        assert!(loaded.enqueued);
        assert_eq!(loaded.status, JobStatus::Enqueued);
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let (_dir, store) = temp_store().await;
        let err = store.load_session("sess_missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn latest_round_and_branch_fork() {
        let (_dir, store) = temp_store().await;
        let session = store.create_session(initial_state()).await.unwrap();
        let branch = session.active_branch_id.clone();
        assert!(store.latest_round(&session.id, &branch).await.unwrap().is_none());

        store
            .begin_round(&session.id, &branch, "one", initial_state(), 0, 0)
            .await
            .unwrap();
        store
            .update_session_state(&session.id, initial_state(), 1)
            .await
            .unwrap();
        store
            .begin_round(&session.id, &branch, "two", initial_state(), 0, 1)
            .await
            .unwrap();
        let latest = store.latest_round(&session.id, &branch).await.unwrap().unwrap();
        assert_eq!(latest.round_no, 2);
        assert_eq!(latest.user_input, "two");

        let fork = store
            .create_branch(&session.id, Some(&branch), Some(2))
            .await
            .unwrap();
        assert_eq!(fork.parent_branch_id.as_deref(), Some(branch.as_str()));
        store.set_active_branch(&session.id, &fork.id).await.unwrap();
        let reloaded = store.load_session(&session.id).await.unwrap();
        assert_eq!(reloaded.active_branch_id, fork.id);
    }
}
