//! Outbox poller: the background loop that guarantees every recorded job is
//! eventually dispatched.
//!
//! Each pass scans every session's pending jobs (recorded with
//! `enqueued=false`). Against a real queue the job is enqueued and its outbox
//! marker set; against the `"null"` queue it is executed inline so dev-mode
//! rounds still settle. Dispatch failures are logged and swallowed — no
//! retry is scheduled beyond the next pass picking the job up again while it
//! is still pending.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::store::SessionStore;
use crate::store::records::JobStatus;

use super::queue::JobQueue;
use super::worker::JobProcessor;

/// Background poller over the store's job outbox.
pub struct OutboxPoller {
    store: Arc<SessionStore>,
    queue: Arc<dyn JobQueue>,
    processor: Arc<JobProcessor>,
    interval: Duration,
}

/// Handle to a spawned poller; dropping it leaves the loop running for the
/// process lifetime, `shutdown()` stops it.
pub struct OutboxHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl OutboxHandle {
    /// Signal the loop to stop and wait for it to wind down.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

impl OutboxPoller {
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        queue: Arc<dyn JobQueue>,
        processor: Arc<JobProcessor>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            processor,
            interval,
        }
    }

    /// Spawn the poll loop on its own task.
    #[must_use]
    pub fn spawn(self: Arc<Self>) -> OutboxHandle {
        let (stop, mut stopped) = watch::channel(false);
        tracing::info!(
            interval_secs = self.interval.as_secs_f32(),
            queue = self.queue.kind(),
            "outbox poller started"
        );
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                    _ = stopped.changed() => {
                        if *stopped.borrow() {
                            tracing::info!("outbox poller stopping");
                            break;
                        }
                    }
                }
            }
        });
        OutboxHandle { stop, handle }
    }

    /// One poll pass over every session; returns the number of jobs
    /// dispatched (enqueued or executed inline).
    pub async fn poll_once(&self) -> usize {
        let sessions = match self.store.list_sessions().await {
            Ok(sessions) => sessions,
            Err(err) => {
                tracing::warn!(error = %err, "outbox: listing sessions failed");
                return 0;
            }
        };
        let mut dispatched = 0;
        for session_id in sessions {
            let jobs = match self.store.list_pending_jobs(&session_id).await {
                Ok(jobs) => jobs,
                Err(err) => {
                    tracing::warn!(session = %session_id, error = %err, "outbox: listing jobs failed");
                    continue;
                }
            };
            for job in jobs {
                if self.queue.kind() == "null" {
                    // Dev mode: execute in-process so rounds do not stay blocked.
                    let outcome = self.processor.process(&job).await;
                    let status = if outcome.ok {
                        JobStatus::Completed
                    } else {
                        JobStatus::Failed
                    };
                    match self
                        .store
                        .update_job_status(&session_id, &job.id, status, Some(outcome.into_value()))
                        .await
                    {
                        Ok(()) => {
                            tracing::info!(job = %job.id, "outbox: executed pending job inline");
                            dispatched += 1;
                        }
                        Err(err) => {
                            tracing::warn!(job = %job.id, error = %err, "outbox: recording outcome failed");
                        }
                    }
                } else {
                    match self.queue.enqueue(&job).await {
                        Ok(tracking_id) => {
                            if let Err(err) =
                                self.store.mark_job_enqueued(&session_id, &job.id).await
                            {
                                tracing::warn!(job = %job.id, error = %err, "outbox: marking enqueued failed");
                            } else {
                                tracing::info!(job = %job.id, tracking = %tracking_id, "outbox: enqueued pending job");
                                dispatched += 1;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(job = %job.id, error = %err, "outbox: job dispatch failed");
                        }
                    }
                }
            }
        }
        dispatched
    }
}
