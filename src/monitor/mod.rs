//! Stuck-job watchdog.
//!
//! A job is stuck when it is `running` but has recorded no activity for
//! longer than the configured threshold. Each sweep resumes stuck jobs from
//! their stored checkpoint, up to `max_auto_resume_attempts` per job per UTC
//! day. Past that limit the job is left as it is and reported as
//! [`JobHealth::Abandoned`] until someone resumes it by hand.
//!
//! ```text
//! healthy --(no activity > threshold)--> stuck
//! stuck --(resume call issued)--> resuming, attempts + 1
//! resuming --(resume ok)--> healthy
//! resuming --(resume failed)--> stuck
//! stuck --(attempts exhausted)--> abandoned (manual only)
//! ```

pub mod tracker;

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::MonitorConfig;
use crate::error::Result;
use crate::job::{Job, JobHealth, JobStatus};
use crate::store::{JobFilter, JobStore};
use crate::worker::{ChunkInvoker, ChunkRequest};

pub use tracker::{
    AttemptLedger, AttemptStorage, FileAttemptStorage, MemoryAttemptStorage, ResumeStats,
    ResumeTracker,
};

/// Result of one sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Stuck jobs whose resume call succeeded.
    pub resumed: Vec<Uuid>,
    /// Stuck jobs whose resume call failed.
    pub failed: Vec<Uuid>,
    /// Stuck jobs with no automatic attempts left.
    pub abandoned: Vec<Uuid>,
    /// Stuck jobs skipped because an earlier sweep is still resuming them.
    pub resuming: Vec<Uuid>,
    /// Running jobs with recent activity or a live lease.
    pub healthy: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobHealthEntry {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub health: JobHealth,
    pub auto_resume_attempts: u32,
}

pub struct ResumeMonitor {
    store: Arc<dyn JobStore>,
    invoker: Arc<dyn ChunkInvoker>,
    tracker: Mutex<ResumeTracker>,
    /// Jobs with a resume call in flight. Only changed under the tracker lock
    /// or by [`InFlight`] on drop.
    in_flight: Arc<std::sync::Mutex<HashSet<Uuid>>>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
}

/// Marks a job as being resumed until dropped, including when the resume
/// task panics or is aborted.
struct InFlight {
    job_id: Uuid,
    set: Arc<std::sync::Mutex<HashSet<Uuid>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.job_id);
    }
}

impl ResumeMonitor {
    pub fn new(
        store: Arc<dyn JobStore>,
        invoker: Arc<dyn ChunkInvoker>,
        tracker: ResumeTracker,
        clock: Arc<dyn Clock>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            invoker,
            tracker: Mutex::new(tracker),
            in_flight: Arc::new(std::sync::Mutex::new(HashSet::new())),
            clock,
            config,
        }
    }

    pub async fn classify(&self, job: &Job) -> JobHealth {
        let now = self.clock.now();
        if job.status != JobStatus::Running {
            return JobHealth::Inactive;
        }
        if !job.is_stale(now, self.config.stuck_threshold()) || job.live_lease(now).is_some() {
            return JobHealth::Healthy;
        }
        if self.is_resuming(&job.id) {
            return JobHealth::Stuck;
        }
        if self.tracker.lock().await.can_attempt(&job.id) {
            JobHealth::Stuck
        } else {
            JobHealth::Abandoned
        }
    }

    /// Health of every known job, oldest first.
    pub async fn job_health(&self) -> Vec<JobHealthEntry> {
        let jobs = self.store.list(&JobFilter::all()).await;
        let mut entries = Vec::with_capacity(jobs.len());
        for job in jobs {
            let health = self.classify(&job).await;
            let auto_resume_attempts = self.tracker.lock().await.attempts(&job.id);
            entries.push(JobHealthEntry {
                job_id: job.id,
                status: job.status,
                health,
                auto_resume_attempts,
            });
        }
        entries
    }

    pub async fn stats(&self) -> ResumeStats {
        self.tracker.lock().await.stats()
    }

    pub async fn attempts(&self, job_id: &Uuid) -> u32 {
        self.tracker.lock().await.attempts(job_id)
    }

    /// Give `job_id` a fresh set of automatic attempts.
    pub async fn reset_attempts(&self, job_id: &Uuid) -> Result<()> {
        self.tracker.lock().await.reset(job_id)
    }

    /// One watchdog pass over all running jobs. Stuck jobs are resumed
    /// concurrently; the sweep returns once every resume call has finished.
    ///
    /// The attempt is reserved before the call goes out, so overlapping
    /// sweeps never exceed the daily budget, and a job already being resumed
    /// is skipped.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let threshold = self.config.stuck_threshold();
        let mut report = SweepReport::default();
        let mut resumes = JoinSet::new();

        let running = self.store.list(&JobFilter::status(JobStatus::Running)).await;
        {
            let mut tracker = self.tracker.lock().await;
            for job in running {
                if !job.is_stale(now, threshold) || job.live_lease(now).is_some() {
                    report.healthy += 1;
                    continue;
                }
                if self.is_resuming(&job.id) {
                    tracing::debug!(job_id = %job.id, "Resume already in flight");
                    report.resuming.push(job.id);
                    continue;
                }
                if !tracker.can_attempt(&job.id) {
                    tracing::warn!(
                        job_id = %job.id,
                        checkpoint = %job.checkpoint,
                        attempts = tracker.max_attempts(),
                        "Job stuck with no automatic resumes left, manual action required"
                    );
                    report.abandoned.push(job.id);
                    continue;
                }

                tracing::info!(
                    job_id = %job.id,
                    checkpoint = %job.checkpoint,
                    last_activity_at = ?job.last_activity_at,
                    "Resuming stuck job"
                );
                if let Err(e) = tracker.reserve(job.id) {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to persist resume attempt");
                }
                let guard = self.mark_resuming(job.id);
                let invoker = self.invoker.clone();
                let request = ChunkRequest::continue_from(job.id, job.checkpoint);
                resumes.spawn(async move {
                    let _guard = guard;
                    (request.job_id, invoker.invoke(request).await)
                });
            }
        }

        while let Some(joined) = resumes.join_next().await {
            let (job_id, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(error = %e, "Resume task panicked");
                    continue;
                }
            };
            let success = match outcome {
                Ok(chunk) => {
                    tracing::info!(
                        job_id = %job_id,
                        status = %chunk.status,
                        next = %chunk.next_checkpoint,
                        processed = chunk.processed,
                        "Stuck job resumed"
                    );
                    report.resumed.push(job_id);
                    true
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Resume attempt failed");
                    report.failed.push(job_id);
                    false
                }
            };
            if let Err(e) = self.tracker.lock().await.record_outcome(success) {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to persist resume outcome");
            }
        }

        report
    }

    fn is_resuming(&self, job_id: &Uuid) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(job_id)
    }

    fn mark_resuming(&self, job_id: Uuid) -> InFlight {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id);
        InFlight {
            job_id,
            set: self.in_flight.clone(),
        }
    }

    /// Sweep on every poll interval until `shutdown` is cancelled. The store's
    /// change feed is used to drop ledger entries of jobs that finished.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        let mut changes = self.store.subscribe();
        let mut feed_open = true;

        tracing::info!(
            poll_interval_secs = self.config.poll_interval_secs,
            stuck_threshold_secs = self.config.stuck_threshold_secs,
            max_attempts = self.config.max_auto_resume_attempts,
            "Resume monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Resume monitor stopping");
                    break;
                }

                _ = interval.tick() => {
                    let report = self.sweep().await;
                    let acted = report.resumed.len() + report.failed.len() + report.abandoned.len();
                    if acted > 0 {
                        tracing::info!(
                            resumed = report.resumed.len(),
                            failed = report.failed.len(),
                            abandoned = report.abandoned.len(),
                            healthy = report.healthy,
                            "Sweep finished"
                        );
                    }
                }

                change = changes.recv(), if feed_open => {
                    match change {
                        Ok(change) if change.status.is_terminal() => {
                            if let Err(e) = self.reset_attempts(&change.job_id).await {
                                tracing::warn!(job_id = %change.job_id, error = %e, "Failed to clear resume attempts");
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "Resume monitor lagged behind job changes");
                        }
                        Err(RecvError::Closed) => {
                            feed_open = false;
                        }
                    }
                }
            }
        }
    }
}
