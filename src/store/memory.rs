use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{RelayError, Result};
use crate::job::{Checkpoint, Job, JobSpec, JobStatus, Lease};
use crate::store::{JobChange, JobFilter, JobStore, ProgressUpdate};

const DEFAULT_MAX_JOBS: usize = 10_000;
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// In-process job store. Every method holds the write lock for its whole
/// read-modify-write, which makes `claim` a true conditional update.
#[derive(Debug)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    max_jobs: usize,
    clock: Arc<dyn Clock>,
    changes: broadcast::Sender<JobChange>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            jobs: RwLock::new(HashMap::new()),
            max_jobs: DEFAULT_MAX_JOBS,
            clock,
            changes,
        }
    }

    pub fn with_capacity(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    /// Seed the store with previously persisted jobs.
    pub fn with_jobs(mut self, jobs: impl IntoIterator<Item = Job>) -> Self {
        self.jobs
            .get_mut()
            .extend(jobs.into_iter().map(|job| (job.id, job)));
        self
    }

    /// Every job, oldest first.
    pub async fn snapshot(&self) -> Vec<Job> {
        self.list(&JobFilter::all()).await
    }

    /// Drop terminal jobs that finished before `before`. Returns how many
    /// were removed.
    pub async fn purge_finished(&self, before: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().await;
        let len = jobs.len();
        jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.finished_at.is_some_and(|at| at < before))
        });
        len - jobs.len()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Apply `f` to the job under the write lock, stamp and announce it.
    async fn mutate<F>(&self, id: Uuid, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> Result<bool>,
    {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(RelayError::JobNotFound(id))?;
        if f(job, now)? {
            job.touch(now);
            // No subscribers is fine.
            let _ = self.changes.send(JobChange::from(&*job));
        }
        Ok(job.clone())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, spec: JobSpec) -> Result<Job> {
        if spec.kind.trim().is_empty() {
            return Err(RelayError::InvalidSpec("job kind must not be empty".into()));
        }

        let mut jobs = self.jobs.write().await;
        if jobs.len() >= self.max_jobs {
            return Err(RelayError::StoreFull(self.max_jobs));
        }

        let job = Job::new(spec, self.clock.now());
        jobs.insert(job.id, job.clone());
        let _ = self.changes.send(JobChange::from(&job));
        tracing::debug!(job_id = %job.id, kind = %job.kind, "Job created");
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(RelayError::JobNotFound(id))
    }

    async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        out.sort_by_key(|j| j.created_at);
        out
    }

    async fn update_progress(&self, id: Uuid, update: ProgressUpdate) -> Result<Job> {
        self.mutate(id, |job, now| {
            if job.status.is_terminal() {
                return Ok(false);
            }
            if update.checkpoint.shape() != job.shape() {
                return Err(RelayError::CheckpointShape {
                    expected: job.shape(),
                    got: update.checkpoint.shape(),
                });
            }
            if update.checkpoint.is_behind(&job.checkpoint) {
                return Err(RelayError::CheckpointRewind {
                    job_id: job.id,
                    current: job.checkpoint.to_string(),
                    attempted: update.checkpoint.to_string(),
                });
            }
            if let Some(renew) = &update.renew {
                let held = job
                    .lease
                    .as_ref()
                    .is_some_and(|l| l.is_held_by(&renew.holder, now));
                if !held {
                    return Err(RelayError::LeaseLost {
                        job_id: job.id,
                        holder: renew.holder.clone(),
                    });
                }
                job.lease = Some(Lease {
                    holder: renew.holder.clone(),
                    expires_at: now + renew.ttl,
                });
            }

            job.checkpoint = update.checkpoint;
            job.processed_units += update.processed_delta;
            job.failed_units += update.failed_delta;
            if let Some(total) = job.total_units {
                job.processed_units = job.processed_units.min(total);
            }
            job.last_activity_at = Some(now);
            Ok(true)
        })
        .await
    }

    async fn set_total(&self, id: Uuid, total_units: u64) -> Result<Job> {
        self.mutate(id, |job, _| {
            if job.status.is_terminal() || job.total_units == Some(total_units) {
                return Ok(false);
            }
            job.total_units = Some(total_units);
            job.processed_units = job.processed_units.min(total_units);
            Ok(true)
        })
        .await
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job> {
        self.mutate(id, |job, now| {
            if job.status.is_terminal() {
                return Ok(false);
            }
            job.status = status;
            if error_message.is_some() {
                job.error_message = error_message;
            }
            if status.is_terminal() {
                job.lease = None;
                job.finished_at = Some(now);
            }
            Ok(true)
        })
        .await
    }

    async fn request_cancel(&self, id: Uuid) -> Result<Job> {
        self.mutate(id, |job, _| {
            if job.status.is_terminal() || job.is_cancelling {
                return Ok(false);
            }
            job.is_cancelling = true;
            Ok(true)
        })
        .await
    }

    async fn claim(&self, id: Uuid, holder: &str, ttl: Duration) -> Result<Job> {
        self.mutate(id, |job, now| {
            if job.status.is_terminal() {
                return Err(RelayError::Terminal(job.id));
            }
            if let Some(lease) = job.live_lease(now) {
                if lease.holder != holder {
                    return Err(RelayError::AlreadyClaimed {
                        job_id: job.id,
                        holder: lease.holder.clone(),
                        until: lease.expires_at,
                    });
                }
            }
            job.lease = Some(Lease {
                holder: holder.to_string(),
                expires_at: now + ttl,
            });
            Ok(true)
        })
        .await
    }

    async fn release(&self, id: Uuid, holder: &str) -> Result<Job> {
        self.mutate(id, |job, _| {
            if !job.lease.as_ref().is_some_and(|l| l.holder == holder) {
                return Ok(false);
            }
            job.lease = None;
            Ok(true)
        })
        .await
    }

    async fn restart(&self, id: Uuid) -> Result<Job> {
        self.mutate(id, |job, _| {
            if job.status.is_terminal() {
                return Err(RelayError::Terminal(job.id));
            }
            job.checkpoint = Checkpoint::origin(job.shape());
            job.processed_units = 0;
            job.failed_units = 0;
            job.status = JobStatus::Created;
            job.error_message = None;
            job.is_cancelling = false;
            job.last_activity_at = None;
            job.lease = None;
            Ok(true)
        })
        .await
    }

    async fn active_count(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }

    fn subscribe(&self) -> broadcast::Receiver<JobChange> {
        self.changes.subscribe()
    }
}
