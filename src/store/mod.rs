//! Durable job-record storage.
//!
//! [`JobStore`] is the only shared mutable resource in the system: workers
//! advance checkpoints through it, the resume monitor reads it, and every
//! mutation is announced on a [`JobChange`] broadcast so watchers do not
//! have to poll.
//!
//! Implementations must make each method atomic with respect to the others
//! for a given job. [`JobStore::claim`] in particular is a conditional update:
//! two callers racing to claim the same job must see exactly one success.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::job::{Checkpoint, Job, JobSpec, JobStatus};

pub use file::FileJobStore;
pub use memory::MemoryJobStore;

/// Renew the caller's lease as part of a progress write.
#[derive(Debug, Clone)]
pub struct LeaseRenewal {
    pub holder: String,
    pub ttl: Duration,
}

/// One progress write from a worker.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub checkpoint: Checkpoint,
    pub processed_delta: u64,
    pub failed_delta: u64,
    pub renew: Option<LeaseRenewal>,
}

impl ProgressUpdate {
    pub fn new(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint,
            processed_delta: 0,
            failed_delta: 0,
            renew: None,
        }
    }

    pub fn processed(mut self, delta: u64) -> Self {
        self.processed_delta = delta;
        self
    }

    pub fn failed(mut self, delta: u64) -> Self {
        self.failed_delta = delta;
        self
    }

    pub fn held_by(mut self, holder: impl Into<String>, ttl: Duration) -> Self {
        self.renew = Some(LeaseRenewal {
            holder: holder.into(),
            ttl,
        });
        self
    }
}

/// Selection for [`JobStore::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub kind: Option<String>,
    /// Only jobs whose last activity is missing or earlier than this instant.
    pub inactive_since: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn status(status: JobStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn inactive_since(mut self, at: DateTime<Utc>) -> Self {
        self.inactive_since = Some(at);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        if let Some(kind) = &self.kind {
            if &job.kind != kind {
                return false;
            }
        }
        if let Some(at) = self.inactive_since {
            if job.last_activity_at.is_some_and(|last| last >= at) {
                return false;
            }
        }
        true
    }
}

/// Notification emitted after every committed mutation.
#[derive(Debug, Clone, Serialize)]
pub struct JobChange {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub checkpoint: Checkpoint,
    pub version: u64,
}

impl From<&Job> for JobChange {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            checkpoint: job.checkpoint,
            version: job.version,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in `created` state at the origin of its shape.
    async fn create(&self, spec: JobSpec) -> Result<Job>;

    async fn get(&self, id: Uuid) -> Result<Job>;

    /// Jobs matching `filter`, oldest first.
    async fn list(&self, filter: &JobFilter) -> Vec<Job>;

    /// Advance the checkpoint and counters. Rewinds are rejected; a terminal
    /// job is returned unchanged.
    async fn update_progress(&self, id: Uuid, update: ProgressUpdate) -> Result<Job>;

    /// Record the total amount of work once it is known.
    async fn set_total(&self, id: Uuid, total_units: u64) -> Result<Job>;

    /// Transition status. A terminal job is returned unchanged.
    async fn set_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job>;

    /// Ask the worker to stop at its next unit boundary.
    async fn request_cancel(&self, id: Uuid) -> Result<Job>;

    /// Take the processing lease if it is free, expired or already ours.
    async fn claim(&self, id: Uuid, holder: &str, ttl: Duration) -> Result<Job>;

    /// Drop the lease if `holder` owns it.
    async fn release(&self, id: Uuid, holder: &str) -> Result<Job>;

    /// Rewind a non-terminal job to the origin of its shape.
    async fn restart(&self, id: Uuid) -> Result<Job>;

    /// Number of jobs currently `running`.
    async fn active_count(&self) -> usize;

    fn subscribe(&self) -> broadcast::Receiver<JobChange>;
}
