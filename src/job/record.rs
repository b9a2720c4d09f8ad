use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::checkpoint::{Checkpoint, CheckpointShape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    /// Terminal jobs never change checkpoint, counters or status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Created => write!(f, "created"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Error => write!(f, "error"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobStatus::Created),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "error" => Ok(JobStatus::Error),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Exclusive claim a worker holds on a job while it processes a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn is_held_by(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.holder == holder && self.is_live(now)
    }
}

/// Parameters for creating a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub kind: String,
    #[serde(default)]
    pub total_units: Option<u64>,
    #[serde(default = "default_shape")]
    pub shape: CheckpointShape,
    /// Kind-specific payload handed to the unit processor.
    #[serde(default)]
    pub params: serde_json::Value,
}

fn default_shape() -> CheckpointShape {
    CheckpointShape::Offset
}

impl JobSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            total_units: None,
            shape: CheckpointShape::Offset,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_total(mut self, total_units: u64) -> Self {
        self.total_units = Some(total_units);
        self
    }

    pub fn with_shape(mut self, shape: CheckpointShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Persisted state of one long-running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: String,
    pub params: serde_json::Value,
    pub status: JobStatus,
    /// `None` until the first chunk has discovered the amount of work.
    pub total_units: Option<u64>,
    pub processed_units: u64,
    pub failed_units: u64,
    pub checkpoint: Checkpoint,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub is_cancelling: bool,
    pub lease: Option<Lease>,
    /// Bumped on every mutation.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: spec.kind,
            params: spec.params,
            status: JobStatus::Created,
            total_units: spec.total_units,
            processed_units: 0,
            failed_units: 0,
            checkpoint: Checkpoint::origin(spec.shape),
            last_activity_at: None,
            error_message: None,
            is_cancelling: false,
            lease: None,
            version: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn shape(&self) -> CheckpointShape {
        self.checkpoint.shape()
    }

    /// Running but without recorded activity inside `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        match self.last_activity_at {
            None => true,
            Some(at) => now - at > threshold,
        }
    }

    /// Holder of a lease that has not expired yet.
    pub fn live_lease(&self, now: DateTime<Utc>) -> Option<&Lease> {
        self.lease.as_ref().filter(|l| l.is_live(now))
    }

    /// Completion percentage, when the total is known.
    pub fn progress_percent(&self) -> Option<f64> {
        match self.total_units {
            Some(0) => Some(100.0),
            Some(total) => {
                let done = self.processed_units + self.failed_units;
                Some(done as f64 * 100.0 / total as f64)
            }
            None => None,
        }
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

/// Health of a job as seen by the auto-resume monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobHealth {
    /// Not running: created, paused or terminal.
    Inactive,
    Healthy,
    /// Stale and still eligible for automatic resumption.
    Stuck,
    /// Stale with automatic attempts exhausted; needs a manual resume.
    Abandoned,
}

impl std::fmt::Display for JobHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobHealth::Inactive => write!(f, "inactive"),
            JobHealth::Healthy => write!(f, "healthy"),
            JobHealth::Stuck => write!(f, "stuck"),
            JobHealth::Abandoned => write!(f, "abandoned"),
        }
    }
}
