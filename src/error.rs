use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::gate::RejectReason;
use crate::job::CheckpointShape;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job store at capacity ({0} jobs)")]
    StoreFull(usize),

    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("Checkpoint rewind on job {job_id}: {attempted} is behind {current}")]
    CheckpointRewind {
        job_id: Uuid,
        current: String,
        attempted: String,
    },

    #[error("Checkpoint shape mismatch: job uses {expected}, got {got}")]
    CheckpointShape {
        expected: CheckpointShape,
        got: CheckpointShape,
    },

    #[error("Checkpoint {checkpoint} is past the end of job {job_id}")]
    CheckpointOutOfRange { job_id: Uuid, checkpoint: String },

    #[error("Job {job_id} is already claimed by {holder} until {until}")]
    AlreadyClaimed {
        job_id: Uuid,
        holder: String,
        until: DateTime<Utc>,
    },

    #[error("Lease on job {job_id} is no longer held by {holder}")]
    LeaseLost { job_id: Uuid, holder: String },

    #[error("Job {0} is in a terminal state")]
    Terminal(Uuid),

    #[error("Admission rejected: {0}")]
    AdmissionRejected(RejectReason),

    #[error("Health source error: {0}")]
    Health(String),

    #[error("Remote invocation failed: {0}")]
    Remote(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Job store error: {0}")]
    Store(String),

    #[error("Attempt ledger error: {0}")]
    Ledger(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
