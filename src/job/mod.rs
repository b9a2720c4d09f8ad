//! Job records and resume positions.
//!
//! A [`Job`] is the single source of truth for a long-running task: its
//! status, progress counters and the [`Checkpoint`] from which the next
//! chunk resumes.

pub mod checkpoint;
pub mod record;

pub use checkpoint::{Checkpoint, CheckpointShape};
pub use record::{Job, JobHealth, JobSpec, JobStatus, Lease};
