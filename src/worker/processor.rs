use async_trait::async_trait;
use thiserror::Error;

use crate::job::{Checkpoint, Job};

/// Failure of a single unit of work.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UnitError {
    /// This unit failed; record it, skip it and carry on.
    #[error("unit failed: {0}")]
    Skippable(String),
    /// Systemic failure (auth, quota, malformed input); the chunk stops and
    /// the job moves to `error`.
    #[error("{0}")]
    Fatal(String),
}

/// The next unit to process and the position that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unit {
    pub at: Checkpoint,
    pub next: Checkpoint,
}

/// Job-kind specific work. Implementations are stateless between calls;
/// everything they need comes from the [`Job`].
#[async_trait]
pub trait UnitProcessor: Send + Sync {
    /// Amount of work, called once when the job's total is still unknown.
    async fn total_units(&self, job: &Job) -> Result<u64, UnitError>;

    /// First unit at or after `from`, or `None` once the work is exhausted.
    ///
    /// The default walks an `Offset` checkpoint up to the job's total.
    /// Processors using `Nested` checkpoints must override this.
    fn next_unit(&self, job: &Job, from: &Checkpoint) -> Option<Unit> {
        match (from, job.total_units) {
            (Checkpoint::Offset { index }, Some(total)) if *index < total => Some(Unit {
                at: *from,
                next: Checkpoint::offset(index + 1),
            }),
            _ => None,
        }
    }

    /// Whether `at` lies inside the job's work or exactly at its end.
    ///
    /// The default bounds an `Offset` checkpoint by the job's total and
    /// accepts anything while the total is unknown. Processors using
    /// `Nested` checkpoints should override this.
    fn within_bounds(&self, job: &Job, at: &Checkpoint) -> bool {
        match (at, job.total_units) {
            (Checkpoint::Offset { index }, Some(total)) => *index <= total,
            _ => true,
        }
    }

    async fn process_unit(&self, job: &Job, at: &Checkpoint) -> Result<(), UnitError>;
}
