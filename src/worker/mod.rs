//! Worker invocation: one bounded chunk per call.
//!
//! - [`UnitProcessor`]: job-kind specific work for a single unit
//! - [`ChunkWorker`]: claims the job's lease, processes up to `chunk_size`
//!   units from the checkpoint, persists progress after every unit, then
//!   stops
//! - [`ChunkInvoker`]: "run a chunk" as seen by callers; implemented
//!   in-process by [`ChunkWorker`] and over HTTP by [`RemoteInvoker`]
//!
//! # Chunk flow
//!
//! 1. Terminal or paused jobs are returned untouched; a job with
//!    `is_cancelling` set is marked cancelled without processing
//! 2. The lease is claimed under a per-call holder; a live lease held by
//!    anyone else, including another call in this process, fails the call
//! 3. The total is discovered if unknown
//! 4. Units are processed from `max(stored, continue_from)`, checking the
//!    cancellation token before each one. A `continue_from` past the end of
//!    the work is rejected. A token tripped by shutdown stops the chunk but
//!    leaves the job `running`
//! 5. The job completes when no unit is left, otherwise stays running
//! 6. The lease is released

pub mod chunk;
pub mod invoker;
pub mod processor;
pub mod simulated;

pub use chunk::{ChunkReport, ChunkRequest, ChunkWorker};
pub use invoker::{ChunkInvoker, RemoteInvoker};
pub use processor::{Unit, UnitError, UnitProcessor};
pub use simulated::SimulatedProcessor;
