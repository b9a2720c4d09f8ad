use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{RelayError, Result};
use crate::gate::DependencyHealth;
use crate::job::{Checkpoint, Job, JobStatus};
use crate::store::{JobStore, ProgressUpdate};
use crate::worker::processor::{UnitError, UnitProcessor};

/// Input of one worker invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub job_id: Uuid,
    /// Resume position. The stored checkpoint wins when it is further ahead.
    #[serde(default)]
    pub continue_from: Option<Checkpoint>,
}

impl ChunkRequest {
    pub fn fresh(job_id: Uuid) -> Self {
        Self {
            job_id,
            continue_from: None,
        }
    }

    pub fn continue_from(job_id: Uuid, checkpoint: Checkpoint) -> Self {
        Self {
            job_id,
            continue_from: Some(checkpoint),
        }
    }
}

/// Outcome of one worker invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkReport {
    pub job_id: Uuid,
    /// Units that succeeded in this chunk.
    pub processed: u64,
    /// Units that failed and were skipped in this chunk.
    pub failed: u64,
    pub next_checkpoint: Checkpoint,
    pub status: JobStatus,
}

impl ChunkReport {
    fn of(job: &Job, processed: u64, failed: u64) -> Self {
        Self {
            job_id: job.id,
            processed,
            failed,
            next_checkpoint: job.checkpoint,
            status: job.status,
        }
    }
}

/// Processes one bounded chunk of a job and stops.
///
/// All state lives in the [`JobStore`]; the worker only holds the job's
/// lease for the duration of a chunk. It never loops across chunks: the
/// caller (or the resume monitor) invokes it again from the checkpoint.
pub struct ChunkWorker {
    store: Arc<dyn JobStore>,
    processor: Arc<dyn UnitProcessor>,
    config: WorkerConfig,
    dependency: Option<Arc<DependencyHealth>>,
    shutdown: CancellationToken,
    inflight: Mutex<HashMap<Uuid, Vec<(u64, CancellationToken)>>>,
    next_call: AtomicU64,
}

/// Removes one tracked call's token when the call ends or is dropped.
struct Tracked<'a> {
    inflight: &'a Mutex<HashMap<Uuid, Vec<(u64, CancellationToken)>>>,
    job_id: Uuid,
    call: u64,
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(calls) = inflight.get_mut(&self.job_id) {
            calls.retain(|(call, _)| *call != self.call);
            if calls.is_empty() {
                inflight.remove(&self.job_id);
            }
        }
    }
}

impl ChunkWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        processor: Arc<dyn UnitProcessor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            processor,
            config,
            dependency: None,
            shutdown: CancellationToken::new(),
            inflight: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(0),
        }
    }

    /// Record latency and outcome of every unit call into `dependency`.
    pub fn with_dependency_health(mut self, dependency: Arc<DependencyHealth>) -> Self {
        self.dependency = Some(dependency);
        self
    }

    /// Tripping `shutdown` stops every tracked chunk at its next unit
    /// boundary. Progress is kept and the job stays `running`.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Cancel every chunk currently running for `job_id`. Returns whether
    /// one was running.
    pub fn cancel_inflight(&self, job_id: &Uuid) -> bool {
        let inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        match inflight.get(job_id) {
            Some(calls) if !calls.is_empty() => {
                for (_, token) in calls {
                    token.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// Run one chunk with a token that [`cancel_inflight`](Self::cancel_inflight)
    /// or shutdown can trip.
    pub async fn run_tracked(&self, request: ChunkRequest) -> Result<ChunkReport> {
        let job_id = request.job_id;
        let call = self.next_call.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(job_id)
            .or_default()
            .push((call, token.clone()));
        let _tracked = Tracked {
            inflight: &self.inflight,
            job_id,
            call,
        };

        self.run_chunk(request, token).await
    }

    /// Process up to `chunk_size` units of the job.
    ///
    /// Returns without touching the job when it is terminal or paused, and
    /// marks it cancelled without processing when cancellation was requested.
    /// Tripping `cancel` marks the job cancelled too, unless the worker is
    /// shutting down and nobody asked for cancellation: then the chunk just
    /// stops and the job stays resumable from its checkpoint.
    ///
    /// Fails with [`RelayError::AlreadyClaimed`] when another worker holds a
    /// live lease on it, and with [`RelayError::CheckpointOutOfRange`] when
    /// `continue_from` lies past the end of the work.
    pub async fn run_chunk(
        &self,
        request: ChunkRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkReport> {
        let job_id = request.job_id;
        let job = self.store.get(job_id).await?;

        if job.status.is_terminal() {
            tracing::debug!(job_id = %job_id, status = %job.status, "Job already finished");
            return Ok(ChunkReport::of(&job, 0, 0));
        }
        if job.is_cancelling {
            let job = self
                .store
                .set_status(job_id, JobStatus::Cancelled, None)
                .await?;
            tracing::info!(job_id = %job_id, "Job cancelled before chunk");
            return Ok(ChunkReport::of(&job, 0, 0));
        }
        if job.status == JobStatus::Paused {
            tracing::debug!(job_id = %job_id, "Job paused, chunk skipped");
            return Ok(ChunkReport::of(&job, 0, 0));
        }

        // One holder per call, so two calls in this process exclude each other.
        let call = self.next_call.fetch_add(1, Ordering::Relaxed);
        let holder = format!("{}#{}", self.config.worker_id, call);
        let job = self
            .store
            .claim(job_id, &holder, self.config.lease_ttl())
            .await?;

        let result = self
            .process_claimed(job, &holder, request.continue_from, &cancel)
            .await;

        if let Err(e) = self.store.release(job_id, &holder).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to release lease");
        }
        result
    }

    async fn process_claimed(
        &self,
        mut job: Job,
        holder: &str,
        continue_from: Option<Checkpoint>,
        cancel: &CancellationToken,
    ) -> Result<ChunkReport> {
        let job_id = job.id;
        let ttl = self.config.lease_ttl();

        if job.status == JobStatus::Created {
            job = self
                .store
                .set_status(job_id, JobStatus::Running, None)
                .await?;
        }

        if job.total_units.is_none() {
            match self.processor.total_units(&job).await {
                Ok(total) => job = self.store.set_total(job_id, total).await?,
                Err(e) => return self.fail(job_id, e.to_string(), 0, 0).await,
            }
        }

        let cursor = match continue_from {
            Some(from) if from.shape() != job.shape() => {
                return Err(RelayError::CheckpointShape {
                    expected: job.shape(),
                    got: from.shape(),
                })
            }
            Some(from) if job.checkpoint.is_behind(&from) => {
                if !self.processor.within_bounds(&job, &from) {
                    return Err(RelayError::CheckpointOutOfRange {
                        job_id,
                        checkpoint: from.to_string(),
                    });
                }
                from
            }
            _ => job.checkpoint,
        };
        if cursor != job.checkpoint {
            job = self
                .store
                .update_progress(job_id, ProgressUpdate::new(cursor).held_by(holder, ttl))
                .await?;
        }

        tracing::info!(
            job_id = %job_id,
            kind = %job.kind,
            from = %job.checkpoint,
            chunk_size = self.config.chunk_size,
            "Processing chunk"
        );

        let mut processed = 0u64;
        let mut failed = 0u64;
        let mut handled = 0u64;
        let mut cancelled = false;

        while handled < self.config.chunk_size {
            if cancel.is_cancelled() || job.is_cancelling {
                cancelled = true;
                break;
            }
            let Some(unit) = self.processor.next_unit(&job, &job.checkpoint) else {
                break;
            };

            let started = Instant::now();
            let outcome = self.processor.process_unit(&job, &unit.at).await;
            if let Some(dependency) = &self.dependency {
                dependency.record(started.elapsed(), outcome.is_ok());
            }

            let update = match outcome {
                Ok(()) => {
                    processed += 1;
                    ProgressUpdate::new(unit.next).processed(1)
                }
                Err(UnitError::Skippable(reason)) => {
                    failed += 1;
                    tracing::warn!(job_id = %job_id, at = %unit.at, reason = %reason, "Unit failed, skipping");
                    ProgressUpdate::new(unit.next).failed(1)
                }
                Err(UnitError::Fatal(reason)) => {
                    tracing::error!(job_id = %job_id, at = %unit.at, reason = %reason, "Chunk aborted");
                    return self.fail(job_id, reason, processed, failed).await;
                }
            };
            job = self
                .store
                .update_progress(job_id, update.held_by(holder, ttl))
                .await?;
            handled += 1;

            if failed > self.config.max_unit_failures {
                let message = format!("{} unit failures in one chunk", failed);
                return self.fail(job_id, message, processed, failed).await;
            }
            if job.status != JobStatus::Running {
                break;
            }
        }

        if cancelled {
            let current = self.store.get(job_id).await?;
            if !current.is_cancelling && self.shutdown.is_cancelled() {
                tracing::info!(
                    job_id = %job_id,
                    at = %current.checkpoint,
                    processed,
                    "Chunk interrupted by shutdown, job left resumable"
                );
                return Ok(ChunkReport::of(&current, processed, failed));
            }
            let job = self
                .store
                .set_status(job_id, JobStatus::Cancelled, None)
                .await?;
            tracing::info!(job_id = %job_id, at = %job.checkpoint, processed, "Job cancelled mid-chunk");
            return Ok(ChunkReport::of(&job, processed, failed));
        }

        let exhausted = self.processor.next_unit(&job, &job.checkpoint).is_none();
        if job.status == JobStatus::Running && exhausted {
            job = self
                .store
                .set_status(job_id, JobStatus::Completed, None)
                .await?;
            tracing::info!(
                job_id = %job_id,
                processed_units = job.processed_units,
                failed_units = job.failed_units,
                "Job completed"
            );
        } else {
            tracing::info!(job_id = %job_id, next = %job.checkpoint, processed, failed, "Chunk finished");
        }

        Ok(ChunkReport::of(&job, processed, failed))
    }

    async fn fail(
        &self,
        job_id: Uuid,
        message: String,
        processed: u64,
        failed: u64,
    ) -> Result<ChunkReport> {
        let job = self
            .store
            .set_status(job_id, JobStatus::Error, Some(message))
            .await?;
        tracing::error!(job_id = %job_id, error = ?job.error_message, "Job failed");
        Ok(ChunkReport::of(&job, processed, failed))
    }
}
