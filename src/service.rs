use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::gate::{Admission, ConcurrencyGate, HealthSnapshot};
use crate::job::{Job, JobSpec, JobStatus};
use crate::monitor::ResumeMonitor;
use crate::store::{JobFilter, JobStore};
use crate::worker::{ChunkInvoker, ChunkReport, ChunkRequest, ChunkWorker};

#[derive(Debug, Clone, Serialize)]
pub struct GateStatus {
    #[serde(flatten)]
    pub snapshot: HealthSnapshot,
    pub cooldown_until: Option<chrono::DateTime<chrono::Utc>>,
    pub delay_multiplier: f64,
}

/// Entry point for user actions: start, pause, resume, cancel, restart.
///
/// Started and resumed jobs are driven chunk after chunk in a background
/// task until they leave `running` or a chunk fails; the resume monitor
/// picks up anything that stalls after that.
pub struct JobService {
    store: Arc<dyn JobStore>,
    gate: Arc<ConcurrencyGate>,
    worker: Arc<ChunkWorker>,
    monitor: Arc<ResumeMonitor>,
    shutdown: CancellationToken,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        gate: Arc<ConcurrencyGate>,
        worker: Arc<ChunkWorker>,
        monitor: Arc<ResumeMonitor>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            gate,
            worker,
            monitor,
            shutdown,
        }
    }

    pub fn monitor(&self) -> &Arc<ResumeMonitor> {
        &self.monitor
    }

    pub async fn get(&self, id: Uuid) -> Result<Job> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        self.store.list(filter).await
    }

    /// Create and start a job if the gate admits it.
    pub async fn start(&self, spec: JobSpec) -> Result<Job> {
        if let Admission::Rejected(reason) = self.gate.check_can_start_job().await {
            tracing::info!(kind = %spec.kind, reason = %reason, "Job start deferred");
            return Err(RelayError::AdmissionRejected(reason));
        }

        let job = self.store.create(spec).await?;
        let job = self
            .store
            .set_status(job.id, JobStatus::Running, None)
            .await?;
        tracing::info!(job_id = %job.id, kind = %job.kind, total_units = ?job.total_units, "Job started");

        self.spawn_driver(ChunkRequest::fresh(job.id));
        Ok(job)
    }

    /// Manual resume from the stored checkpoint. Clears the automatic
    /// attempt guard, so abandoned jobs become eligible again.
    pub async fn resume(&self, id: Uuid) -> Result<Job> {
        let job = self.store.get(id).await?;
        if job.status.is_terminal() {
            return Err(RelayError::Terminal(id));
        }
        self.monitor.reset_attempts(&id).await?;

        let job = if job.status == JobStatus::Running {
            job
        } else {
            self.store.set_status(id, JobStatus::Running, None).await?
        };
        tracing::info!(job_id = %id, checkpoint = %job.checkpoint, "Job resumed manually");

        self.spawn_driver(ChunkRequest::continue_from(id, job.checkpoint));
        Ok(job)
    }

    pub async fn pause(&self, id: Uuid) -> Result<Job> {
        let job = self.store.get(id).await?;
        if job.status.is_terminal() {
            return Err(RelayError::Terminal(id));
        }
        let job = self.store.set_status(id, JobStatus::Paused, None).await?;
        tracing::info!(job_id = %id, checkpoint = %job.checkpoint, "Job paused");
        Ok(job)
    }

    /// Request cooperative cancellation. An in-flight chunk stops at its next
    /// unit; otherwise a chunk is invoked so the worker observes the request
    /// right away.
    pub async fn cancel(&self, id: Uuid) -> Result<Job> {
        let job = self.store.request_cancel(id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        if self.worker.cancel_inflight(&id) {
            tracing::info!(job_id = %id, "Cancellation signalled to running chunk");
            return Ok(job);
        }
        match self.worker.invoke(ChunkRequest::fresh(id)).await {
            Ok(_) => {}
            // Another worker owns the job and will see the flag.
            Err(RelayError::AlreadyClaimed { .. }) => {}
            Err(e) => return Err(e),
        }
        self.store.get(id).await
    }

    /// Rewind a non-terminal job to its first unit. The job is left in
    /// `created`; resume it to run again.
    pub async fn restart(&self, id: Uuid) -> Result<Job> {
        let job = self.store.restart(id).await?;
        self.monitor.reset_attempts(&id).await?;
        tracing::info!(job_id = %id, "Job restarted from zero");
        Ok(job)
    }

    /// Run exactly one chunk, as the remote chunk endpoint does.
    pub async fn run_chunk(&self, request: ChunkRequest) -> Result<ChunkReport> {
        self.worker.invoke(request).await
    }

    pub async fn gate_status(&self) -> Result<GateStatus> {
        let snapshot = self.gate.snapshot().await?;
        Ok(GateStatus {
            delay_multiplier: snapshot.status.delay_multiplier(),
            cooldown_until: self.gate.cooldown_until(),
            snapshot,
        })
    }

    pub async fn admission(&self) -> Admission {
        self.gate.check_can_start_job().await
    }

    fn spawn_driver(&self, first: ChunkRequest) {
        let worker = self.worker.clone();
        let gate = self.gate.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            drive(worker, gate, first, shutdown).await;
        });
    }
}

/// Invoke chunks back to back until the job stops running, a chunk makes no
/// progress, a chunk fails, or shutdown begins.
async fn drive(
    worker: Arc<ChunkWorker>,
    gate: Arc<ConcurrencyGate>,
    first: ChunkRequest,
    shutdown: CancellationToken,
) {
    let job_id = first.job_id;
    let mut request = first;
    loop {
        let report = match worker.invoke(request).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Chunk failed, leaving job to the resume monitor");
                return;
            }
        };
        if report.status != JobStatus::Running || report.processed + report.failed == 0 {
            tracing::debug!(job_id = %job_id, status = %report.status, "Driver finished");
            return;
        }

        let multiplier = match gate.snapshot().await {
            Ok(snapshot) => snapshot.status.delay_multiplier(),
            Err(_) => 1.0,
        };
        let delay = worker.config().continue_delay(multiplier);
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        request = ChunkRequest::continue_from(job_id, report.next_checkpoint);
    }
}
