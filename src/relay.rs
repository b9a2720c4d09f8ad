use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::clock::Clock;
use crate::config::RelayConfig;
use crate::gate::{ConcurrencyGate, DependencyHealth, StoreHealthSource};
use crate::monitor::{
    AttemptStorage, FileAttemptStorage, MemoryAttemptStorage, ResumeMonitor, ResumeTracker,
};
use crate::service::JobService;
use crate::error::Result;
use crate::store::{FileJobStore, JobStore, MemoryJobStore};
use crate::worker::{ChunkWorker, UnitProcessor};

/// One fully wired instance: store, worker, gate, resume monitor, service.
pub struct Relay {
    pub config: RelayConfig,
    pub store: Arc<dyn JobStore>,
    pub dependency: Arc<DependencyHealth>,
    pub gate: Arc<ConcurrencyGate>,
    pub worker: Arc<ChunkWorker>,
    pub monitor: Arc<ResumeMonitor>,
    pub service: Arc<JobService>,
    shutdown: CancellationToken,
}

impl Relay {
    /// Wire an instance around an in-memory store.
    pub fn new(
        config: RelayConfig,
        processor: Arc<dyn UnitProcessor>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        let store = Arc::new(MemoryJobStore::with_clock(clock.clone()));
        Self::with_store(config, store, processor, clock, shutdown)
    }

    /// Wire an instance around the store at `config.store_path`, or an
    /// in-memory one when no path is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store file exists but cannot be read.
    pub async fn open(
        config: RelayConfig,
        processor: Arc<dyn UnitProcessor>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let store: Arc<dyn JobStore> = match &config.store_path {
            Some(path) => Arc::new(FileJobStore::open(path.clone(), clock.clone()).await?),
            None => Arc::new(MemoryJobStore::with_clock(clock.clone())),
        };
        Ok(Self::with_store(config, store, processor, clock, shutdown))
    }

    pub fn with_store(
        config: RelayConfig,
        store: Arc<dyn JobStore>,
        processor: Arc<dyn UnitProcessor>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        let dependency = Arc::new(DependencyHealth::new(config.health.clone()));
        let source = StoreHealthSource::new(
            store.clone(),
            dependency.clone(),
            config.gate.max_concurrent_jobs,
        );
        let gate = Arc::new(ConcurrencyGate::new(
            Arc::new(source),
            clock.clone(),
            config.gate.cooldown(),
        ));

        let worker = Arc::new(
            ChunkWorker::new(store.clone(), processor, config.worker.clone())
                .with_dependency_health(dependency.clone())
                .with_shutdown(shutdown.clone()),
        );

        let storage: Box<dyn AttemptStorage> = match &config.monitor.ledger_path {
            Some(path) => Box::new(FileAttemptStorage::new(path.clone())),
            None => Box::new(MemoryAttemptStorage::new()),
        };
        let tracker = ResumeTracker::new(
            clock.clone(),
            storage,
            config.monitor.max_auto_resume_attempts,
        );
        let monitor = Arc::new(ResumeMonitor::new(
            store.clone(),
            worker.clone(),
            tracker,
            clock,
            config.monitor.clone(),
        ));

        let service = Arc::new(JobService::new(
            store.clone(),
            gate.clone(),
            worker.clone(),
            monitor.clone(),
            shutdown.clone(),
        ));

        Self {
            config,
            store,
            dependency,
            gate,
            worker,
            monitor,
            service,
            shutdown,
        }
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            service: self.service.clone(),
        }
    }

    /// Run the resume monitor in the background and serve the API until
    /// shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the API listener cannot bind or the server fails.
    pub async fn run(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let monitor = self.monitor.clone();
        let monitor_shutdown = self.shutdown.clone();
        let monitor_handle = tokio::spawn(async move {
            monitor.run(monitor_shutdown).await;
        });

        api::serve(self.config.listen_addr, self.api_state(), self.shutdown.clone()).await?;

        self.shutdown.cancel();
        if let Err(e) = monitor_handle.await {
            tracing::warn!(error = %e, "Resume monitor task ended abnormally");
        }
        tracing::info!("Relay stopped");
        Ok(())
    }
}
