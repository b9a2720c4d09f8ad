use std::net::SocketAddr;
use std::path::PathBuf;

/// Settings for chunk processing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prefix of the lease holder written by each chunk this worker runs.
    pub worker_id: String,
    /// Maximum units handled by a single invocation.
    pub chunk_size: u64,
    /// Skippable unit failures tolerated within one chunk before the chunk
    /// is treated as a systemic failure.
    pub max_unit_failures: u64,
    /// Lease length; renewed after every unit.
    pub lease_ttl_secs: u64,
    /// Pause between consecutive chunks of the same job, before the health
    /// delay multiplier is applied.
    pub continue_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "local".to_string(),
            chunk_size: 50,
            max_unit_failures: 10,
            lease_ttl_secs: 120,
            continue_delay_ms: 250,
        }
    }
}

impl WorkerConfig {
    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs as i64)
    }

    /// Delay before the next chunk, scaled by the dependency's health.
    pub fn continue_delay(&self, multiplier: f64) -> std::time::Duration {
        std::time::Duration::from_millis(self.continue_delay_ms).mul_f64(multiplier.max(1.0))
    }
}

/// Settings for the stuck-job watchdog.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between sweeps.
    pub poll_interval_secs: u64,
    /// A running job with no activity for longer than this is stuck.
    pub stuck_threshold_secs: u64,
    /// Automatic resumes allowed per job per UTC day.
    pub max_auto_resume_attempts: u32,
    /// Where the attempt ledger is persisted. In-memory when `None`.
    pub ledger_path: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            stuck_threshold_secs: 5 * 60,
            max_auto_resume_attempts: 3,
            ledger_path: None,
        }
    }
}

impl MonitorConfig {
    pub fn stuck_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_threshold_secs as i64)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs)
    }
}

/// Admission control settings.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub max_concurrent_jobs: usize,
    /// How long admissions stay closed after an unhealthy or critical reading.
    pub cooldown_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            cooldown_secs: 60,
        }
    }
}

impl GateConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }
}

/// Thresholds that turn dependency call samples into a health level.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Number of most recent calls considered.
    pub window: usize,
    /// Below this many samples the dependency is reported healthy.
    pub min_samples: usize,
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
    pub critical_error_rate: f64,
    pub degraded_latency_ms: u64,
    pub unhealthy_latency_ms: u64,
    pub critical_latency_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: 50,
            min_samples: 5,
            degraded_error_rate: 0.10,
            unhealthy_error_rate: 0.25,
            critical_error_rate: 0.50,
            degraded_latency_ms: 2_000,
            unhealthy_latency_ms: 5_000,
            critical_latency_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub worker: WorkerConfig,
    pub monitor: MonitorConfig,
    pub gate: GateConfig,
    pub health: HealthConfig,
    /// Where job records are persisted. In-memory when `None`.
    pub store_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:8080"
                .parse()
                .expect("default listen address is valid"),
            worker: WorkerConfig::default(),
            monitor: MonitorConfig::default(),
            gate: GateConfig::default(),
            health: HealthConfig::default(),
            store_path: None,
        }
    }
}

impl RelayConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker.worker_id = worker_id.into();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.worker.chunk_size = chunk_size;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.gate.max_concurrent_jobs = max;
        self
    }

    pub fn with_ledger_path(mut self, path: PathBuf) -> Self {
        self.monitor.ledger_path = Some(path);
        self
    }

    pub fn with_store_path(mut self, path: PathBuf) -> Self {
        self.store_path = Some(path);
        self
    }
}
