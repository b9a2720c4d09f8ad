use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::HealthConfig;
use crate::error::Result;
use crate::store::JobStore;

/// Backpressure level of the external dependency chunks call out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    /// Factor callers apply to their own retry and pacing delays.
    pub fn delay_multiplier(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 2.0,
            HealthStatus::Unhealthy => 4.0,
            HealthStatus::Critical => 8.0,
        }
    }

    /// Whether new work may be admitted at this level.
    pub fn admits(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub active_jobs: usize,
    pub max_concurrent_jobs: usize,
}

#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn snapshot(&self) -> Result<HealthSnapshot>;
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    latency: Duration,
    success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyMetrics {
    pub samples: usize,
    pub error_rate: f64,
    pub mean_latency_ms: u64,
    pub status: HealthStatus,
}

/// Sliding window of recent calls to an external dependency.
#[derive(Debug)]
pub struct DependencyHealth {
    config: HealthConfig,
    samples: Mutex<VecDeque<Sample>>,
}

impl DependencyHealth {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(config.window)),
            config,
        }
    }

    pub fn record(&self, latency: Duration, success: bool) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        if samples.len() == self.config.window.max(1) {
            samples.pop_front();
        }
        samples.push_back(Sample { latency, success });
    }

    pub fn metrics(&self) -> DependencyMetrics {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let count = samples.len();
        let (error_rate, mean_latency_ms) = if count == 0 {
            (0.0, 0)
        } else {
            let failures = samples.iter().filter(|s| !s.success).count();
            let total_ms: u128 = samples.iter().map(|s| s.latency.as_millis()).sum();
            (
                failures as f64 / count as f64,
                (total_ms / count as u128) as u64,
            )
        };
        DependencyMetrics {
            samples: count,
            error_rate,
            mean_latency_ms,
            status: self.classify(count, error_rate, mean_latency_ms),
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.metrics().status
    }

    fn classify(&self, samples: usize, error_rate: f64, latency_ms: u64) -> HealthStatus {
        let c = &self.config;
        if samples < c.min_samples {
            return HealthStatus::Healthy;
        }
        if error_rate >= c.critical_error_rate || latency_ms >= c.critical_latency_ms {
            HealthStatus::Critical
        } else if error_rate >= c.unhealthy_error_rate || latency_ms >= c.unhealthy_latency_ms {
            HealthStatus::Unhealthy
        } else if error_rate >= c.degraded_error_rate || latency_ms >= c.degraded_latency_ms {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Health derived from the job store's running count and recorded
/// dependency calls.
pub struct StoreHealthSource {
    store: Arc<dyn JobStore>,
    dependency: Arc<DependencyHealth>,
    max_concurrent_jobs: usize,
}

impl StoreHealthSource {
    pub fn new(
        store: Arc<dyn JobStore>,
        dependency: Arc<DependencyHealth>,
        max_concurrent_jobs: usize,
    ) -> Self {
        Self {
            store,
            dependency,
            max_concurrent_jobs,
        }
    }
}

#[async_trait]
impl HealthSource for StoreHealthSource {
    async fn snapshot(&self) -> Result<HealthSnapshot> {
        Ok(HealthSnapshot {
            status: self.dependency.status(),
            active_jobs: self.store.active_count().await,
            max_concurrent_jobs: self.max_concurrent_jobs,
        })
    }
}
