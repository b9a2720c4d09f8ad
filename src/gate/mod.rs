//! Advisory admission control.
//!
//! [`ConcurrencyGate`] answers "may another job start now?" from the number
//! of running jobs and the health of the external dependency. It is not a
//! lock: two concurrent checks may both be admitted.

pub mod health;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::clock::Clock;

pub use health::{
    DependencyHealth, DependencyMetrics, HealthSnapshot, HealthSource, HealthStatus,
    StoreHealthSource,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    AtCapacity { active: usize, max: usize },
    Unhealthy { status: HealthStatus },
    CoolingDown { until: DateTime<Utc> },
    HealthUnavailable { message: String },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::AtCapacity { active, max } => {
                write!(f, "{} of {} job slots in use", active, max)
            }
            RejectReason::Unhealthy { status } => write!(f, "dependency is {}", status),
            RejectReason::CoolingDown { until } => write!(f, "cooling down until {}", until),
            RejectReason::HealthUnavailable { message } => {
                write!(f, "health unavailable: {}", message)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Admission {
    Admitted { delay_multiplier: f64 },
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

pub struct ConcurrencyGate {
    source: Arc<dyn HealthSource>,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
    cooldown_until: Mutex<Option<DateTime<Utc>>>,
}

impl ConcurrencyGate {
    pub fn new(source: Arc<dyn HealthSource>, clock: Arc<dyn Clock>, cooldown: Duration) -> Self {
        Self {
            source,
            clock,
            cooldown,
            cooldown_until: Mutex::new(None),
        }
    }

    /// Decide whether a new job may start.
    ///
    /// Rejects while a cooldown is open, when the dependency is unhealthy or
    /// critical (which also opens a new cooldown), and whenever the running
    /// count has reached the maximum regardless of health.
    pub async fn check_can_start_job(&self) -> Admission {
        let now = self.clock.now();
        if let Some(until) = self.cooldown_until() {
            if until > now {
                return Admission::Rejected(RejectReason::CoolingDown { until });
            }
        }

        let snapshot = match self.source.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "Health source unavailable, refusing admission");
                return Admission::Rejected(RejectReason::HealthUnavailable {
                    message: e.to_string(),
                });
            }
        };

        if snapshot.active_jobs >= snapshot.max_concurrent_jobs {
            return Admission::Rejected(RejectReason::AtCapacity {
                active: snapshot.active_jobs,
                max: snapshot.max_concurrent_jobs,
            });
        }

        if !snapshot.status.admits() {
            let until = now + self.cooldown;
            *self.cooldown_until.lock().unwrap_or_else(|e| e.into_inner()) = Some(until);
            tracing::warn!(status = %snapshot.status, until = %until, "Dependency unhealthy, admissions paused");
            return Admission::Rejected(RejectReason::Unhealthy {
                status: snapshot.status,
            });
        }

        Admission::Admitted {
            delay_multiplier: snapshot.status.delay_multiplier(),
        }
    }

    pub async fn can_start_job(&self) -> bool {
        self.check_can_start_job().await.is_admitted()
    }

    pub async fn snapshot(&self) -> crate::error::Result<HealthSnapshot> {
        self.source.snapshot().await
    }

    pub fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        *self.cooldown_until.lock().unwrap_or_else(|e| e.into_inner())
    }
}
