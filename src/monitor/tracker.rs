use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{RelayError, Result};

/// Outcome counters for automatic resumes within one day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeStats {
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
}

/// Per-job automatic resume attempts for a single UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptLedger {
    pub day: NaiveDate,
    pub attempts: HashMap<Uuid, u32>,
    pub stats: ResumeStats,
}

impl AttemptLedger {
    pub fn empty(day: NaiveDate) -> Self {
        Self {
            day,
            attempts: HashMap::new(),
            stats: ResumeStats::default(),
        }
    }
}

/// Persistence for the attempt ledger, so a restart within the same day
/// keeps the exhaustion guard.
pub trait AttemptStorage: Send + Sync {
    fn load(&self) -> Result<Option<AttemptLedger>>;
    fn save(&self, ledger: &AttemptLedger) -> Result<()>;
}

/// Ledger kept in memory only. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryAttemptStorage {
    slot: Arc<Mutex<Option<AttemptLedger>>>,
}

impl MemoryAttemptStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttemptStorage for MemoryAttemptStorage {
    fn load(&self) -> Result<Option<AttemptLedger>> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, ledger: &AttemptLedger) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(ledger.clone());
        Ok(())
    }
}

/// Ledger stored as a JSON file. Writes go through a temporary file and a
/// rename.
#[derive(Debug, Clone)]
pub struct FileAttemptStorage {
    path: PathBuf,
}

impl FileAttemptStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AttemptStorage for FileAttemptStorage {
    fn load(&self) -> Result<Option<AttemptLedger>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&data).map(Some).map_err(|e| {
            RelayError::Ledger(format!("{}: {}", self.path.display(), e))
        })
    }

    fn save(&self, ledger: &AttemptLedger) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(ledger)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Bounds automatic resumption to `max_attempts` per job per UTC day.
pub struct ResumeTracker {
    clock: Arc<dyn Clock>,
    storage: Box<dyn AttemptStorage>,
    max_attempts: u32,
    ledger: AttemptLedger,
}

impl ResumeTracker {
    /// Load today's ledger from `storage`. A ledger from another day, or an
    /// unreadable one, starts fresh.
    pub fn new(clock: Arc<dyn Clock>, storage: Box<dyn AttemptStorage>, max_attempts: u32) -> Self {
        let today = clock.now().date_naive();
        let ledger = match storage.load() {
            Ok(Some(ledger)) if ledger.day == today => ledger,
            Ok(_) => AttemptLedger::empty(today),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load resume ledger, starting empty");
                AttemptLedger::empty(today)
            }
        };
        Self {
            clock,
            storage,
            max_attempts,
            ledger,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn attempts(&mut self, job_id: &Uuid) -> u32 {
        self.roll_day();
        self.ledger.attempts.get(job_id).copied().unwrap_or(0)
    }

    pub fn can_attempt(&mut self, job_id: &Uuid) -> bool {
        self.attempts(job_id) < self.max_attempts
    }

    /// Take one of `job_id`'s automatic attempts before the resume call is
    /// made. The in-memory count is kept even when persisting fails.
    pub fn reserve(&mut self, job_id: Uuid) -> Result<u32> {
        self.roll_day();
        let count = self.ledger.attempts.entry(job_id).or_insert(0);
        *count += 1;
        let count = *count;
        self.ledger.stats.attempts += 1;
        self.storage.save(&self.ledger)?;
        Ok(count)
    }

    /// Record how a reserved attempt ended.
    pub fn record_outcome(&mut self, success: bool) -> Result<()> {
        self.roll_day();
        if success {
            self.ledger.stats.successes += 1;
        } else {
            self.ledger.stats.failures += 1;
        }
        self.storage.save(&self.ledger)
    }

    /// Reserve an attempt and record its outcome in one step.
    pub fn record_attempt(&mut self, job_id: Uuid, success: bool) -> Result<u32> {
        let count = self.reserve(job_id)?;
        self.record_outcome(success)?;
        Ok(count)
    }

    /// Clear the guard for `job_id`, e.g. after a manual resume.
    pub fn reset(&mut self, job_id: &Uuid) -> Result<()> {
        self.roll_day();
        if self.ledger.attempts.remove(job_id).is_some() {
            self.storage.save(&self.ledger)?;
        }
        Ok(())
    }

    pub fn stats(&mut self) -> ResumeStats {
        self.roll_day();
        self.ledger.stats
    }

    fn roll_day(&mut self) {
        let today = self.clock.now().date_naive();
        if self.ledger.day != today {
            tracing::debug!(previous = %self.ledger.day, today = %today, "Resume ledger rolled over");
            self.ledger = AttemptLedger::empty(today);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone, Utc};

    fn morning() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap())
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let clock = morning();
        let mut tracker =
            ResumeTracker::new(Arc::new(clock), Box::new(MemoryAttemptStorage::new()), 3);
        let id = Uuid::new_v4();

        for expected in 1..=3 {
            assert!(tracker.can_attempt(&id));
            assert_eq!(tracker.record_attempt(id, false).unwrap(), expected);
        }
        assert!(!tracker.can_attempt(&id));
        assert_eq!(
            tracker.stats(),
            ResumeStats {
                attempts: 3,
                successes: 0,
                failures: 3
            }
        );
    }

    #[test]
    fn new_day_clears_attempts() {
        let clock = morning();
        let mut tracker = ResumeTracker::new(
            Arc::new(clock.clone()),
            Box::new(MemoryAttemptStorage::new()),
            1,
        );
        let id = Uuid::new_v4();
        tracker.record_attempt(id, true).unwrap();
        assert!(!tracker.can_attempt(&id));

        clock.advance(Duration::hours(16));

        assert!(tracker.can_attempt(&id));
        assert_eq!(tracker.stats(), ResumeStats::default());
    }

    #[test]
    fn reload_same_day_keeps_guard() {
        let clock = morning();
        let storage = MemoryAttemptStorage::new();
        let id = Uuid::new_v4();

        let mut tracker =
            ResumeTracker::new(Arc::new(clock.clone()), Box::new(storage.clone()), 2);
        tracker.record_attempt(id, false).unwrap();
        tracker.record_attempt(id, true).unwrap();
        drop(tracker);

        let mut reloaded = ResumeTracker::new(Arc::new(clock), Box::new(storage), 2);
        assert_eq!(reloaded.attempts(&id), 2);
        assert!(!reloaded.can_attempt(&id));
    }

    #[test]
    fn reload_on_later_day_starts_fresh() {
        let clock = morning();
        let storage = MemoryAttemptStorage::new();
        let id = Uuid::new_v4();

        let mut tracker =
            ResumeTracker::new(Arc::new(clock.clone()), Box::new(storage.clone()), 2);
        tracker.record_attempt(id, false).unwrap();

        clock.advance(Duration::days(1));
        let mut reloaded = ResumeTracker::new(Arc::new(clock), Box::new(storage), 2);
        assert_eq!(reloaded.attempts(&id), 0);
    }

    #[test]
    fn reserved_attempt_counts_before_outcome() {
        let clock = morning();
        let mut tracker =
            ResumeTracker::new(Arc::new(clock), Box::new(MemoryAttemptStorage::new()), 1);
        let id = Uuid::new_v4();

        assert_eq!(tracker.reserve(id).unwrap(), 1);
        assert!(!tracker.can_attempt(&id));
        assert_eq!(tracker.stats().attempts, 1);
        assert_eq!(tracker.stats().failures, 0);

        tracker.record_outcome(false).unwrap();
        assert_eq!(
            tracker.stats(),
            ResumeStats {
                attempts: 1,
                successes: 0,
                failures: 1
            }
        );
    }

    #[test]
    fn reset_clears_one_job() {
        let clock = morning();
        let mut tracker =
            ResumeTracker::new(Arc::new(clock), Box::new(MemoryAttemptStorage::new()), 1);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.record_attempt(a, false).unwrap();
        tracker.record_attempt(b, false).unwrap();

        tracker.reset(&a).unwrap();

        assert!(tracker.can_attempt(&a));
        assert!(!tracker.can_attempt(&b));
    }
}
