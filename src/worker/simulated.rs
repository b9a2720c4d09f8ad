use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::job::{Checkpoint, Job};
use crate::worker::processor::{Unit, UnitError, UnitProcessor};

/// Stand-in for a remote annotation API.
///
/// `Offset` jobs take their size from `total_units` or `params.units`;
/// `Nested` jobs from `params.groups`, a list of group sizes (for example
/// word counts per song). Each unit sleeps for the configured latency and
/// fails with the configured probability.
#[derive(Debug, Clone)]
pub struct SimulatedProcessor {
    latency: Duration,
    failure_rate: f64,
}

impl SimulatedProcessor {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    fn groups(job: &Job) -> Vec<u64> {
        job.params
            .get("groups")
            .and_then(|g| g.as_array())
            .map(|g| g.iter().filter_map(|n| n.as_u64()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl UnitProcessor for SimulatedProcessor {
    async fn total_units(&self, job: &Job) -> Result<u64, UnitError> {
        match job.checkpoint {
            Checkpoint::Offset { .. } => job
                .params
                .get("units")
                .and_then(|u| u.as_u64())
                .ok_or_else(|| UnitError::Fatal("params.units is required".to_string())),
            Checkpoint::Nested { .. } => Ok(Self::groups(job).iter().sum()),
        }
    }

    fn next_unit(&self, job: &Job, from: &Checkpoint) -> Option<Unit> {
        match *from {
            Checkpoint::Offset { index } => {
                let total = job.total_units?;
                (index < total).then(|| Unit {
                    at: *from,
                    next: Checkpoint::offset(index + 1),
                })
            }
            Checkpoint::Nested { outer, inner } => {
                let groups = Self::groups(job);
                let (mut outer, mut inner) = (outer as usize, inner);
                // Skip exhausted and empty groups.
                while outer < groups.len() && inner >= groups[outer] {
                    outer += 1;
                    inner = 0;
                }
                if outer >= groups.len() {
                    return None;
                }
                let next = if inner + 1 < groups[outer] {
                    Checkpoint::nested(outer as u64, inner + 1)
                } else {
                    Checkpoint::nested(outer as u64 + 1, 0)
                };
                Some(Unit {
                    at: Checkpoint::nested(outer as u64, inner),
                    next,
                })
            }
        }
    }

    fn within_bounds(&self, job: &Job, at: &Checkpoint) -> bool {
        match *at {
            Checkpoint::Offset { index } => job.total_units.map_or(true, |total| index <= total),
            Checkpoint::Nested { outer, inner } => {
                let groups = Self::groups(job);
                match groups.get(outer as usize) {
                    Some(size) => inner <= *size,
                    None => outer as usize == groups.len() && inner == 0,
                }
            }
        }
    }

    async fn process_unit(&self, _job: &Job, at: &Checkpoint) -> Result<(), UnitError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let fail = rand::thread_rng().gen_bool(self.failure_rate);
        if fail {
            return Err(UnitError::Skippable(format!("simulated failure at {}", at)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CheckpointShape, JobSpec};
    use chrono::Utc;
    use serde_json::json;

    fn nested_job(groups: serde_json::Value) -> Job {
        let mut job = Job::new(
            JobSpec::new("enrich")
                .with_shape(CheckpointShape::Nested)
                .with_params(json!({ "groups": groups })),
            Utc::now(),
        );
        job.total_units = Some(10);
        job
    }

    #[test]
    fn nested_walk_skips_empty_groups() {
        let processor = SimulatedProcessor::new(Duration::ZERO, 0.0);
        let job = nested_job(json!([2, 0, 1]));

        let mut at = Checkpoint::nested(0, 0);
        let mut visited = Vec::new();
        while let Some(unit) = processor.next_unit(&job, &at) {
            visited.push(unit.at);
            at = unit.next;
        }

        assert_eq!(
            visited,
            vec![
                Checkpoint::nested(0, 0),
                Checkpoint::nested(0, 1),
                Checkpoint::nested(2, 0)
            ]
        );
        assert_eq!(at, Checkpoint::nested(3, 0));
    }

    #[test]
    fn nested_bounds_follow_group_sizes() {
        let processor = SimulatedProcessor::new(Duration::ZERO, 0.0);
        let job = nested_job(json!([2, 0, 1]));

        assert!(processor.within_bounds(&job, &Checkpoint::nested(0, 2)));
        assert!(processor.within_bounds(&job, &Checkpoint::nested(3, 0)));
        assert!(!processor.within_bounds(&job, &Checkpoint::nested(0, 3)));
        assert!(!processor.within_bounds(&job, &Checkpoint::nested(3, 1)));
        assert!(!processor.within_bounds(&job, &Checkpoint::nested(7, 0)));
    }

    #[tokio::test]
    async fn nested_total_is_group_sum() {
        let processor = SimulatedProcessor::new(Duration::ZERO, 0.0);
        let job = nested_job(json!([3, 4, 0, 2]));
        assert_eq!(processor.total_units(&job).await, Ok(9));
    }

    #[tokio::test]
    async fn offset_total_requires_units_param() {
        let processor = SimulatedProcessor::new(Duration::ZERO, 0.0);
        let job = Job::new(JobSpec::new("annotate"), Utc::now());
        assert!(matches!(
            processor.total_units(&job).await,
            Err(UnitError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn certain_failure_is_skippable() {
        let processor = SimulatedProcessor::new(Duration::ZERO, 1.0);
        let job = Job::new(JobSpec::new("annotate").with_total(1), Utc::now());
        let result = processor.process_unit(&job, &Checkpoint::offset(0)).await;
        assert!(matches!(result, Err(UnitError::Skippable(_))));
    }
}
