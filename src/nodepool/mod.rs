//! Node-pool autoscaling.
//!
//! The pool's desired size is never tracked incrementally. Every tick takes a
//! fresh snapshot of the job store and recomputes it, so a missed wake-up or
//! a crashed tick cannot leave stale demand behind.

pub mod reconciler;

pub use reconciler::{Reconciler, TickReport};

use crate::jobs::JobRecord;

/// Largest `node_count` among jobs that currently need capacity, or 0.
pub fn desired_from_jobs(jobs: &[JobRecord]) -> u32 {
    jobs.iter()
        .filter(|job| job.state.needs_capacity())
        .map(|job| job.config.node_count)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobConfig, JobState, TaskType};

    fn job(seq: u64, node_count: u32, state: JobState) -> JobRecord {
        let mut record = JobRecord::new(
            format!("job-{}", seq),
            JobConfig::new(300, node_count, TaskType::Training),
            seq,
        );
        record.state = state;
        record
    }

    #[test]
    fn no_jobs_means_zero() {
        assert_eq!(desired_from_jobs(&[]), 0);
    }

    #[test]
    fn only_active_jobs_count() {
        let jobs = vec![
            job(0, 8, JobState::Pending),
            job(1, 2, JobState::Provisioning),
            job(2, 3, JobState::Running),
            job(3, 9, JobState::Completed),
            job(4, 9, JobState::Failed),
            job(5, 9, JobState::Cancelled),
        ];
        assert_eq!(desired_from_jobs(&jobs), 3);
    }

    #[test]
    fn all_terminal_drives_to_zero() {
        let jobs = vec![job(0, 4, JobState::Completed), job(1, 2, JobState::Cancelled)];
        assert_eq!(desired_from_jobs(&jobs), 0);
    }
}
