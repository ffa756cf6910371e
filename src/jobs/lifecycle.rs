//! Job lifecycle state machine.
//!
//! ```text
//! Pending --admit--> Provisioning --capacity_ready--> Running --ok--> Completed
//!    |                    |                              |
//!    +--cancel----------->+--cancel/timeout------------->+--err/timeout--> Failed
//! ```
//!
//! The manager decides when a job stops needing capacity. That decision is
//! immediate: a job leaving `Provisioning`/`Running` drops out of the next
//! reconcile tick's desired size, whatever the pool is physically doing.
//! Provisioning has its own deadline, so a stalled reconciler or substrate
//! turns into job failures rather than jobs waiting forever.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashSet;
use futures::future::join_all;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cluster::{
    bounded, ClusterAdapter, ClusterError, WorkloadHandle, WorkloadSpec, WorkloadStatus,
};
use crate::config::{LifecycleConfig, WorkloadConfig};
use crate::error::{ControlError, Result};
use crate::jobs::job::{JobConfig, JobId, JobRecord, JobState};
use crate::jobs::store::JobStore;

pub const PROVISIONING_TIMED_OUT: &str = "capacity provisioning timed out";
pub const DURATION_EXCEEDED: &str = "job exceeded declared duration";
pub const CAPACITY_LOST: &str = "capacity lost during execution";

const MAX_CANCEL_ATTEMPTS: usize = 8;
const MAX_WORKLOAD_NAME_LEN: usize = 63;
const WORKLOAD_SUFFIX_LEN: usize = 8;

/// Outcome of one supervision pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SuperviseReport {
    /// Jobs that changed state during the pass, with their new state
    pub transitions: Vec<(JobId, JobState)>,
    /// Orphaned workloads deleted from the substrate
    pub reaped: usize,
    /// Finished records dropped from the store
    pub pruned: usize,
}

pub struct LifecycleManager {
    store: Arc<JobStore>,
    cluster: Arc<dyn ClusterAdapter>,
    config: LifecycleConfig,
    workload: WorkloadConfig,
    /// Wakes the reconciler whenever a job's capacity need changes
    wake: Arc<Notify>,
    dispatching: DashSet<JobId>,
    /// Running jobs whose workload is being deleted by `cancel`
    cancelling: DashSet<JobId>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<JobStore>,
        cluster: Arc<dyn ClusterAdapter>,
        config: LifecycleConfig,
        workload: WorkloadConfig,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            cluster,
            config,
            workload,
            wake,
            dispatching: DashSet::new(),
            cancelling: DashSet::new(),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Record a new job and admit it. Returns the record as created, in
    /// `Pending`; admission never waits for capacity.
    pub async fn submit(&self, config: JobConfig, job_id: Option<JobId>) -> Result<JobRecord> {
        let record = match job_id {
            Some(id) => self.store.create_with_id(id, config)?,
            None => self.store.create(config)?,
        };

        tracing::info!(
            job_id = %record.id,
            node_count = record.config.node_count,
            duration = record.config.duration,
            task_type = %record.config.task_type,
            "Job submitted"
        );

        if let Err(e) = self.admit(&record.id).await {
            // A cancel got there first
            tracing::debug!(job_id = %record.id, error = %e, "Admission skipped");
        }
        Ok(record)
    }

    /// `Pending -> Provisioning`. Starts the provisioning deadline.
    pub async fn admit(&self, id: &str) -> Result<JobRecord> {
        let deadline = Instant::now() + self.config.provisioning_timeout;
        let record = self
            .store
            .transition(id, JobState::Pending, JobState::Provisioning, |r| {
                r.deadline = Some(deadline)
            })
            .await?;

        tracing::info!(
            job_id = %id,
            node_count = record.config.node_count,
            "Job admitted, waiting for capacity"
        );
        self.wake.notify_one();
        Ok(record)
    }

    /// Cancel a job. Cancelling a finished job is a no-op that returns it
    /// unchanged. A running job's workload is deleted before the job is
    /// marked `Cancelled`.
    pub async fn cancel(&self, id: &str) -> Result<JobRecord> {
        for _ in 0..MAX_CANCEL_ATTEMPTS {
            let record = self.store.get(id).await?;
            let result = match record.state {
                JobState::Completed | JobState::Failed | JobState::Cancelled => {
                    return Ok(record);
                }
                JobState::Pending | JobState::Provisioning => {
                    self.store
                        .transition(id, record.state, JobState::Cancelled, |_| {})
                        .await
                }
                JobState::Running => {
                    self.cancelling.insert(id.to_string());
                    let result = self.cancel_running(&record).await;
                    self.cancelling.remove(id);
                    result
                }
            };

            match result {
                Ok(record) => {
                    tracing::info!(job_id = %id, "Job cancelled");
                    self.wake.notify_one();
                    return Ok(record);
                }
                // State moved underneath us, look again
                Err(ControlError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(ControlError::Conflict(format!(
            "job {} kept changing state while being cancelled",
            id
        )))
    }

    async fn cancel_running(&self, record: &JobRecord) -> Result<JobRecord> {
        if let Some(handle) = &record.workload {
            self.delete_workload(&record.id, handle).await?;
        }
        self.store
            .transition(&record.id, JobState::Running, JobState::Cancelled, |_| {})
            .await
    }

    /// Capacity for the job is available: dispatch its workload and move it
    /// to `Running`.
    ///
    /// A transient dispatch failure leaves the job in `Provisioning` for the
    /// next signal; a permanent one fails it.
    pub async fn capacity_ready(&self, id: &str) -> Result<JobRecord> {
        if !self.dispatching.insert(id.to_string()) {
            return Err(ControlError::Conflict(format!(
                "dispatch of job {} already in progress",
                id
            )));
        }
        let result = self.dispatch(id).await;
        self.dispatching.remove(id);
        result
    }

    async fn dispatch(&self, id: &str) -> Result<JobRecord> {
        let record = self.store.get(id).await?;
        if record.state != JobState::Provisioning {
            return Err(ControlError::Conflict(format!(
                "job {} is {}, not waiting for capacity",
                id, record.state
            )));
        }

        let spec = self.workload_spec(&record);
        let created = bounded(
            self.config.call_timeout,
            "create_workload",
            self.cluster.create_workload(&spec),
        )
        .await;

        let handle = match created {
            Ok(handle) => handle,
            Err(ClusterError::Transient(msg)) => {
                tracing::warn!(job_id = %id, error = %msg, "Workload dispatch failed, will retry");
                return Err(ControlError::Transient(msg));
            }
            Err(ClusterError::Permanent(msg)) => {
                tracing::error!(job_id = %id, error = %msg, "Workload rejected by substrate");
                return self
                    .fail(id, JobState::Provisioning, format!("workload dispatch failed: {}", msg))
                    .await;
            }
        };

        let deadline = Instant::now() + record.config.duration();
        let workload = handle.clone();
        let transitioned = self
            .store
            .transition(id, JobState::Provisioning, JobState::Running, move |r| {
                r.workload = Some(workload);
                r.deadline = Some(deadline);
            })
            .await;

        match transitioned {
            Ok(record) => {
                tracing::info!(job_id = %id, workload = %handle, "Job running");
                Ok(record)
            }
            Err(e) => {
                // Cancelled or timed out while the workload was being created
                if let Err(del) = self.delete_workload(id, &handle).await {
                    tracing::warn!(job_id = %id, error = %del, "Failed to remove stray workload");
                }
                Err(e)
            }
        }
    }

    /// The pool shrank below what a running job needs.
    pub async fn capacity_lost(&self, id: &str) -> Result<JobRecord> {
        let record = self.store.get(id).await?;
        if record.state != JobState::Running {
            return Err(ControlError::Conflict(format!(
                "job {} is {}, not running",
                id, record.state
            )));
        }
        if let Some(handle) = &record.workload {
            if let Err(e) = self.delete_workload(id, handle).await {
                tracing::warn!(job_id = %id, error = %e, "Failed to remove workload after capacity loss");
            }
        }
        self.fail(id, JobState::Running, CAPACITY_LOST).await
    }

    /// One pass over every live job: admit stragglers, enforce deadlines,
    /// poll running workloads. Jobs are checked concurrently.
    pub async fn supervise(&self) -> SuperviseReport {
        let now = Instant::now();
        let jobs = self.store.list().await;

        let checks = jobs
            .iter()
            .filter(|r| !r.state.is_terminal())
            .map(|r| self.supervise_job(r, now));
        let transitions: Vec<(JobId, JobState)> =
            join_all(checks).await.into_iter().flatten().collect();

        let reaped = self.reap_orphans().await;
        let retention = chrono::Duration::from_std(self.config.job_retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let pruned = self.store.prune_finished(retention);

        if !transitions.is_empty() || reaped > 0 || pruned > 0 {
            tracing::debug!(
                transitions = transitions.len(),
                reaped,
                pruned,
                "Supervision pass finished"
            );
        }

        SuperviseReport {
            transitions,
            reaped,
            pruned,
        }
    }

    async fn supervise_job(&self, record: &JobRecord, now: Instant) -> Option<(JobId, JobState)> {
        let result = match record.state {
            JobState::Pending => self.admit(&record.id).await,
            JobState::Provisioning if record.deadline_passed(now) => {
                tracing::warn!(job_id = %record.id, "Provisioning deadline passed");
                self.fail(&record.id, JobState::Provisioning, PROVISIONING_TIMED_OUT)
                    .await
            }
            JobState::Running => self.check_running(record, now).await?,
            _ => return None,
        };

        match result {
            Ok(updated) => Some((updated.id, updated.state)),
            Err(ControlError::Conflict(reason)) => {
                tracing::debug!(job_id = %record.id, reason = %reason, "Job changed during supervision");
                None
            }
            Err(e) => {
                tracing::warn!(job_id = %record.id, error = %e, "Supervision step failed");
                None
            }
        }
    }

    /// `None` when the job keeps running.
    async fn check_running(&self, record: &JobRecord, now: Instant) -> Option<Result<JobRecord>> {
        let id = &record.id;
        let Some(handle) = record.workload.clone() else {
            return Some(
                self.fail(id, JobState::Running, "running job has no workload")
                    .await,
            );
        };

        let status = bounded(
            self.config.call_timeout,
            "get_workload_status",
            self.cluster.get_workload_status(&handle),
        )
        .await;

        match status {
            Ok(WorkloadStatus::Succeeded) => {
                let result = self.complete(id).await;
                self.cleanup_workload(id, &handle).await;
                return Some(result);
            }
            Ok(WorkloadStatus::Failed(msg)) => {
                let result = self.fail(id, JobState::Running, msg).await;
                self.cleanup_workload(id, &handle).await;
                return Some(result);
            }
            Ok(WorkloadStatus::Pending | WorkloadStatus::Running) => {}
            Err(ClusterError::Transient(msg)) => {
                tracing::warn!(job_id = %id, error = %msg, "Workload status unavailable");
            }
            // The workload is gone because the job is being cancelled
            Err(ClusterError::Permanent(_)) if self.cancelling.contains(id.as_str()) => {
                return None;
            }
            Err(ClusterError::Permanent(msg)) => {
                return Some(
                    self.fail(id, JobState::Running, format!("workload lost: {}", msg))
                        .await,
                );
            }
        }

        if record.deadline_passed(now) {
            tracing::warn!(job_id = %id, workload = %handle, "Declared duration exceeded, terminating workload");
            if let Err(e) = self.delete_workload(id, &handle).await {
                tracing::warn!(job_id = %id, error = %e, "Force termination failed, orphan sweep will retry");
            }
            return Some(self.fail(id, JobState::Running, DURATION_EXCEEDED).await);
        }
        None
    }

    /// Delete workloads whose job is finished, unknown, or running a
    /// different workload. Workloads are listed before the job snapshot is
    /// taken so a freshly dispatched workload always finds its job.
    async fn reap_orphans(&self) -> usize {
        let workloads = match bounded(
            self.config.call_timeout,
            "list_workloads",
            self.cluster.list_workloads(),
        )
        .await
        {
            Ok(workloads) => workloads,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping orphan sweep");
                return 0;
            }
        };
        if workloads.is_empty() {
            return 0;
        }

        let jobs: HashMap<JobId, JobRecord> = self
            .store
            .list()
            .await
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let mut reaped = 0;
        for workload in workloads {
            let orphaned = match jobs.get(&workload.job_id) {
                None => true,
                Some(job) => match job.state {
                    JobState::Running => job.workload.as_ref() != Some(&workload.handle),
                    state => state.is_terminal(),
                },
            };
            if !orphaned {
                continue;
            }
            match self.delete_workload(&workload.job_id, &workload.handle).await {
                Ok(()) => {
                    tracing::info!(job_id = %workload.job_id, workload = %workload.handle, "Reaped orphaned workload");
                    reaped += 1;
                }
                Err(e) => {
                    tracing::warn!(job_id = %workload.job_id, error = %e, "Failed to reap workload");
                }
            }
        }
        reaped
    }

    async fn complete(&self, id: &str) -> Result<JobRecord> {
        let record = self
            .store
            .transition(id, JobState::Running, JobState::Completed, |_| {})
            .await?;
        tracing::info!(job_id = %id, "Job completed");
        self.wake.notify_one();
        Ok(record)
    }

    async fn fail(&self, id: &str, from: JobState, message: impl Into<String>) -> Result<JobRecord> {
        let message = message.into();
        let error = message.clone();
        let record = self
            .store
            .transition(id, from, JobState::Failed, move |r| r.error = Some(error))
            .await?;
        tracing::warn!(job_id = %id, error = %message, "Job failed");
        self.wake.notify_one();
        Ok(record)
    }

    async fn delete_workload(&self, id: &str, handle: &WorkloadHandle) -> Result<()> {
        bounded(
            self.config.call_timeout,
            "delete_workload",
            self.cluster.delete_workload(handle),
        )
        .await
        .map_err(|e| {
            tracing::warn!(job_id = %id, workload = %handle, error = %e, "Workload deletion failed");
            ControlError::from(e)
        })
    }

    /// Finished workloads are removed eagerly; the orphan sweep catches
    /// anything this misses.
    async fn cleanup_workload(&self, id: &str, handle: &WorkloadHandle) {
        let _ = self.delete_workload(id, handle).await;
    }

    fn workload_spec(&self, record: &JobRecord) -> WorkloadSpec {
        let config = &record.config;
        WorkloadSpec {
            name: workload_name(&record.id),
            namespace: self.workload.namespace.clone(),
            job_id: record.id.clone(),
            image: self.workload.image.clone(),
            command: self.workload.command.clone(),
            env: vec![
                ("JOB_ID".to_string(), record.id.clone()),
                ("TASK_TYPE".to_string(), config.task_type.to_string()),
                ("NODE_COUNT".to_string(), config.node_count.to_string()),
                ("DURATION_SECONDS".to_string(), config.duration.to_string()),
            ],
            node_count: config.node_count,
            active_deadline: config.duration(),
        }
    }

    /// Periodic supervision until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.supervise_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Job supervisor stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.supervise().await;
                }
            }
        }
    }
}

/// Workload names must be DNS labels. Ids that sanitize to the same label
/// still get distinct names from the random suffix.
fn workload_name(job_id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    let suffix = &suffix[..WORKLOAD_SUFFIX_LEN];
    let mut stem: String = format!("gpujob-{}", job_id)
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();
    stem.truncate(MAX_WORKLOAD_NAME_LEN - WORKLOAD_SUFFIX_LEN - 1);
    format!("{}-{}", stem.trim_end_matches('-'), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_dns_label(name: &str) -> bool {
        name.len() <= MAX_WORKLOAD_NAME_LEN
            && !name.ends_with('-')
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    }

    #[test]
    fn workload_names_are_dns_labels() {
        assert!(workload_name("train-1").starts_with("gpujob-train-1-"));
        assert!(workload_name("Job_17.v2").starts_with("gpujob-job-17-v2-"));

        for id in ["x_", "Job_17.v2", &"a".repeat(63), &"b-".repeat(40)] {
            let name = workload_name(id);
            assert!(is_dns_label(&name), "{}", name);
        }
        assert_eq!(workload_name(&"a".repeat(63)).len(), MAX_WORKLOAD_NAME_LEN);
    }

    #[test]
    fn colliding_ids_get_distinct_names() {
        assert_ne!(workload_name("Job_1"), workload_name("job-1"));
        assert_ne!(workload_name("a.b"), workload_name("a_b"));

        let prefix = "p".repeat(60);
        let a = workload_name(&format!("{}-first", prefix));
        let b = workload_name(&format!("{}-second", prefix));
        assert_ne!(a, b);
    }
}
