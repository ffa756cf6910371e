use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{ControlError, Result};
use crate::jobs::job::{validate_job_id, JobConfig, JobId, JobLimits, JobRecord, JobState};

/// Registry of job records.
///
/// Each record sits behind its own lock, so transitions on different jobs
/// never wait on each other. The index itself is sharded and only held long
/// enough to clone a record's `Arc`.
#[derive(Debug)]
pub struct JobStore {
    jobs: DashMap<JobId, Arc<Mutex<JobRecord>>>,
    next_seq: AtomicU64,
    /// Records held or reserved; bounded by `max_jobs`
    count: AtomicUsize,
    limits: JobLimits,
    max_jobs: usize,
}

impl JobStore {
    pub fn new(limits: JobLimits, max_jobs: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            next_seq: AtomicU64::new(0),
            count: AtomicUsize::new(0),
            limits,
            max_jobs,
        }
    }

    pub fn limits(&self) -> &JobLimits {
        &self.limits
    }

    /// Create a job with a server-generated id.
    pub fn create(&self, config: JobConfig) -> Result<JobRecord> {
        self.create_with_id(format!("job-{}", Uuid::new_v4().simple()), config)
    }

    /// Create a job under a caller-chosen id. Fails with `Conflict` if the id
    /// is taken.
    pub fn create_with_id(&self, id: JobId, config: JobConfig) -> Result<JobRecord> {
        validate_job_id(&id)?;
        config.validate(&self.limits)?;

        match self.jobs.entry(id.clone()) {
            Entry::Occupied(_) => Err(ControlError::Conflict(format!(
                "job {} already exists",
                id
            ))),
            Entry::Vacant(slot) => {
                self.count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < self.max_jobs).then_some(n + 1)
                    })
                    .map_err(|_| ControlError::AtCapacity(self.max_jobs))?;
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let record = JobRecord::new(id, config, seq);
                slot.insert(Arc::new(Mutex::new(record.clone())));
                tracing::debug!(job_id = %record.id, "Job record created");
                Ok(record)
            }
        }
    }

    fn slot(&self, id: &str) -> Result<Arc<Mutex<JobRecord>>> {
        self.jobs
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ControlError::NotFound(id.to_string()))
    }

    pub async fn get(&self, id: &str) -> Result<JobRecord> {
        let slot = self.slot(id)?;
        let record = slot.lock().await;
        Ok(record.clone())
    }

    /// Snapshot of every record in creation order.
    pub async fn list(&self) -> Vec<JobRecord> {
        let slots: Vec<Arc<Mutex<JobRecord>>> =
            self.jobs.iter().map(|entry| entry.value().clone()).collect();

        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            records.push(slot.lock().await.clone());
        }
        records.sort_by_key(|r| r.seq);
        records
    }

    /// Atomically move a job from `expected` to `next`.
    ///
    /// `mutator` runs under the job's lock before the state is written. The
    /// store stamps `started_at` on entry to `Running` and `completed_at` on
    /// entry to a terminal state; `error` only survives a move into `Failed`.
    pub async fn transition<F>(
        &self,
        id: &str,
        expected: JobState,
        next: JobState,
        mutator: F,
    ) -> Result<JobRecord>
    where
        F: FnOnce(&mut JobRecord),
    {
        let slot = self.slot(id)?;
        let mut record = slot.lock().await;

        if record.state != expected {
            return Err(ControlError::Conflict(format!(
                "job {} is {}, expected {}",
                id, record.state, expected
            )));
        }
        if !expected.can_transition_to(next) {
            return Err(ControlError::Conflict(format!(
                "job {} cannot move from {} to {}",
                id, expected, next
            )));
        }

        let previous_error = record.error.clone();
        mutator(&mut record);
        if next != JobState::Failed {
            record.error = previous_error;
        }

        let now = Utc::now().max(record.created_at);
        if next == JobState::Running && record.started_at.is_none() {
            record.started_at = Some(now);
        }
        if next.is_terminal() {
            if record.completed_at.is_none() {
                let floor = record.started_at.unwrap_or(record.created_at);
                record.completed_at = Some(now.max(floor));
            }
            record.deadline = None;
        }
        record.state = next;

        tracing::debug!(job_id = %id, from = %expected, to = %next, "Job transitioned");
        Ok(record.clone())
    }

    /// Drop terminal records that finished more than `retention` ago.
    /// Records currently locked by a writer are kept for the next sweep.
    pub fn prune_finished(&self, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut removed = 0;
        self.jobs.retain(|_, slot| {
            let expired = slot.try_lock().is_ok_and(|record| {
                record.state.is_terminal() && record.completed_at.is_some_and(|at| at < cutoff)
            });
            if expired {
                removed += 1;
            }
            !expired
        });
        self.count.fetch_sub(removed, Ordering::AcqRel);
        removed
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
