use std::sync::{Arc, Mutex as SyncMutex};

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cluster::{bounded, ClusterAdapter, ResizeOutcome};
use crate::config::ReconcilerConfig;
use crate::error::{ControlError, Result};
use crate::jobs::{JobId, JobRecord, JobState, JobStore, LifecycleManager};
use crate::nodepool::desired_from_jobs;
use crate::retry::Backoff;

/// A manual scale-up, honored until it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManualOverride {
    pub count: u32,
    pub expires_at: Instant,
}

/// What one reconcile tick observed and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Target size after folding in the manual override
    pub desired: u32,
    /// Target size from jobs alone
    pub job_desired: u32,
    /// Ready nodes, if the pool could be read
    pub actual: Option<u32>,
    /// Size passed to an accepted resize request
    pub resize_requested: Option<u32>,
    /// Provisioning jobs whose workload dispatch was started this tick
    pub signalled_jobs: Vec<JobId>,
    /// Running jobs failed because the pool shrank under them
    pub lost_jobs: Vec<JobId>,
    pub error: Option<String>,
}

/// Backoff for failed resizes, tied to the size that failed.
#[derive(Debug)]
struct ResizeState {
    backoff: Backoff,
    failed_target: Option<u32>,
}

impl ResizeState {
    /// A different target starts with a clean slate, so a failed scale-up
    /// never holds back the scale-down that follows it.
    fn ready_for(&mut self, target: u32, now: Instant) -> bool {
        if self.failed_target.is_some_and(|failed| failed != target) {
            self.clear();
        }
        self.backoff.ready(now)
    }

    fn clear(&mut self) {
        self.backoff.reset();
        self.failed_target = None;
    }
}

#[derive(Debug, Default)]
struct LoopHealth {
    last_success: Option<Instant>,
    last_report: Option<TickReport>,
}

/// Sole owner of node-pool resize decisions.
///
/// Each tick recomputes the desired size from a store snapshot, reads the
/// actual size from the substrate and issues at most one resize. A resize the
/// substrate reports as in flight is never reissued; failed requests back off
/// exponentially. Workload dispatch runs in spawned tasks, so a tick never
/// waits on a job.
pub struct Reconciler {
    store: Arc<JobStore>,
    cluster: Arc<dyn ClusterAdapter>,
    lifecycle: Arc<LifecycleManager>,
    config: ReconcilerConfig,
    max_nodes: u32,
    wake: Arc<Notify>,
    manual: Mutex<Option<ManualOverride>>,
    /// Held for the whole tick, so ticks never overlap
    resize: Mutex<ResizeState>,
    health: RwLock<LoopHealth>,
    dispatches: SyncMutex<Vec<JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<JobStore>,
        cluster: Arc<dyn ClusterAdapter>,
        lifecycle: Arc<LifecycleManager>,
        config: ReconcilerConfig,
        max_nodes: u32,
        wake: Arc<Notify>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff.clone());
        Self {
            store,
            cluster,
            lifecycle,
            config,
            max_nodes,
            wake,
            manual: Mutex::new(None),
            resize: Mutex::new(ResizeState {
                backoff,
                failed_target: None,
            }),
            health: RwLock::new(LoopHealth::default()),
            dispatches: SyncMutex::new(Vec::new()),
        }
    }

    pub async fn tick(&self) -> TickReport {
        let mut resize = self.resize.lock().await;
        let now = Instant::now();

        let mut jobs = self.store.list().await;
        let manual = self.active_override(now).await;
        let mut job_desired = desired_from_jobs(&jobs);
        let mut desired = job_desired.max(manual);

        let mut report = TickReport {
            desired,
            job_desired,
            ..Default::default()
        };

        let pool = match bounded(
            self.config.call_timeout,
            "get_nodepool",
            self.cluster.get_nodepool(),
        )
        .await
        {
            Ok(pool) => pool,
            Err(e) => {
                tracing::warn!(error = %e, desired, "Failed to read node pool, retrying next tick");
                report.error = Some(e.to_string());
                self.record(report.clone(), false).await;
                return report;
            }
        };

        let actual = pool.actual_count;
        let in_flight = pool.provisioning_state.is_in_flight();
        report.actual = Some(actual);

        if !in_flight {
            report.lost_jobs = self.fail_starved_jobs(&jobs, actual).await;
            if !report.lost_jobs.is_empty() {
                jobs = self.store.list().await;
                job_desired = desired_from_jobs(&jobs);
                desired = job_desired.max(manual);
                report.job_desired = job_desired;
                report.desired = desired;
            }
        }

        if actual == desired {
            resize.clear();
        } else if in_flight {
            tracing::debug!(
                actual,
                desired,
                state = %pool.provisioning_state,
                "Resize in flight, not reissuing"
            );
        } else if !resize.ready_for(desired, now) {
            tracing::debug!(
                actual,
                desired,
                failures = resize.backoff.failures(),
                "Resize deferred by backoff"
            );
        } else {
            let outcome = bounded(
                self.config.call_timeout,
                "set_nodepool_size",
                self.cluster.set_nodepool_size(desired),
            )
            .await;

            match outcome {
                Ok(ResizeOutcome::Accepted) => {
                    tracing::info!(
                        pool = %pool.name,
                        from = actual,
                        to = desired,
                        "Node pool resize requested"
                    );
                    resize.clear();
                    report.resize_requested = Some(desired);
                }
                Ok(ResizeOutcome::Rejected(reason)) => {
                    resize.failed_target = Some(desired);
                    let delay = resize.backoff.record_failure(now);
                    tracing::warn!(
                        desired,
                        reason = %reason,
                        retry_in_ms = delay.as_millis() as u64,
                        "Node pool resize rejected"
                    );
                    report.error = Some(reason);
                }
                Err(e) if e.is_retryable() => {
                    resize.failed_target = Some(desired);
                    let delay = resize.backoff.record_failure(now);
                    tracing::warn!(
                        desired,
                        error = %e,
                        attempt = resize.backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Node pool resize failed, backing off"
                    );
                    report.error = Some(e.to_string());
                }
                Err(e) => {
                    resize.failed_target = Some(desired);
                    let delay = resize.backoff.record_permanent_failure(now);
                    tracing::error!(
                        desired,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Node pool resize failed permanently"
                    );
                    report.error = Some(e.to_string());
                }
            }
        }

        // Readiness is only trusted once the pool has settled, so a shrink
        // still in flight can't pull nodes from under a freshly started job.
        if !in_flight && job_desired > 0 && actual >= job_desired {
            report.signalled_jobs = self.signal_capacity_ready(&jobs);
        }

        if report.resize_requested.is_none()
            && report.signalled_jobs.is_empty()
            && report.lost_jobs.is_empty()
        {
            tracing::debug!(actual, desired, "Reconcile tick, no change");
        }

        self.record(report.clone(), true).await;
        report
    }

    async fn fail_starved_jobs(&self, jobs: &[JobRecord], actual: u32) -> Vec<JobId> {
        let mut lost = Vec::new();
        for job in jobs
            .iter()
            .filter(|j| j.state == JobState::Running && j.config.node_count > actual)
        {
            tracing::warn!(
                job_id = %job.id,
                node_count = job.config.node_count,
                actual,
                "Node pool shrank below a running job"
            );
            match self.lifecycle.capacity_lost(&job.id).await {
                Ok(_) => lost.push(job.id.clone()),
                Err(e) => tracing::debug!(job_id = %job.id, error = %e, "Job already left Running"),
            }
        }
        lost
    }

    /// Start a dispatch task for every Provisioning job and return their ids.
    /// A job already being dispatched rejects the duplicate signal.
    fn signal_capacity_ready(&self, jobs: &[JobRecord]) -> Vec<JobId> {
        let waiting: Vec<JobId> = jobs
            .iter()
            .filter(|j| j.state == JobState::Provisioning)
            .map(|j| j.id.clone())
            .collect();
        if waiting.is_empty() {
            return waiting;
        }

        let mut dispatches = self.dispatches.lock().unwrap_or_else(|e| e.into_inner());
        dispatches.retain(|handle| !handle.is_finished());
        for id in &waiting {
            let lifecycle = self.lifecycle.clone();
            let id = id.clone();
            dispatches.push(tokio::spawn(async move {
                if let Err(e) = lifecycle.capacity_ready(&id).await {
                    tracing::debug!(job_id = %id, error = %e, "Capacity signal not applied");
                }
            }));
        }
        waiting
    }

    /// Wait for every dispatch started so far to finish.
    pub async fn wait_for_dispatches(&self) {
        let pending = std::mem::take(
            &mut *self.dispatches.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for handle in pending {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Dispatch task panicked");
            }
        }
    }

    /// Manual override count, clearing it once expired.
    async fn active_override(&self, now: Instant) -> u32 {
        let mut manual = self.manual.lock().await;
        match *manual {
            Some(o) if now >= o.expires_at => {
                tracing::info!(count = o.count, "Manual scale override expired");
                *manual = None;
                0
            }
            Some(o) => o.count,
            None => 0,
        }
    }

    async fn record(&self, report: TickReport, reached_pool: bool) {
        let mut health = self.health.write().await;
        if reached_pool {
            health.last_success = Some(Instant::now());
        }
        health.last_report = Some(report);
    }

    /// Ask for the pool to be held at `count` nodes.
    ///
    /// A scale-up is honored for the configured grace period, then expires
    /// back to job-driven sizing. Anything below what active jobs need is
    /// rejected with `Conflict`; scaling to 0 clears the override.
    pub async fn request_scale(&self, count: u32) -> Result<()> {
        if count > self.max_nodes {
            return Err(ControlError::InvalidConfig(format!(
                "node_count must be between 0 and {}, got {}",
                self.max_nodes, count
            )));
        }

        let mut manual = self.manual.lock().await;
        let job_desired = desired_from_jobs(&self.store.list().await);
        if job_desired > count {
            return Err(ControlError::Conflict(format!(
                "cannot scale to {} nodes: active jobs need {}",
                count, job_desired
            )));
        }

        *manual = if count == 0 {
            None
        } else {
            Some(ManualOverride {
                count,
                expires_at: Instant::now() + self.config.manual_scale_grace,
            })
        };
        tracing::info!(count, job_desired, "Manual scale accepted");
        self.wake.notify_one();
        Ok(())
    }

    /// Current desired size. Read-only; does not clear expired overrides.
    pub async fn desired_count(&self) -> u32 {
        let job_desired = desired_from_jobs(&self.store.list().await);
        let manual = self
            .manual
            .lock()
            .await
            .filter(|o| Instant::now() < o.expires_at)
            .map_or(0, |o| o.count);
        job_desired.max(manual)
    }

    pub async fn manual_override(&self) -> Option<ManualOverride> {
        *self.manual.lock().await
    }

    pub async fn last_report(&self) -> Option<TickReport> {
        self.health.read().await.last_report.clone()
    }

    /// The loop reached the substrate recently enough.
    pub async fn is_healthy(&self) -> bool {
        self.health
            .read()
            .await
            .last_success
            .is_some_and(|at| at.elapsed() <= self.config.health_staleness)
    }

    /// Tick on every interval and whenever a job's capacity need changes.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Node pool reconciler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Node pool reconciler stopping");
                    self.wait_for_dispatches().await;
                    break;
                }
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }
            self.tick().await;
        }
    }
}
