//! In-memory substrate.
//!
//! Resizes take `provisioning_delay` to land and are reported as `Scaling`
//! until then. Workloads follow a [`WorkloadOutcome`] measured from creation.
//! Faults can be queued per operation to exercise retry paths, and workload
//! calls can be slowed down to exercise interleavings.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{
    ClusterAdapter, ClusterError, NodepoolState, ProvisioningState, ResizeOutcome,
    WorkloadHandle, WorkloadSpec, WorkloadStatus, WorkloadSummary,
};

/// How a simulated workload behaves once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadOutcome {
    /// Reports success once this much time has passed
    SucceedAfter(Duration),
    /// Reports failure with the message once this much time has passed
    FailAfter(Duration, String),
    /// Keeps running until deleted
    RunForever,
}

#[derive(Debug)]
struct SimWorkload {
    spec: WorkloadSpec,
    created_at: Instant,
    outcome: WorkloadOutcome,
}

impl SimWorkload {
    fn status(&self, now: Instant) -> WorkloadStatus {
        let elapsed = now.saturating_duration_since(self.created_at);
        match &self.outcome {
            WorkloadOutcome::SucceedAfter(after) if elapsed >= *after => WorkloadStatus::Succeeded,
            WorkloadOutcome::FailAfter(after, msg) if elapsed >= *after => {
                WorkloadStatus::Failed(msg.clone())
            }
            _ => WorkloadStatus::Running,
        }
    }
}

#[derive(Debug)]
struct PendingResize {
    target: u32,
    lands_at: Instant,
}

#[derive(Debug)]
struct SimState {
    actual: u32,
    quota: u32,
    resize: Option<PendingResize>,
    provisioning_delay: Duration,
    create_latency: Duration,
    delete_latency: Duration,
    default_outcome: WorkloadOutcome,
    workloads: HashMap<WorkloadHandle, SimWorkload>,
    next_workload: u64,
    nodepool_faults: VecDeque<ClusterError>,
    resize_faults: VecDeque<ClusterError>,
    create_faults: VecDeque<ClusterError>,
    status_faults: VecDeque<ClusterError>,
    resize_requests: Vec<u32>,
    deleted: Vec<WorkloadHandle>,
}

impl SimState {
    /// Apply a resize whose delay has elapsed.
    fn settle(&mut self, now: Instant) {
        if let Some(resize) = &self.resize {
            if now >= resize.lands_at {
                self.actual = resize.target;
                self.resize = None;
            }
        }
    }
}

pub struct SimulatedCluster {
    name: String,
    vm_size: String,
    state: Mutex<SimState>,
}

impl SimulatedCluster {
    pub fn new(name: impl Into<String>, vm_size: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vm_size: vm_size.into(),
            state: Mutex::new(SimState {
                actual: 0,
                quota: u32::MAX,
                resize: None,
                provisioning_delay: Duration::ZERO,
                create_latency: Duration::ZERO,
                delete_latency: Duration::ZERO,
                default_outcome: WorkloadOutcome::RunForever,
                workloads: HashMap::new(),
                next_workload: 1,
                nodepool_faults: VecDeque::new(),
                resize_faults: VecDeque::new(),
                create_faults: VecDeque::new(),
                status_faults: VecDeque::new(),
                resize_requests: Vec::new(),
                deleted: Vec::new(),
            }),
        }
    }

    pub fn with_provisioning_delay(mut self, delay: Duration) -> Self {
        self.state.get_mut().provisioning_delay = delay;
        self
    }

    /// `create_workload` waits this long before placing the workload.
    pub fn with_create_latency(mut self, latency: Duration) -> Self {
        self.state.get_mut().create_latency = latency;
        self
    }

    /// `delete_workload` removes the workload at once but returns only after
    /// this long.
    pub fn with_delete_latency(mut self, latency: Duration) -> Self {
        self.state.get_mut().delete_latency = latency;
        self
    }

    pub fn with_default_outcome(mut self, outcome: WorkloadOutcome) -> Self {
        self.state.get_mut().default_outcome = outcome;
        self
    }

    /// Resizes above `quota` are rejected.
    pub fn with_quota(mut self, quota: u32) -> Self {
        self.state.get_mut().quota = quota;
        self
    }

    pub async fn set_default_outcome(&self, outcome: WorkloadOutcome) {
        self.state.lock().await.default_outcome = outcome;
    }

    /// Change the outcome of one workload, timed from its creation.
    pub async fn set_outcome(&self, handle: &WorkloadHandle, outcome: WorkloadOutcome) {
        if let Some(workload) = self.state.lock().await.workloads.get_mut(handle) {
            workload.outcome = outcome;
        }
    }

    /// Shrink the pool behind the control plane's back.
    pub async fn shrink_externally(&self, count: u32) {
        let mut state = self.state.lock().await;
        state.actual = state.actual.min(count);
        state.resize = None;
    }

    pub async fn fail_next_get_nodepool(&self, err: ClusterError) {
        self.state.lock().await.nodepool_faults.push_back(err);
    }

    pub async fn fail_next_resize(&self, err: ClusterError) {
        self.state.lock().await.resize_faults.push_back(err);
    }

    pub async fn fail_next_create(&self, err: ClusterError) {
        self.state.lock().await.create_faults.push_back(err);
    }

    pub async fn fail_next_status(&self, err: ClusterError) {
        self.state.lock().await.status_faults.push_back(err);
    }

    /// Sizes passed to `set_nodepool_size`, including rejected ones.
    pub async fn resize_requests(&self) -> Vec<u32> {
        self.state.lock().await.resize_requests.clone()
    }

    pub async fn deleted_workloads(&self) -> Vec<WorkloadHandle> {
        self.state.lock().await.deleted.clone()
    }

    pub async fn live_workloads(&self) -> Vec<WorkloadSpec> {
        self.state
            .lock()
            .await
            .workloads
            .values()
            .map(|w| w.spec.clone())
            .collect()
    }

    pub async fn handle_for_job(&self, job_id: &str) -> Option<WorkloadHandle> {
        self.state
            .lock()
            .await
            .workloads
            .iter()
            .find(|(_, w)| w.spec.job_id == job_id)
            .map(|(h, _)| h.clone())
    }
}

#[async_trait]
impl ClusterAdapter for SimulatedCluster {
    async fn get_nodepool(&self) -> Result<NodepoolState, ClusterError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.nodepool_faults.pop_front() {
            return Err(err);
        }
        state.settle(Instant::now());

        Ok(NodepoolState {
            name: self.name.clone(),
            vm_size: self.vm_size.clone(),
            actual_count: state.actual,
            provisioning_state: if state.resize.is_some() {
                ProvisioningState::Scaling
            } else {
                ProvisioningState::Succeeded
            },
            power_state: Some("Running".to_string()),
        })
    }

    async fn set_nodepool_size(&self, count: u32) -> Result<ResizeOutcome, ClusterError> {
        let mut state = self.state.lock().await;
        state.resize_requests.push(count);
        if let Some(err) = state.resize_faults.pop_front() {
            return Err(err);
        }
        if count > state.quota {
            return Ok(ResizeOutcome::Rejected(format!(
                "requested {} nodes exceeds quota of {}",
                count, state.quota
            )));
        }

        let now = Instant::now();
        state.settle(now);
        state.resize = if state.actual != count {
            Some(PendingResize {
                target: count,
                lands_at: now + state.provisioning_delay,
            })
        } else {
            None
        };
        Ok(ResizeOutcome::Accepted)
    }

    async fn list_workloads(&self) -> Result<Vec<WorkloadSummary>, ClusterError> {
        let state = self.state.lock().await;
        let now = Instant::now();
        Ok(state
            .workloads
            .iter()
            .map(|(handle, w)| WorkloadSummary {
                handle: handle.clone(),
                job_id: w.spec.job_id.clone(),
                status: w.status(now),
            })
            .collect())
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, ClusterError> {
        let latency = self.state.lock().await.create_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        if let Some(err) = state.create_faults.pop_front() {
            return Err(err);
        }
        state.settle(Instant::now());
        if spec.node_count > state.actual {
            return Err(ClusterError::Transient(format!(
                "workload {} needs {} nodes, pool has {}",
                spec.name, spec.node_count, state.actual
            )));
        }

        let handle = WorkloadHandle(format!("{}-{}", spec.name, state.next_workload));
        state.next_workload += 1;
        let outcome = state.default_outcome.clone();
        state.workloads.insert(
            handle.clone(),
            SimWorkload {
                spec: spec.clone(),
                created_at: Instant::now(),
                outcome,
            },
        );
        Ok(handle)
    }

    async fn delete_workload(&self, handle: &WorkloadHandle) -> Result<(), ClusterError> {
        let latency = {
            let mut state = self.state.lock().await;
            if state.workloads.remove(handle).is_some() {
                state.deleted.push(handle.clone());
            }
            state.delete_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    async fn get_workload_status(
        &self,
        handle: &WorkloadHandle,
    ) -> Result<WorkloadStatus, ClusterError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.status_faults.pop_front() {
            return Err(err);
        }
        state
            .workloads
            .get(handle)
            .map(|w| w.status(Instant::now()))
            .ok_or_else(|| ClusterError::Permanent(format!("workload {} not found", handle)))
    }
}
