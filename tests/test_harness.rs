//! Shared wiring for control-plane integration tests.
//!
//! Builds a full control plane over an in-memory cluster. Loops are not
//! spawned; tests drive `tick()` and `supervise()` by hand, usually under
//! paused tokio time.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gpupool_control::cluster::SimulatedCluster;
use gpupool_control::config::ControlPlaneConfig;
use gpupool_control::jobs::{JobConfig, JobId, JobRecord, JobState, TaskType};
use gpupool_control::nodepool::TickReport;
use gpupool_control::ControlPlane;

pub const MAX_NODES: u32 = 4;

/// Config with the production timings and a small pool.
pub fn test_config() -> ControlPlaneConfig {
    let mut config = ControlPlaneConfig::new("127.0.0.1:0".parse().unwrap()).with_max_nodes(MAX_NODES);
    config.lifecycle.provisioning_timeout = Duration::from_secs(600);
    config.reconciler.interval = Duration::from_secs(10);
    config
}

pub fn job(duration: u64, node_count: u32) -> JobConfig {
    JobConfig::new(duration, node_count, TaskType::Training)
}

pub struct Harness {
    pub cluster: Arc<SimulatedCluster>,
    pub plane: ControlPlane,
}

impl Harness {
    /// Resizes land on the next observation.
    pub fn new() -> Self {
        Self::with_cluster(SimulatedCluster::new("gpupool", "Standard_NC6s_v3"))
    }

    pub fn with_cluster(cluster: SimulatedCluster) -> Self {
        Self::with_config(test_config(), cluster)
    }

    pub fn with_config(config: ControlPlaneConfig, cluster: SimulatedCluster) -> Self {
        let cluster = Arc::new(cluster);
        let plane = ControlPlane::new(config, cluster.clone());
        Self { cluster, plane }
    }

    pub async fn submit(&self, config: JobConfig) -> JobId {
        self.plane.lifecycle.submit(config, None).await.unwrap().id
    }

    pub async fn record(&self, id: &str) -> JobRecord {
        self.plane.store.get(id).await.unwrap()
    }

    pub async fn state(&self, id: &str) -> JobState {
        self.record(id).await.state
    }

    /// One reconcile tick, waiting for the dispatches it started.
    pub async fn tick(&self) -> TickReport {
        let report = self.plane.reconciler.tick().await;
        self.plane.reconciler.wait_for_dispatches().await;
        report
    }

    pub async fn supervise(&self) {
        self.plane.lifecycle.supervise().await;
    }

    /// Tick until the job is running; panics after `max_ticks`.
    pub async fn run_until_running(&self, id: &str, max_ticks: usize) {
        for _ in 0..max_ticks {
            self.tick().await;
            if self.state(id).await == JobState::Running {
                return;
            }
            tokio::time::advance(Duration::from_secs(10)).await;
        }
        panic!("job {} never reached Running", id);
    }

    pub async fn resize_requests(&self) -> Vec<u32> {
        self.cluster.resize_requests().await
    }
}
