use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::cluster::ClusterAdapter;
use crate::config::ControlPlaneConfig;
use crate::jobs::{JobLimits, JobStore, LifecycleManager};
use crate::nodepool::Reconciler;

/// Owns every component of one control-plane process.
pub struct ControlPlane {
    pub config: ControlPlaneConfig,
    pub store: Arc<JobStore>,
    pub cluster: Arc<dyn ClusterAdapter>,
    pub lifecycle: Arc<LifecycleManager>,
    pub reconciler: Arc<Reconciler>,
}

impl ControlPlane {
    pub fn new(config: ControlPlaneConfig, cluster: Arc<dyn ClusterAdapter>) -> Self {
        let wake = Arc::new(Notify::new());
        let limits = JobLimits {
            max_nodes: config.nodepool.max_nodes,
            max_duration: config.lifecycle.max_job_duration,
        };
        let store = Arc::new(JobStore::new(limits, config.lifecycle.max_jobs));

        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            cluster.clone(),
            config.lifecycle.clone(),
            config.workload.clone(),
            wake.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            cluster.clone(),
            lifecycle.clone(),
            config.reconciler.clone(),
            config.nodepool.max_nodes,
            wake,
        ));

        Self {
            config,
            store,
            cluster,
            lifecycle,
            reconciler,
        }
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            lifecycle: self.lifecycle.clone(),
            reconciler: self.reconciler.clone(),
            store: self.store.clone(),
            cluster: self.cluster.clone(),
            call_timeout: self.config.reconciler.call_timeout,
        }
    }

    /// Run the reconciler, the job supervisor and the API until `shutdown`
    /// fires.
    ///
    /// Jobs are left in whatever state they were in; workloads keep running
    /// on the substrate and their records go with the process.
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        tracing::info!(
            listen_addr = %self.config.listen_addr,
            nodepool = %self.config.nodepool.name,
            vm_size = %self.config.nodepool.vm_size,
            max_nodes = self.config.nodepool.max_nodes,
            "Starting GPU pool control plane"
        );

        let reconciler = tokio::spawn(self.reconciler.clone().run(shutdown.clone()));
        let supervisor = tokio::spawn(self.lifecycle.clone().run(shutdown.clone()));

        let served = api::serve(self.config.listen_addr, self.api_state(), shutdown.clone()).await;
        // The API can fail to bind; stop the loops either way
        shutdown.cancel();

        for (name, handle) in [("reconciler", reconciler), ("supervisor", supervisor)] {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "Background task panicked");
            }
        }

        tracing::info!("Control plane stopped");
        served
    }
}
