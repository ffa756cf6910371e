use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{ControlError, Result};
use crate::retry::BackoffConfig;

/// The single GPU node pool this control plane owns.
#[derive(Debug, Clone)]
pub struct NodepoolConfig {
    /// Agent pool name on the cluster
    pub name: String,
    /// VM size of the pool's nodes, reported on the status endpoint
    pub vm_size: String,
    /// Upper bound for any job's `node_count` and for manual scale requests
    pub max_nodes: u32,
}

impl Default for NodepoolConfig {
    fn default() -> Self {
        Self {
            name: "gpupool".to_string(),
            vm_size: "Standard_NC6s_v3".to_string(),
            max_nodes: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long a job may wait in Provisioning for capacity
    pub provisioning_timeout: Duration,
    /// Interval between supervision passes over active jobs
    pub supervise_interval: Duration,
    /// Bound on any single substrate call made while supervising
    pub call_timeout: Duration,
    /// Largest `duration` a job may declare
    pub max_job_duration: Duration,
    /// Maximum number of job records kept in the store
    pub max_jobs: usize,
    /// Terminal records older than this are pruned
    pub job_retention: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            provisioning_timeout: Duration::from_secs(600),
            supervise_interval: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            max_job_duration: Duration::from_secs(24 * 60 * 60),
            max_jobs: 10_000,
            job_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Period of the reconciliation loop
    pub interval: Duration,
    /// How long a manual scale-up is honored before it expires
    pub manual_scale_grace: Duration,
    /// Backoff applied to failed resize requests
    pub backoff: BackoffConfig,
    /// Health reports unhealthy when the last good tick is older than this
    pub health_staleness: Duration,
    /// Bound on any single substrate call made during a tick
    pub call_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            manual_scale_grace: Duration::from_secs(15 * 60),
            backoff: BackoffConfig::default(),
            health_staleness: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// What gets dispatched for every job once capacity is ready.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Container image run for each job
    pub image: String,
    /// Command override; the image entrypoint runs when empty
    pub command: Vec<String>,
    /// Namespace the workloads are created in
    pub namespace: String,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            image: "nvidia/cuda:12.4.1-runtime-ubuntu22.04".to_string(),
            command: Vec::new(),
            namespace: "gpu-jobs".to_string(),
        }
    }
}

/// Isolation settings for workloads run by the local Docker substrate.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "8g")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "4")
    pub cpu_limit: Option<String>,
    /// Pass `--gpus all` to docker
    pub gpus: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            network_disabled: true,
            memory_limit: Some("8g".to_string()),
            cpu_limit: Some("4".to_string()),
            gpus: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub listen_addr: SocketAddr,
    pub nodepool: NodepoolConfig,
    pub lifecycle: LifecycleConfig,
    pub reconciler: ReconcilerConfig,
    pub workload: WorkloadConfig,
    pub sandbox: SandboxConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            nodepool: NodepoolConfig::default(),
            lifecycle: LifecycleConfig::default(),
            reconciler: ReconcilerConfig::default(),
            workload: WorkloadConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_nodepool(mut self, name: impl Into<String>, vm_size: impl Into<String>) -> Self {
        self.nodepool.name = name.into();
        self.nodepool.vm_size = vm_size.into();
        self
    }

    pub fn with_max_nodes(mut self, max_nodes: u32) -> Self {
        self.nodepool.max_nodes = max_nodes;
        self
    }

    /// Reject configurations the control loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.nodepool.name.trim().is_empty() {
            return Err(ControlError::InvalidConfig(
                "nodepool name must not be empty".to_string(),
            ));
        }
        if self.nodepool.max_nodes == 0 {
            return Err(ControlError::InvalidConfig(
                "nodepool max_nodes must be at least 1".to_string(),
            ));
        }
        let zero_durations = [
            ("provisioning_timeout", self.lifecycle.provisioning_timeout),
            ("supervise_interval", self.lifecycle.supervise_interval),
            ("lifecycle call_timeout", self.lifecycle.call_timeout),
            ("max_job_duration", self.lifecycle.max_job_duration),
            ("reconcile interval", self.reconciler.interval),
            ("reconciler call_timeout", self.reconciler.call_timeout),
        ];
        if let Some((name, _)) = zero_durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ControlError::InvalidConfig(format!(
                "{} must be greater than zero",
                name
            )));
        }
        if self.reconciler.health_staleness < self.reconciler.interval {
            return Err(ControlError::InvalidConfig(
                "health_staleness must be at least one reconcile interval".to_string(),
            ));
        }
        if self.lifecycle.max_jobs == 0 {
            return Err(ControlError::InvalidConfig(
                "max_jobs must be at least 1".to_string(),
            ));
        }
        if self.workload.image.trim().is_empty() {
            return Err(ControlError::InvalidConfig(
                "workload image must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
