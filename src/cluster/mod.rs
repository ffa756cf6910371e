//! Capability interface over the compute substrate.
//!
//! Business logic never talks to the cluster directly; it goes through
//! [`ClusterAdapter`]. The adapter owns the authoritative node-pool size, so
//! everything read through it is an observation, never an assumption.
//!
//! # Implementations
//!
//! - [`SimulatedCluster`]: in-memory substrate with a provisioning delay,
//!   scripted workload outcomes and fault injection
//! - [`DockerCluster`]: virtual node pool, workloads run as sandboxed local
//!   Docker containers

pub mod docker;
pub mod simulated;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use docker::DockerCluster;
pub use simulated::{SimulatedCluster, WorkloadOutcome};

/// Failure of a substrate call. Callers use the class to decide between
/// retrying and failing fast.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl ClusterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ClusterError::Transient(msg) | ClusterError::Permanent(msg) => msg,
        }
    }
}

/// Provisioning state of the node pool as reported by the substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningState {
    Succeeded,
    Creating,
    Scaling,
    Updating,
    Failed,
    Other(String),
}

impl ProvisioningState {
    /// A resize or other mutation is still being applied.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ProvisioningState::Creating | ProvisioningState::Scaling | ProvisioningState::Updating
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            ProvisioningState::Succeeded => "Succeeded",
            ProvisioningState::Creating => "Creating",
            ProvisioningState::Scaling => "Scaling",
            ProvisioningState::Updating => "Updating",
            ProvisioningState::Failed => "Failed",
            ProvisioningState::Other(s) => s,
        }
    }
}

impl From<&str> for ProvisioningState {
    fn from(s: &str) -> Self {
        match s {
            "Succeeded" => ProvisioningState::Succeeded,
            "Creating" => ProvisioningState::Creating,
            "Scaling" => ProvisioningState::Scaling,
            "Updating" => ProvisioningState::Updating,
            "Failed" => ProvisioningState::Failed,
            other => ProvisioningState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node pool as observed on the substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodepoolState {
    pub name: String,
    pub vm_size: String,
    /// Nodes currently ready in the pool
    pub actual_count: u32,
    pub provisioning_state: ProvisioningState,
    pub power_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResizeOutcome {
    Accepted,
    Rejected(String),
}

/// Opaque reference to a dispatched workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadHandle(pub String);

impl fmt::Display for WorkloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadStatus {
    Pending,
    Running,
    Succeeded,
    Failed(String),
}

/// What to run for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub name: String,
    pub namespace: String,
    pub job_id: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub node_count: u32,
    /// Hard upper bound the substrate may enforce on its own
    pub active_deadline: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSummary {
    pub handle: WorkloadHandle,
    pub job_id: String,
    pub status: WorkloadStatus,
}

/// Operations the control plane needs from the compute substrate.
///
/// Every call may fail with [`ClusterError::Transient`] or
/// [`ClusterError::Permanent`]. `delete_workload` must succeed when the
/// workload is already gone.
#[async_trait]
pub trait ClusterAdapter: Send + Sync {
    async fn get_nodepool(&self) -> Result<NodepoolState, ClusterError>;

    /// Request a resize. Returns once the request is accepted, not once the
    /// pool has reached the new size.
    async fn set_nodepool_size(&self, count: u32) -> Result<ResizeOutcome, ClusterError>;

    /// Workloads created by this control plane.
    async fn list_workloads(&self) -> Result<Vec<WorkloadSummary>, ClusterError>;

    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, ClusterError>;

    async fn delete_workload(&self, handle: &WorkloadHandle) -> Result<(), ClusterError>;

    async fn get_workload_status(
        &self,
        handle: &WorkloadHandle,
    ) -> Result<WorkloadStatus, ClusterError>;
}

/// Bound a substrate call. An elapsed call counts as transient.
pub async fn bounded<T, F>(limit: Duration, operation: &str, call: F) -> Result<T, ClusterError>
where
    F: Future<Output = Result<T, ClusterError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ClusterError::Transient(format!(
            "{} timed out after {}s",
            operation,
            limit.as_secs_f64()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_state_round_trips_known_values() {
        for s in ["Succeeded", "Creating", "Scaling", "Updating", "Failed"] {
            assert_eq!(ProvisioningState::from(s).as_str(), s);
        }
        assert_eq!(
            ProvisioningState::from("Upgrading"),
            ProvisioningState::Other("Upgrading".to_string())
        );
    }

    #[test]
    fn only_mutating_states_are_in_flight() {
        assert!(ProvisioningState::Scaling.is_in_flight());
        assert!(ProvisioningState::Updating.is_in_flight());
        assert!(ProvisioningState::Creating.is_in_flight());
        assert!(!ProvisioningState::Succeeded.is_in_flight());
        assert!(!ProvisioningState::Failed.is_in_flight());
    }

    #[test]
    fn retryable_only_when_transient() {
        assert!(ClusterError::Transient("x".into()).is_retryable());
        assert!(!ClusterError::Permanent("x".into()).is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_turns_elapsed_calls_into_transient_errors() {
        let result: Result<(), ClusterError> = bounded(Duration::from_secs(1), "get_nodepool", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        match result {
            Err(ClusterError::Transient(msg)) => assert!(msg.contains("get_nodepool")),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
