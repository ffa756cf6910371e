use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{
    ClusterAdapter, ClusterError, NodepoolState, ProvisioningState, ResizeOutcome,
    WorkloadHandle, WorkloadSpec, WorkloadStatus, WorkloadSummary,
};
use crate::config::{NodepoolConfig, SandboxConfig};

const JOB_LABEL: &str = "gpupool.job-id";
const NAMESPACE_LABEL: &str = "gpupool.namespace";

/// Local substrate for development on a single GPU host.
///
/// The node pool is virtual: resizes are accepted instantly up to
/// `max_nodes`. Workloads run as detached Docker containers with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits
pub struct DockerCluster {
    nodepool: NodepoolConfig,
    sandbox: SandboxConfig,
    size: Mutex<u32>,
}

impl DockerCluster {
    pub fn new(nodepool: NodepoolConfig, sandbox: SandboxConfig) -> Self {
        Self {
            nodepool,
            sandbox,
            size: Mutex::new(0),
        }
    }

    /// Arguments for `docker run` that start the workload detached.
    pub fn run_args(&self, spec: &WorkloadSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            format!("--name={}", spec.name),
            format!("--label={}={}", JOB_LABEL, spec.job_id),
            format!("--label={}={}", NAMESPACE_LABEL, spec.namespace),
        ];

        if self.sandbox.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = self.sandbox.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.sandbox.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }
        if self.sandbox.gpus {
            args.push("--gpus=all".to_string());
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        for (key, value) in &spec.env {
            args.push(format!("--env={}={}", key, value));
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<String, ClusterError> {
        let output = Command::new("docker")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ClusterError::Permanent("docker binary not found".to_string())
                } else {
                    ClusterError::Transient(format!("failed to run docker: {}", e))
                }
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(classify_docker_error(&stderr, output.status.code()))
        }
    }
}

/// Daemon connectivity problems go away on their own; everything else
/// (bad image, bad arguments, missing container) does not.
fn classify_docker_error(stderr: &str, exit_code: Option<i32>) -> ClusterError {
    let message = if stderr.is_empty() {
        format!("docker exited with code {:?}", exit_code)
    } else {
        stderr.to_string()
    };
    if stderr.contains("Cannot connect to the Docker daemon") || stderr.contains("timeout") {
        ClusterError::Transient(message)
    } else {
        ClusterError::Permanent(message)
    }
}

/// Parse `docker inspect -f '{{.State.Status}} {{.State.ExitCode}}'` output.
fn parse_container_state(state: &str) -> WorkloadStatus {
    let mut parts = state.split_whitespace();
    let status = parts.next().unwrap_or_default();
    let exit_code: Option<i32> = parts.next().and_then(|c| c.parse().ok());

    match status {
        "created" => WorkloadStatus::Pending,
        "running" | "restarting" | "paused" => WorkloadStatus::Running,
        "exited" if exit_code == Some(0) => WorkloadStatus::Succeeded,
        "exited" => WorkloadStatus::Failed(format!("Exit code: {}", exit_code.unwrap_or(-1))),
        other => WorkloadStatus::Failed(format!("container is {}", other)),
    }
}

fn is_missing_container(err: &ClusterError) -> bool {
    let msg = err.message();
    msg.contains("No such container") || msg.contains("No such object")
}

#[async_trait]
impl ClusterAdapter for DockerCluster {
    async fn get_nodepool(&self) -> Result<NodepoolState, ClusterError> {
        let size = *self.size.lock().await;
        Ok(NodepoolState {
            name: self.nodepool.name.clone(),
            vm_size: self.nodepool.vm_size.clone(),
            actual_count: size,
            provisioning_state: ProvisioningState::Succeeded,
            power_state: Some("Running".to_string()),
        })
    }

    async fn set_nodepool_size(&self, count: u32) -> Result<ResizeOutcome, ClusterError> {
        if count > self.nodepool.max_nodes {
            return Ok(ResizeOutcome::Rejected(format!(
                "requested {} nodes exceeds pool maximum of {}",
                count, self.nodepool.max_nodes
            )));
        }
        *self.size.lock().await = count;
        tracing::info!(pool = %self.nodepool.name, count, "Virtual node pool resized");
        Ok(ResizeOutcome::Accepted)
    }

    async fn list_workloads(&self) -> Result<Vec<WorkloadSummary>, ClusterError> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            format!("--filter=label={}", JOB_LABEL),
            format!("--format={{{{.ID}}}} {{{{.Label \"{}\"}}}} {{{{.State}}}}", JOB_LABEL),
        ];
        let out = self.docker(&args).await?;

        Ok(out
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let id = parts.next()?;
                let job_id = parts.next()?;
                let state = parts.next().unwrap_or("running");
                Some(WorkloadSummary {
                    handle: WorkloadHandle(id.to_string()),
                    job_id: job_id.to_string(),
                    status: parse_container_state(state),
                })
            })
            .collect())
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<WorkloadHandle, ClusterError> {
        tracing::info!(job_id = %spec.job_id, image = %spec.image, "Starting workload container");
        let container_id = self.docker(&self.run_args(spec)).await?;
        Ok(WorkloadHandle(container_id))
    }

    async fn delete_workload(&self, handle: &WorkloadHandle) -> Result<(), ClusterError> {
        let args = vec!["rm".to_string(), "-f".to_string(), handle.0.clone()];
        match self.docker(&args).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing_container(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_workload_status(
        &self,
        handle: &WorkloadHandle,
    ) -> Result<WorkloadStatus, ClusterError> {
        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Status}} {{.State.ExitCode}}".to_string(),
            handle.0.clone(),
        ];
        let out = self.docker(&args).await?;
        Ok(parse_container_state(&out))
    }
}
