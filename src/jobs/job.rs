use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::cluster::WorkloadHandle;
use crate::error::{ControlError, Result};

pub type JobId = String;

const MAX_JOB_ID_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Training,
    Inference,
    Processing,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Training => "training",
            TaskType::Inference => "inference",
            TaskType::Processing => "processing",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "training" => Ok(TaskType::Training),
            "inference" => Ok(TaskType::Inference),
            "processing" => Ok(TaskType::Processing),
            other => Err(ControlError::InvalidConfig(format!(
                "unknown task_type '{}', expected training, inference or processing",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Provisioning,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Jobs in these states contribute to the pool's desired size.
    pub fn needs_capacity(&self) -> bool {
        matches!(self, JobState::Provisioning | JobState::Running)
    }

    /// Edges of the job state machine.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Provisioning)
                | (Pending, Cancelled)
                | (Provisioning, Running)
                | (Provisioning, Failed)
                | (Provisioning, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "Pending",
            JobState::Provisioning => "Provisioning",
            JobState::Running => "Running",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
            JobState::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Bounds a job config is checked against on admission.
#[derive(Debug, Clone, Copy)]
pub struct JobLimits {
    pub max_nodes: u32,
    pub max_duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Upper bound on the job's run time, in seconds
    pub duration: u64,
    pub node_count: u32,
    pub task_type: TaskType,
}

impl JobConfig {
    pub fn new(duration: u64, node_count: u32, task_type: TaskType) -> Self {
        Self {
            duration,
            node_count,
            task_type,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration)
    }

    pub fn validate(&self, limits: &JobLimits) -> Result<()> {
        if self.duration == 0 {
            return Err(ControlError::InvalidConfig(
                "duration must be a positive number of seconds".to_string(),
            ));
        }
        if self.duration() > limits.max_duration {
            return Err(ControlError::InvalidConfig(format!(
                "duration {}s exceeds the maximum of {}s",
                self.duration,
                limits.max_duration.as_secs()
            )));
        }
        if self.node_count == 0 || self.node_count > limits.max_nodes {
            return Err(ControlError::InvalidConfig(format!(
                "node_count must be between 1 and {}, got {}",
                limits.max_nodes, self.node_count
            )));
        }
        Ok(())
    }
}

/// Ids end up in workload names, so they stay DNS-label friendly.
pub fn validate_job_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_JOB_ID_LEN {
        return Err(ControlError::InvalidConfig(format!(
            "job_id must be 1 to {} characters",
            MAX_JOB_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ControlError::InvalidConfig(format!(
            "job_id '{}' may only contain letters, digits, '-', '_' and '.'",
            id
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub config: JobConfig,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub workload: Option<WorkloadHandle>,
    /// Provisioning timeout while waiting for capacity, declared duration
    /// while running.
    #[serde(skip)]
    pub deadline: Option<Instant>,
    /// Creation order within the store
    #[serde(skip)]
    pub seq: u64,
}

impl JobRecord {
    pub fn new(id: JobId, config: JobConfig, seq: u64) -> Self {
        Self {
            id,
            config,
            state: JobState::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            workload: None,
            deadline: None,
            seq,
        }
    }

    pub fn deadline_passed(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}
