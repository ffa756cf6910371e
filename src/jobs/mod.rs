//! Job records, their store, and the lifecycle that moves them through
//! the state machine.

pub mod job;
pub mod lifecycle;
pub mod store;

pub use job::{JobConfig, JobId, JobLimits, JobRecord, JobState, TaskType};
pub use lifecycle::{LifecycleManager, SuperviseReport};
pub use store::JobStore;
