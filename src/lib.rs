pub mod api;
pub mod cluster;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod jobs;
pub mod nodepool;
pub mod retry;
pub mod shutdown;

pub use control_plane::ControlPlane;
pub use error::{ControlError, Result};
