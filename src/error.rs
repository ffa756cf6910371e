use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::cluster::ClusterError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Job store is at capacity ({0} jobs)")]
    AtCapacity(usize),

    #[error("Transient substrate error: {0}")]
    Transient(String),

    #[error("Permanent substrate error: {0}")]
    Permanent(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Conflict(_) => StatusCode::CONFLICT,
            ControlError::AtCapacity(_) | ControlError::Transient(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ControlError::Permanent(_) => StatusCode::BAD_GATEWAY,
            ControlError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ClusterError> for ControlError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Transient(msg) => ControlError::Transient(msg),
            ClusterError::Permanent(msg) => ControlError::Permanent(msg),
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_4xx() {
        assert_eq!(
            ControlError::InvalidConfig("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ControlError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ControlError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn cluster_errors_keep_their_class() {
        let err: ControlError = ClusterError::Transient("throttled".into()).into();
        assert_eq!(err, ControlError::Transient("throttled".into()));

        let err: ControlError = ClusterError::Permanent("quota".into()).into();
        assert_eq!(err, ControlError::Permanent("quota".into()));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
