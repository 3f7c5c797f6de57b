//! Error types for the per-user Docker sandboxes.

use std::time::Duration;

/// Errors that can occur in the sandbox system.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Docker daemon is not available or not running.
    #[error("Docker not available: {reason}")]
    DockerNotAvailable { reason: String },

    /// Failed to create container.
    #[error("Container creation failed: {reason}")]
    ContainerCreationFailed { reason: String },

    /// Failed to start container.
    #[error("Container start failed: {reason}")]
    ContainerStartFailed { reason: String },

    /// Command execution failed inside container.
    #[error("Execution failed: {reason}")]
    ExecutionFailed { reason: String },

    /// Command timed out.
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// Every port block in the sandbox range is taken.
    #[error("No free port ranges available ({slots} slots in use)")]
    NoFreePorts { slots: usize },

    /// The user id cannot be used in a container name or mount path.
    #[error("Invalid user id {user_id:?}: {reason}")]
    InvalidUserId { user_id: String, reason: String },

    /// The container disappeared between lookup and use.
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Docker API error.
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

impl SandboxError {
    /// Whether the error means the object is already gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            SandboxError::ContainerNotFound(_) => true,
            SandboxError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => *status_code == 404,
            _ => false,
        }
    }
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_not_available_display() {
        let err = SandboxError::DockerNotAvailable {
            reason: "daemon not running".to_string(),
        };
        assert!(err.to_string().contains("daemon not running"));
        assert!(err.to_string().contains("Docker not available"));
    }

    #[test]
    fn test_timeout_display() {
        let err = SandboxError::Timeout(Duration::from_secs(120));
        let msg = err.to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("120"));
    }

    #[test]
    fn test_no_free_ports_display() {
        let err = SandboxError::NoFreePorts { slots: 100 };
        assert!(err.to_string().contains("100 slots"));
    }

    #[test]
    fn test_invalid_user_id_display() {
        let err = SandboxError::InvalidUserId {
            user_id: "../etc".to_string(),
            reason: "contains '/'".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("../etc"));
        assert!(msg.contains("contains '/'"));
    }

    #[test]
    fn test_not_found_detection() {
        assert!(SandboxError::ContainerNotFound("abc".to_string()).is_not_found());

        let docker_404 = SandboxError::Docker(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        });
        assert!(docker_404.is_not_found());

        let docker_500 = SandboxError::Docker(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        });
        assert!(!docker_500.is_not_found());
        assert!(!SandboxError::Timeout(Duration::from_secs(1)).is_not_found());
    }
}
