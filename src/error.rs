//! Error types for the YellowTang Kubernetes operator

use thiserror::Error;

/// Errors that can occur during operator operations
///
/// Every error surfaced from a reconciliation is retried by the controller
/// with exponential backoff; errors are not inspected for kind.
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Desired replica count is below the one-primary minimum
    #[error("invalid replica count: {0} (a cluster needs at least 1 instance)")]
    InvalidReplicas(i32),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Cluster spec failed validation
    #[error("spec validation failed: {0}")]
    ValidationFailed(String),

    /// A command executed inside a database container failed
    #[error("exec on pod {pod} failed: {message}")]
    ExecFailed { pod: String, message: String },

    /// A command succeeded but produced output we could not interpret
    #[error("unexpected command output from pod {pod}: {message}")]
    UnexpectedOutput { pod: String, message: String },

    /// No healthy replica was available for promotion
    #[error("no healthy replica available for promotion")]
    NoPromotionCandidate,
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_replicas_display() {
        let err = OperatorError::InvalidReplicas(0);
        assert!(err.to_string().contains("invalid replica count: 0"));
    }

    #[test]
    fn test_exec_failed_display() {
        let err = OperatorError::ExecFailed {
            pod: "mysql-02".to_string(),
            message: "command terminated with non-zero exit code".to_string(),
        };
        assert!(err.to_string().contains("mysql-02"));
        assert!(err.to_string().contains("non-zero exit code"));
    }

    #[test]
    fn test_no_promotion_candidate_display() {
        let err = OperatorError::NoPromotionCandidate;
        assert!(err.to_string().contains("no healthy replica"));
    }
}
