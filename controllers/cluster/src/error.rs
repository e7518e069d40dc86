//! Controller-specific error types.
//!
//! The orchestrator only distinguishes `FailedDependency` from everything
//! else; the scheduler glue additionally asks `is_retryable()` to decide
//! between backoff and waiting for the next change.

use cloud_client::CloudError;
use kube::Error as KubeError;
use std::time::Duration;
use thiserror::Error;

use crate::metrics::MetricsError;

/// Errors that can occur in the cluster infrastructure controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Cloud API error, wrapped with the operation that failed
    #[error("failed to {operation}: {source}")]
    Cloud {
        /// What was being attempted, e.g. "create VPC for default/prod"
        operation: String,
        /// Underlying provider error
        #[source]
        source: CloudError,
    },

    /// Precondition that cannot be satisfied yet (missing subnet, security
    /// groups not converged, load balancer not available)
    #[error("failed dependency: {0}")]
    FailedDependency(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Machine role this controller does not know about
    #[error("unknown machine role {0:?}")]
    UnknownRole(String),

    /// Object changed since it was read; the in-memory status is discarded
    #[error("conflict persisting {0}: object was modified concurrently")]
    Conflict(String),

    /// No image matched the lookup
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Bounded wait expired, wrapped with the wait that was attempted
    #[error("failed to {operation}: timed out after {waited:?}")]
    Timeout {
        /// What was being waited for, e.g. "wait for instance i-1 to terminate"
        operation: String,
        /// How long the wait lasted
        waited: Duration,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Whether this is an expected, not-yet-satisfiable precondition
    #[must_use]
    pub fn is_failed_dependency(&self) -> bool {
        matches!(self, ControllerError::FailedDependency(_))
    }

    /// Whether retrying the same spec can succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ControllerError::UnknownRole(_) | ControllerError::InvalidConfig(_)
        )
    }
}

/// Wraps cloud errors with the operation that produced them.
pub(crate) trait CloudResultExt<T> {
    fn with_operation<F>(self, operation: F) -> Result<T, ControllerError>
    where
        F: FnOnce() -> String;
}

impl<T> CloudResultExt<T> for Result<T, CloudError> {
    fn with_operation<F>(self, operation: F) -> Result<T, ControllerError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|source| ControllerError::Cloud {
            operation: operation(),
            source,
        })
    }
}

/// Treats "not found" on delete as success.
pub(crate) fn ignore_not_found(result: Result<(), CloudError>) -> Result<(), CloudError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ControllerError::FailedDependency("x".into()).is_failed_dependency());
        assert!(ControllerError::FailedDependency("x".into()).is_retryable());
        assert!(!ControllerError::UnknownRole("x".into()).is_retryable());
        assert!(!ControllerError::InvalidConfig("x".into()).is_retryable());
        assert!(ControllerError::Conflict("ns/a".into()).is_retryable());
        assert!(!ControllerError::Conflict("ns/a".into()).is_failed_dependency());
    }

    #[test]
    fn test_with_operation_wraps_context() {
        let result: Result<(), CloudError> = Err(CloudError::api("Throttling", "slow down"));
        let err = result.with_operation(|| "describe subnets".to_string()).unwrap_err();
        assert_eq!(err.to_string(), "failed to describe subnets: cloud API error (Throttling): slow down");
    }

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found(Err(CloudError::NotFound("gone".into()))).is_ok());
        assert!(ignore_not_found(Err(CloudError::api("X", "y"))).is_err());
    }
}
