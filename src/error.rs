//! Error types for the cluster operator.
//!
//! All fallible operations return [`OperatorError`] through the [`Result`]
//! alias. Guards that legitimately refuse a removal do not produce an error:
//! they return [`GuardDecision::Denied`](crate::guards::GuardDecision).
//!
//! # Error Categories
//!
//! - **Transient**: Kubernetes / cluster API failures, timeouts and status
//!   version conflicts. The reconciliation tick is retried from a fresh read.
//! - **Permanent**: invalid configuration or malformed state. Retrying without
//!   a change will fail the same way.

use thiserror::Error;

/// Main error type for the operator.
#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Cluster API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Status of {name} was modified concurrently")]
    Conflict { name: String },

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Cluster API error: {0}")]
    Cluster(String),

    #[error("Agency is not healthy: {0}")]
    AgencyUnhealthy(String),

    #[error("Cluster health is not available: {0}")]
    HealthUnavailable(String),

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for operator operations.
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Returns true if the failed operation may succeed on the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::Kube(_)
                | OperatorError::Http(_)
                | OperatorError::Conflict { .. }
                | OperatorError::Timeout(_)
                | OperatorError::Cluster(_)
                | OperatorError::AgencyUnhealthy(_)
                | OperatorError::HealthUnavailable(_)
        )
    }

    /// Returns true if the error is an optimistic concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        match self {
            OperatorError::Conflict { .. } => true,
            OperatorError::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Returns true if the Kubernetes API reported the object as missing.
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound(_) | OperatorError::MemberNotFound(_) => true,
            OperatorError::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            OperatorError::Kube(_) => "kube",
            OperatorError::Http(_) => "http",
            OperatorError::Conflict { .. } => "conflict",
            OperatorError::Timeout(_) => "timeout",
            OperatorError::Cluster(_) => "cluster",
            OperatorError::AgencyUnhealthy(_) => "agency_unhealthy",
            OperatorError::HealthUnavailable(_) => "health_unavailable",
            OperatorError::MemberNotFound(_) => "member_not_found",
            OperatorError::NotFound(_) => "not_found",
            OperatorError::InvalidConfig { .. } | OperatorError::Config(_) => "config",
            OperatorError::Serialization(_) => "serialization",
            OperatorError::Internal(_) => "internal",
        }
    }
}

/// Runs `fut` with an upper bound on its duration.
///
/// Every call that leaves the process (Kubernetes or cluster API) goes through
/// this helper so a hanging peer cannot stall a reconciliation tick.
pub async fn with_timeout<T, F>(limit: std::time::Duration, what: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(OperatorError::Timeout(what.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retryable_classification() {
        assert!(OperatorError::Conflict { name: "db".into() }.is_retryable());
        assert!(OperatorError::Timeout("health".into()).is_retryable());
        assert!(!OperatorError::Config("bad".into()).is_retryable());
        assert!(!OperatorError::MemberNotFound("PRMR-1".into()).is_retryable());
    }

    #[test]
    fn test_conflict_detection() {
        assert!(OperatorError::Conflict { name: "db".into() }.is_conflict());
        assert!(!OperatorError::Internal("x".into()).is_conflict());
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<()> = with_timeout(Duration::from_millis(10), "sleeper", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(OperatorError::Timeout(what)) if what == "sleeper"));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result() {
        let result = with_timeout(Duration::from_secs(1), "fast", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
