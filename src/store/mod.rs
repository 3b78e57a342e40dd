//! Versioned persistence of [`DeploymentStatus`].
//!
//! Every write carries the version the status was read at. A mismatch is
//! rejected with [`OperatorError::Conflict`] and the caller starts over from
//! a fresh read; writes are never merged.

mod k8s;
#[cfg(any(test, feature = "test-helpers"))]
mod memory;

pub use self::k8s::KubeStatusStore;
#[cfg(any(test, feature = "test-helpers"))]
pub use self::memory::InMemoryStatusStore;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{OperatorError, Result};
use crate::member::DeploymentStatus;

/// Attempts made by [`apply`] before giving up on conflicts.
pub const MAX_APPLY_ATTEMPTS: usize = 5;

/// Opaque version of a persisted status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StatusVersion(pub String);

impl std::fmt::Display for StatusVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage of a deployment's status.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Read the current status and its version.
    async fn get_status(&self) -> Result<(DeploymentStatus, StatusVersion)>;

    /// Write `status` if the stored version still equals `version`.
    /// Returns the new version.
    async fn update_status(
        &self,
        status: &DeploymentStatus,
        version: &StatusVersion,
    ) -> Result<StatusVersion>;
}

/// Read-modify-write the status, retrying on version conflicts.
///
/// `mutator` runs against a fresh read on every attempt and returns whether it
/// changed anything; when it returns false nothing is written. Returns true if
/// a write happened.
pub async fn apply<S, F>(store: &S, mut mutator: F) -> Result<bool>
where
    S: StatusStore + ?Sized,
    F: FnMut(&mut DeploymentStatus) -> bool + Send,
{
    let mut last_conflict = None;

    for attempt in 1..=MAX_APPLY_ATTEMPTS {
        let (mut status, version) = store.get_status().await?;
        if !mutator(&mut status) {
            return Ok(false);
        }

        match store.update_status(&status, &version).await {
            Ok(_) => return Ok(true),
            Err(e) if e.is_conflict() => {
                debug!(attempt, version = %version, "Status conflict, retrying from a fresh read");
                last_conflict = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_conflict.unwrap_or_else(|| OperatorError::Internal("apply made no attempt".into())))
}
