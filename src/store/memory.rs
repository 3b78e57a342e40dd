use async_trait::async_trait;
use parking_lot::Mutex;

use super::{StatusStore, StatusVersion};
use crate::error::{OperatorError, Result};
use crate::member::DeploymentStatus;

/// Counter-versioned status store kept in process memory.
pub struct InMemoryStatusStore {
    inner: Mutex<Versioned>,
}

struct Versioned {
    status: DeploymentStatus,
    version: u64,
    writes: usize,
}

impl InMemoryStatusStore {
    /// Create a store holding `status` at version 1.
    pub fn new(status: DeploymentStatus) -> Self {
        Self {
            inner: Mutex::new(Versioned {
                status,
                version: 1,
                writes: 0,
            }),
        }
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.inner.lock().writes
    }

    /// Copy of the stored status.
    pub fn snapshot(&self) -> DeploymentStatus {
        self.inner.lock().status.clone()
    }

    /// Overwrite the stored status, bumping the version.
    pub fn replace(&self, status: DeploymentStatus) {
        let mut inner = self.inner.lock();
        inner.status = status;
        inner.version += 1;
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn get_status(&self) -> Result<(DeploymentStatus, StatusVersion)> {
        let inner = self.inner.lock();
        Ok((inner.status.clone(), StatusVersion(inner.version.to_string())))
    }

    async fn update_status(
        &self,
        status: &DeploymentStatus,
        version: &StatusVersion,
    ) -> Result<StatusVersion> {
        let mut inner = self.inner.lock();
        if inner.version.to_string() != version.0 {
            return Err(OperatorError::Conflict {
                name: "in-memory".to_string(),
            });
        }
        inner.status = status.clone();
        inner.version += 1;
        inner.writes += 1;
        Ok(StatusVersion(inner.version.to_string()))
    }
}
