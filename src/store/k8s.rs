use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use std::time::Duration;
use tracing::debug;

use super::{StatusStore, StatusVersion};
use crate::crd::ClusterDeployment;
use crate::error::{with_timeout, OperatorError, Result};
use crate::member::DeploymentStatus;

/// Status store backed by the `ClusterDeployment` status subresource.
///
/// The object's `resourceVersion` is the status version; the API server
/// rejects a patch carrying a stale one with 409.
pub struct KubeStatusStore {
    api: Api<ClusterDeployment>,
    name: String,
    timeout: Duration,
}

impl KubeStatusStore {
    pub fn new(api: Api<ClusterDeployment>, name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            api,
            name: name.into(),
            timeout,
        }
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn get_status(&self) -> Result<(DeploymentStatus, StatusVersion)> {
        let obj = with_timeout(self.timeout, "deployment status read", async {
            Ok(self.api.get_status(&self.name).await?)
        })
        .await?;

        let version = StatusVersion(obj.resource_version().unwrap_or_default());
        Ok((obj.status.unwrap_or_default(), version))
    }

    async fn update_status(
        &self,
        status: &DeploymentStatus,
        version: &StatusVersion,
    ) -> Result<StatusVersion> {
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": version.0 },
            "status": status,
        });

        let result = with_timeout(self.timeout, "deployment status write", async {
            Ok(self
                .api
                .patch_status(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?)
        })
        .await;

        match result {
            Ok(obj) => {
                debug!(name = %self.name, "Status updated");
                Ok(StatusVersion(obj.resource_version().unwrap_or_default()))
            }
            Err(e) if e.is_conflict() => Err(OperatorError::Conflict {
                name: self.name.clone(),
            }),
            Err(e) => Err(e),
        }
    }
}
