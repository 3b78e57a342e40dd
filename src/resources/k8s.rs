use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, info};

use super::{remaining_finalizers, ResourceStore, LABEL_DEPLOYMENT};
use crate::error::{with_timeout, OperatorError, Result};

/// Resource store over the Kubernetes API, scoped to one deployment by label.
pub struct KubeResourceStore {
    pods: Api<Pod>,
    pvcs: Api<PersistentVolumeClaim>,
    nodes: Api<Node>,
    selector: String,
    timeout: Duration,
}

impl KubeResourceStore {
    pub fn new(client: Client, namespace: &str, deployment: &str, timeout: Duration) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), namespace),
            pvcs: Api::namespaced(client.clone(), namespace),
            nodes: Api::all(client),
            selector: format!("{}={}", LABEL_DEPLOYMENT, deployment),
            timeout,
        }
    }

    async fn remove_finalizers<K>(&self, api: &Api<K>, obj: &K, finalizers: &[String]) -> Result<()>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        let name = obj.name_any();
        let remaining = remaining_finalizers(obj.meta(), finalizers);
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": obj.resource_version(),
                "finalizers": remaining,
            }
        });

        let result = with_timeout(self.timeout, "finalizer patch", async {
            Ok(api
                .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?)
        })
        .await;

        match result {
            Ok(_) => {
                info!(resource = %name, removed = ?finalizers, "Removed finalizers");
                Ok(())
            }
            Err(e) if e.is_conflict() => Err(OperatorError::Conflict { name }),
            Err(e) => Err(e),
        }
    }

    async fn request_deletion<K>(&self, api: &Api<K>, name: &str) -> Result<()>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        let result = with_timeout(self.timeout, "delete request", async {
            Ok(api.delete(name, &DeleteParams::default()).await?)
        })
        .await;

        match result {
            Ok(_) => {
                debug!(resource = %name, "Deletion requested");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn list_pods(&self) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(&self.selector);
        with_timeout(self.timeout, "pod list", async {
            Ok(self.pods.list(&lp).await?.items)
        })
        .await
    }

    async fn list_pvcs(&self) -> Result<Vec<PersistentVolumeClaim>> {
        let lp = ListParams::default().labels(&self.selector);
        with_timeout(self.timeout, "volume claim list", async {
            Ok(self.pvcs.list(&lp).await?.items)
        })
        .await
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        with_timeout(self.timeout, "node read", async {
            Ok(self.nodes.get_opt(name).await?)
        })
        .await
    }

    async fn get_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        with_timeout(self.timeout, "volume claim read", async {
            Ok(self.pvcs.get_opt(name).await?)
        })
        .await
    }

    async fn remove_pod_finalizers(&self, pod: &Pod, finalizers: &[String]) -> Result<()> {
        self.remove_finalizers(&self.pods, pod, finalizers).await
    }

    async fn remove_pvc_finalizers(
        &self,
        pvc: &PersistentVolumeClaim,
        finalizers: &[String],
    ) -> Result<()> {
        self.remove_finalizers(&self.pvcs, pvc, finalizers).await
    }

    async fn request_pod_deletion(&self, name: &str) -> Result<()> {
        self.request_deletion(&self.pods, name).await
    }

    async fn request_pvc_deletion(&self, name: &str) -> Result<()> {
        self.request_deletion(&self.pvcs, name).await
    }
}
