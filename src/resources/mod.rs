//! Access to the pods, volume claims and nodes of a deployment.
//!
//! The operator never deletes these resources outright. It removes its own
//! finalizers and, for members taken out of the topology, requests deletion;
//! the API server only removes an object once no finalizer remains.

#[cfg(any(test, feature = "test-helpers"))]
mod fixtures;
mod k8s;
#[cfg(any(test, feature = "test-helpers"))]
mod memory;
pub mod pods;

#[cfg(any(test, feature = "test-helpers"))]
pub use fixtures::{node, PodBuilder, PvcBuilder};
pub use k8s::KubeResourceStore;
#[cfg(any(test, feature = "test-helpers"))]
pub use memory::MemoryResourceStore;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::error::Result;

/// Label carrying the name of the owning deployment.
pub const LABEL_DEPLOYMENT: &str = "dbcluster.io/deployment";
/// Label carrying the member role.
pub const LABEL_ROLE: &str = "dbcluster.io/role";
/// Role label value of auxiliary image discovery pods.
pub const ROLE_IMAGE_DISCOVERY: &str = "id";

/// Resource store of one deployment.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// All pods of the deployment.
    async fn list_pods(&self) -> Result<Vec<Pod>>;

    /// All volume claims of the deployment.
    async fn list_pvcs(&self) -> Result<Vec<PersistentVolumeClaim>>;

    /// A node by name.
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// A volume claim of the deployment by name.
    async fn get_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    /// Remove the given finalizers from a pod in one patch.
    async fn remove_pod_finalizers(&self, pod: &Pod, finalizers: &[String]) -> Result<()>;

    /// Remove the given finalizers from a volume claim in one patch.
    async fn remove_pvc_finalizers(
        &self,
        pvc: &PersistentVolumeClaim,
        finalizers: &[String],
    ) -> Result<()>;

    /// Ask the API server to delete a pod. Finalizers keep it in place until
    /// they are released.
    async fn request_pod_deletion(&self, name: &str) -> Result<()>;

    /// Ask the API server to delete a volume claim.
    async fn request_pvc_deletion(&self, name: &str) -> Result<()>;
}

/// Finalizers of `meta` without the ones in `remove`.
pub fn remaining_finalizers(meta: &ObjectMeta, remove: &[String]) -> Vec<String> {
    meta.finalizers
        .iter()
        .flatten()
        .filter(|f| !remove.contains(f))
        .cloned()
        .collect()
}
