use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use parking_lot::Mutex;
use std::collections::BTreeMap;

use super::{remaining_finalizers, ResourceStore};
use crate::error::{OperatorError, Result};

/// Resource store kept in process memory.
///
/// Mirrors the API server's deletion semantics: a delete request sets the
/// deletion timestamp, and an object marked for deletion disappears once its
/// last finalizer is removed.
#[derive(Default)]
pub struct MemoryResourceStore {
    inner: Mutex<Objects>,
}

#[derive(Default)]
struct Objects {
    pods: BTreeMap<String, Pod>,
    pvcs: BTreeMap<String, PersistentVolumeClaim>,
    nodes: BTreeMap<String, Node>,
    finalizer_patches: usize,
    deletion_requests: Vec<String>,
    unavailable: bool,
}

fn name_of(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

fn mark_deleted(meta: &mut ObjectMeta) {
    if meta.deletion_timestamp.is_none() {
        meta.deletion_timestamp = Some(Time(Utc::now()));
    }
}

fn gone(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some() && meta.finalizers.as_ref().map_or(true, |f| f.is_empty())
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pod(&self, pod: Pod) {
        self.inner.lock().pods.insert(name_of(&pod.metadata), pod);
    }

    pub fn insert_pvc(&self, pvc: PersistentVolumeClaim) {
        self.inner.lock().pvcs.insert(name_of(&pvc.metadata), pvc);
    }

    pub fn insert_node(&self, node: Node) {
        self.inner.lock().nodes.insert(name_of(&node.metadata), node);
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.inner.lock().pods.get(name).cloned()
    }

    pub fn pvc(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.inner.lock().pvcs.get(name).cloned()
    }

    /// Finalizers currently on a pod; empty if the pod does not exist.
    pub fn pod_finalizers(&self, name: &str) -> Vec<String> {
        self.pod(name)
            .and_then(|p| p.metadata.finalizers)
            .unwrap_or_default()
    }

    /// Finalizers currently on a volume claim; empty if it does not exist.
    pub fn pvc_finalizers(&self, name: &str) -> Vec<String> {
        self.pvc(name)
            .and_then(|p| p.metadata.finalizers)
            .unwrap_or_default()
    }

    /// Number of finalizer patches applied.
    pub fn finalizer_patches(&self) -> usize {
        self.inner.lock().finalizer_patches
    }

    /// Names passed to deletion requests, in order.
    pub fn deletion_requests(&self) -> Vec<String> {
        self.inner.lock().deletion_requests.clone()
    }

    /// Make every call fail as if the API server were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.lock().unavailable {
            return Err(OperatorError::Timeout("resource store".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn list_pods(&self) -> Result<Vec<Pod>> {
        self.check_available()?;
        Ok(self.inner.lock().pods.values().cloned().collect())
    }

    async fn list_pvcs(&self) -> Result<Vec<PersistentVolumeClaim>> {
        self.check_available()?;
        Ok(self.inner.lock().pvcs.values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        self.check_available()?;
        Ok(self.inner.lock().nodes.get(name).cloned())
    }

    async fn get_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        self.check_available()?;
        Ok(self.pvc(name))
    }

    async fn remove_pod_finalizers(&self, pod: &Pod, finalizers: &[String]) -> Result<()> {
        self.check_available()?;
        let name = name_of(&pod.metadata);
        let mut inner = self.inner.lock();
        let stored = inner
            .pods
            .get_mut(&name)
            .ok_or_else(|| OperatorError::NotFound(name.clone()))?;

        let remaining = remaining_finalizers(&stored.metadata, finalizers);
        stored.metadata.finalizers = Some(remaining);
        if gone(&stored.metadata) {
            inner.pods.remove(&name);
        }
        inner.finalizer_patches += 1;
        Ok(())
    }

    async fn remove_pvc_finalizers(
        &self,
        pvc: &PersistentVolumeClaim,
        finalizers: &[String],
    ) -> Result<()> {
        self.check_available()?;
        let name = name_of(&pvc.metadata);
        let mut inner = self.inner.lock();
        let stored = inner
            .pvcs
            .get_mut(&name)
            .ok_or_else(|| OperatorError::NotFound(name.clone()))?;

        let remaining = remaining_finalizers(&stored.metadata, finalizers);
        stored.metadata.finalizers = Some(remaining);
        if gone(&stored.metadata) {
            inner.pvcs.remove(&name);
        }
        inner.finalizer_patches += 1;
        Ok(())
    }

    async fn request_pod_deletion(&self, name: &str) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.deletion_requests.push(name.to_string());
        if let Some(pod) = inner.pods.get_mut(name) {
            mark_deleted(&mut pod.metadata);
            if gone(&pod.metadata) {
                inner.pods.remove(name);
            }
        }
        Ok(())
    }

    async fn request_pvc_deletion(&self, name: &str) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.deletion_requests.push(name.to_string());
        if let Some(pvc) = inner.pvcs.get_mut(name) {
            mark_deleted(&mut pvc.metadata);
            if gone(&pvc.metadata) {
                inner.pvcs.remove(name);
            }
        }
        Ok(())
    }
}
