//! Volume claims and the resources of members removed from the topology.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::{DeploymentFacts, PodInspector, Tick};
use crate::interval::RECHECK_FINALIZER_INTERVAL;
use crate::member::DeploymentStatus;
use crate::metrics;
use crate::resources::pods::is_marked_for_deletion;

impl PodInspector {
    /// Run the member-exists guard on every claim being deleted.
    pub(super) async fn inspect_pvcs(
        &self,
        deployment: &DeploymentFacts,
        status: &DeploymentStatus,
        pvcs: &[PersistentVolumeClaim],
        tick: &mut Tick,
    ) {
        for pvc in pvcs {
            if !is_marked_for_deletion(&pvc.metadata) {
                continue;
            }
            let name = pvc.name_any();
            let member = status.member_by_pvc_name(&name);

            let outcome = self
                .engine
                .run_pvc_finalizers(self.resources.as_ref(), pvc, member, deployment.deleting)
                .await;
            tick.reduce(outcome.interval);

            if !outcome.removed.is_empty() {
                info!(pvc = %name, finalizers = ?outcome.removed, "Removed volume claim finalizers");
            }
            for (finalizer, reason) in &outcome.denied {
                debug!(pvc = %name, finalizer = %finalizer, reason = %reason, "Cannot remove volume claim finalizer yet");
            }
        }
    }

    /// Request deletion of whatever a removed member still has, and forget
    /// the member once nothing is left.
    pub(super) async fn cleanup_removed_members(
        &self,
        status: &mut DeploymentStatus,
        pods: &[Pod],
        pvcs: &[PersistentVolumeClaim],
        tick: &mut Tick,
    ) {
        let mut gone = Vec::new();

        for member in &status.removed_members {
            let pod = member
                .pod_name
                .as_deref()
                .and_then(|name| pods.iter().find(|p| p.name_any() == name));
            let pvc = member
                .persistent_volume_claim_name
                .as_deref()
                .and_then(|name| pvcs.iter().find(|p| p.name_any() == name));

            if pod.is_none() && pvc.is_none() {
                gone.push(member.id.clone());
                continue;
            }

            if let Some(pod) = pod.filter(|p| !is_marked_for_deletion(&p.metadata)) {
                if let Err(e) = self.resources.request_pod_deletion(&pod.name_any()).await {
                    warn!(member = %member.id, error = %e, "Failed to request pod deletion");
                    metrics::record_error(e.kind());
                }
            }
            if let Some(pvc) = pvc.filter(|p| !is_marked_for_deletion(&p.metadata)) {
                if let Err(e) = self.resources.request_pvc_deletion(&pvc.name_any()).await {
                    warn!(member = %member.id, error = %e, "Failed to request volume claim deletion");
                    metrics::record_error(e.kind());
                }
            }
            tick.reduce(RECHECK_FINALIZER_INTERVAL);
        }

        for id in gone {
            info!(member = %id, "Resources of removed member are gone");
            status.drop_removed_member(&id);
        }
    }
}
