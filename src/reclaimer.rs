//! Removal of members the cluster no longer knows about.
//!
//! Data-servers and coordinators that vanished from the cluster's health view
//! are taken out of the topology. A member that was never seen is given
//! `min_member_age` to show up first. Decisions are only made on a fresh
//! health snapshot.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cluster_api::ClusterHealth;
use crate::config::ReclaimConfig;
use crate::error::Result;
use crate::events::{DeploymentEvent, EventSink};
use crate::health_cache::ClusterHealthCache;
use crate::member::{ConditionType, DeploymentMode, DeploymentStatus, MemberStatus};
use crate::metrics;
use crate::resources::ResourceStore;
use crate::shutdown::ShutdownCoordinator;
use crate::store::{self, StatusStore};

/// Outcome of one reclaim pass.
#[derive(Debug, Default)]
pub struct ReclaimReport {
    /// No fresh health snapshot was available; nothing was decided.
    pub skipped: bool,
    /// Members newly confirmed as part of the cluster.
    pub confirmed: Vec<String>,
    /// Members taken out of the topology.
    pub removed: Vec<MemberStatus>,
}

/// Periodic reclamation of stale members of one deployment.
pub struct StaleMemberReclaimer {
    deployment: String,
    mode: DeploymentMode,
    status: Arc<dyn StatusStore>,
    resources: Arc<dyn ResourceStore>,
    cache: Arc<ClusterHealthCache>,
    max_health_age: Duration,
    config: ReclaimConfig,
}

impl StaleMemberReclaimer {
    pub fn new(
        deployment: impl Into<String>,
        mode: DeploymentMode,
        status: Arc<dyn StatusStore>,
        resources: Arc<dyn ResourceStore>,
        cache: Arc<ClusterHealthCache>,
        max_health_age: Duration,
        config: ReclaimConfig,
    ) -> Self {
        Self {
            deployment: deployment.into(),
            mode,
            status,
            resources,
            cache,
            max_health_age,
            config,
        }
    }

    /// Run one pass at `now`. Fails with a not-found error once the
    /// deployment itself is gone.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReclaimReport> {
        self.status.get_status().await?;
        if self.mode != DeploymentMode::Cluster {
            return Ok(ReclaimReport::default());
        }

        let snapshot = match self.cache.fresh_snapshot(self.max_health_age, now) {
            Ok(s) => s,
            Err(e) => {
                debug!(deployment = %self.deployment, reason = %e, "Skipping member reclaim");
                return Ok(ReclaimReport {
                    skipped: true,
                    ..Default::default()
                });
            }
        };

        let min_age = chrono::Duration::from_std(self.config.min_member_age())
            .unwrap_or_else(|_| chrono::Duration::zero());

        let mut report = ReclaimReport::default();
        store::apply(self.status.as_ref(), |status| {
            report = sync_members(status, &snapshot.health, min_age, now);
            !report.confirmed.is_empty() || !report.removed.is_empty()
        })
        .await?;

        for member in &report.removed {
            info!(
                deployment = %self.deployment,
                member = %member.id,
                group = %member.group,
                "Member no longer part of the cluster, removed"
            );
            metrics::record_member_removed(&self.deployment, member.group.as_role());
            self.delete_resources(member).await;
        }

        Ok(report)
    }

    /// Ask for deletion of the member's pod and claim. Failures are retried
    /// by the inspector through the removed member entry.
    async fn delete_resources(&self, member: &MemberStatus) {
        if let Some(pod) = &member.pod_name {
            if let Err(e) = self.resources.request_pod_deletion(pod).await {
                warn!(member = %member.id, pod = %pod, error = %e, "Failed to delete pod of removed member");
            }
        }
        if let Some(pvc) = &member.persistent_volume_claim_name {
            if let Err(e) = self.resources.request_pvc_deletion(pvc).await {
                warn!(member = %member.id, pvc = %pvc, error = %e, "Failed to delete claim of removed member");
            }
        }
    }
}

fn sync_members(
    status: &mut DeploymentStatus,
    health: &ClusterHealth,
    min_age: chrono::Duration,
    now: DateTime<Utc>,
) -> ReclaimReport {
    let mut report = ReclaimReport::default();
    let mut stale = Vec::new();

    for member in status.members.iter_mut().filter(|m| m.group.is_reclaimable()) {
        if health.contains(&member.id) {
            if member
                .conditions
                .update(ConditionType::MemberOfCluster, true, "Member Found", "")
            {
                report.confirmed.push(member.id.clone());
            }
            continue;
        }

        if member.conditions.is_true(ConditionType::MemberOfCluster) || member.age(now) >= min_age {
            stale.push(member.id.clone());
        } else {
            debug!(member = %member.id, "Member not yet in the cluster, too young to remove");
        }
    }

    for id in stale {
        if let Some(removed) = status.remove_member(&id) {
            report.removed.push(removed.clone());
        }
    }
    report
}

/// Run the reclaimer every `period` until `shutdown` fires. When the
/// deployment is gone the loop raises `shutdown` itself, which also stops
/// every other loop sharing it.
pub async fn run_reclaim_loop(
    reclaimer: Arc<StaleMemberReclaimer>,
    events: Arc<dyn EventSink>,
    period: Duration,
    shutdown: ShutdownCoordinator,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait_for_shutdown() => {
                debug!(deployment = %reclaimer.deployment, "Reclaim loop stopped");
                return;
            }
        }

        match reclaimer.run_once(Utc::now()).await {
            Ok(report) => {
                for member in report.removed {
                    events
                        .publish(&DeploymentEvent::MemberRemoved {
                            member: member.id,
                            role: member.group.as_role().to_string(),
                        })
                        .await;
                }
            }
            Err(e) if e.is_not_found() => {
                info!(deployment = %reclaimer.deployment, "Deployment is gone, stopping its loops");
                shutdown.shutdown();
                return;
            }
            Err(e) => {
                warn!(deployment = %reclaimer.deployment, error = %e, "Member reclaim failed");
                metrics::record_error(e.kind());
            }
        }
    }
}
