use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{MemberEffect, ObservedFacts, PodGuard, Verdict, FINALIZER_AGENCY_SERVING};
use crate::cluster_api::ClusterControl;
use crate::error::with_timeout;
use crate::member::ConditionType;

/// Keeps an agent's pod while losing its data would endanger agency quorum.
pub struct AgencyServingGuard {
    cluster: Arc<dyn ClusterControl>,
    timeout: Duration,
}

impl AgencyServingGuard {
    pub fn new(cluster: Arc<dyn ClusterControl>, timeout: Duration) -> Self {
        Self { cluster, timeout }
    }
}

#[async_trait]
impl PodGuard for AgencyServingGuard {
    fn finalizer(&self) -> &'static str {
        FINALIZER_AGENCY_SERVING
    }

    async fn evaluate(&self, facts: &ObservedFacts<'_>) -> Verdict {
        let member = &facts.member.id;

        if facts.member.phase.is_failed() {
            debug!(member = %member, "Member failed, agency finalizer can go");
            return Verdict::approve();
        }
        if facts.deployment_deleting {
            debug!(member = %member, "Deployment is being deleted, agency finalizer can go");
            return Verdict::approve();
        }

        if facts.pvc.is_none() {
            return Verdict::deny("volume claim of the agent not found");
        }

        let data_at_risk = facts.node_unschedulable || facts.pvc_marked_for_deletion();
        if !data_at_risk {
            debug!(member = %member, "Agent is only restarting, agency finalizer can go");
            return Verdict::approve();
        }

        debug!(member = %member, "Agent data will be gone, checking agency health");
        let healthy = with_timeout(
            self.timeout,
            "agency health",
            self.cluster.agency_healthy(member),
        )
        .await;

        match healthy {
            Ok(()) => {
                info!(member = %member, "Agency stays healthy without agent, full recovery needed on recreate");
                Verdict::approve().with_effect(MemberEffect::condition(
                    ConditionType::AgentRecoveryNeeded,
                    "Data Gone",
                ))
            }
            Err(e) => {
                debug!(member = %member, error = %e, "Agency not healthy enough to lose agent");
                Verdict::deny(format!("agency is not healthy: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_api::ScriptedClusterControl;
    use crate::guards::GuardDecision;
    use crate::member::{MemberPhase, MemberStatus, ServerGroup};
    use crate::resources::{PodBuilder, PvcBuilder};
    use chrono::Utc;

    fn cluster(others_alive: bool) -> Arc<ScriptedClusterControl> {
        let cluster = Arc::new(ScriptedClusterControl::new());
        cluster.set_member("AGNT-1", ServerGroup::Agents, true);
        cluster.set_member("AGNT-2", ServerGroup::Agents, others_alive);
        cluster.set_member("AGNT-3", ServerGroup::Agents, true);
        cluster
    }

    async fn evaluate(
        guard: &AgencyServingGuard,
        member: &MemberStatus,
        node_unschedulable: bool,
        pvc_deleted: bool,
    ) -> Verdict {
        let pod = PodBuilder::new("db-agnt-1", "db", ServerGroup::Agents)
            .marked_for_deletion(Utc::now())
            .build();
        let mut pvc = PvcBuilder::new("db-agnt-1-data", "db");
        if pvc_deleted {
            pvc = pvc.marked_for_deletion(Utc::now());
        }
        let pvc = pvc.build();
        let facts = ObservedFacts {
            pod: &pod,
            member,
            pvc: Some(&pvc),
            node_unschedulable,
            deployment_deleting: false,
            network_attached_volumes: false,
            shutdown_delay: Duration::ZERO,
            server_dead: false,
            now: Utc::now(),
        };
        guard.evaluate(&facts).await
    }

    fn agent() -> MemberStatus {
        MemberStatus::new("AGNT-1", ServerGroup::Agents, Utc::now())
            .with_pod("db-agnt-1")
            .with_pvc("db-agnt-1-data")
            .with_phase(MemberPhase::Created)
    }

    #[tokio::test]
    async fn test_restart_is_approved_without_health_check() {
        let cluster = cluster(false);
        let guard = AgencyServingGuard::new(cluster.clone(), Duration::from_secs(1));

        let verdict = evaluate(&guard, &agent(), false, false).await;

        assert_eq!(verdict, Verdict::approve());
        assert_eq!(cluster.health_calls(), 0);
    }

    #[tokio::test]
    async fn test_cordoned_node_with_healthy_agency() {
        let guard = AgencyServingGuard::new(cluster(true), Duration::from_secs(1));

        let verdict = evaluate(&guard, &agent(), true, false).await;

        assert!(verdict.decision.is_approved());
        assert_eq!(
            verdict.effects,
            vec![MemberEffect::condition(ConditionType::AgentRecoveryNeeded, "Data Gone")]
        );
    }

    #[tokio::test]
    async fn test_unhealthy_agency_denies() {
        let guard = AgencyServingGuard::new(cluster(false), Duration::from_secs(1));

        let verdict = evaluate(&guard, &agent(), false, true).await;

        assert!(matches!(verdict.decision, GuardDecision::Denied(_)));
        assert!(verdict.effects.is_empty());
    }

    #[tokio::test]
    async fn test_health_error_denies() {
        let cluster = cluster(true);
        cluster.fail_health(Some("timeout"));
        let guard = AgencyServingGuard::new(cluster, Duration::from_secs(1));

        let verdict = evaluate(&guard, &agent(), true, false).await;

        assert!(!verdict.decision.is_approved());
    }

    #[tokio::test]
    async fn test_failed_member_is_approved() {
        let cluster = cluster(false);
        cluster.fail_health(Some("down"));
        let guard = AgencyServingGuard::new(cluster, Duration::from_secs(1));
        let member = agent().with_phase(MemberPhase::Failed);

        assert_eq!(evaluate(&guard, &member, true, true).await, Verdict::approve());
    }
}
