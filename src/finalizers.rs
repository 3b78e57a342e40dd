//! Dispatch of pod and volume claim finalizers to their guards.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cluster_api::ClusterControl;
use crate::guards::{
    member_exists, AgencyServingGuard, DelayGuard, DrainGuard, GracefulShutdownGuard,
    GuardDecision, MemberEffect, ObservedFacts, PodGuard, FINALIZER_MEMBER_EXISTS,
};
use crate::interval::{
    Interval, FINALIZER_REMOVED_INTERVAL, RECHECK_FINALIZER_INTERVAL, RECHECK_SOON_INTERVAL,
};
use crate::member::{MemberLocation, MemberStatus};
use crate::metrics;
use crate::resources::ResourceStore;

/// Result of evaluating the finalizers of one resource.
#[derive(Debug)]
pub struct FinalizerOutcome {
    /// Finalizers removed from the resource.
    pub removed: Vec<String>,
    /// Finalizers kept, with the guard's reason.
    pub denied: Vec<(String, String)>,
    /// Member status changes requested by the guards.
    pub effects: Vec<MemberEffect>,
    /// When to look at the resource again.
    pub interval: Interval,
}

impl FinalizerOutcome {
    fn empty() -> Self {
        Self {
            removed: Vec::new(),
            denied: Vec::new(),
            effects: Vec::new(),
            interval: RECHECK_FINALIZER_INTERVAL,
        }
    }
}

enum Target<'a> {
    Pod(&'a Pod),
    Pvc(&'a PersistentVolumeClaim),
}

/// Maps finalizer names to guards and removes the approved ones.
pub struct FinalizerEngine {
    deployment: String,
    guards: BTreeMap<&'static str, Box<dyn PodGuard>>,
}

impl FinalizerEngine {
    pub fn new(deployment: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            guards: BTreeMap::new(),
        }
    }

    /// Engine with every pod guard the operator places.
    pub fn standard(
        deployment: impl Into<String>,
        cluster: Arc<dyn ClusterControl>,
        timeout: Duration,
    ) -> Self {
        Self::new(deployment)
            .with_guard(AgencyServingGuard::new(cluster.clone(), timeout))
            .with_guard(DrainGuard::new(cluster, timeout))
            .with_guard(GracefulShutdownGuard)
            .with_guard(DelayGuard)
    }

    pub fn with_guard<G: PodGuard + 'static>(mut self, guard: G) -> Self {
        self.guards.insert(guard.finalizer(), Box::new(guard));
        self
    }

    /// Returns true if the finalizer is one the operator owns.
    pub fn owns(&self, finalizer: &str) -> bool {
        finalizer == FINALIZER_MEMBER_EXISTS || self.guards.contains_key(finalizer)
    }

    fn owned_finalizers(&self, finalizers: Option<&Vec<String>>) -> Vec<String> {
        finalizers
            .into_iter()
            .flatten()
            .filter(|f| self.owns(f))
            .cloned()
            .collect()
    }

    /// Evaluate the pod's finalizers without touching the pod.
    pub async fn evaluate_pod(&self, facts: &ObservedFacts<'_>) -> FinalizerOutcome {
        let mut outcome = FinalizerOutcome::empty();

        for finalizer in self.owned_finalizers(facts.pod.metadata.finalizers.as_ref()) {
            if facts.server_dead {
                debug!(member = %facts.member.id, finalizer = %finalizer, "Server container is dead, finalizer can go");
                outcome.removed.push(finalizer);
                continue;
            }

            let Some(guard) = self.guards.get(finalizer.as_str()) else {
                continue;
            };
            let verdict = guard.evaluate(facts).await;
            outcome.effects.extend(verdict.effects);
            match verdict.decision {
                GuardDecision::Approved => outcome.removed.push(finalizer),
                GuardDecision::Denied(reason) => {
                    debug!(member = %facts.member.id, finalizer = %finalizer, reason = %reason, "Cannot remove finalizer yet");
                    outcome.denied.push((finalizer, reason));
                }
            }
        }

        outcome
    }

    /// Evaluate the pod's finalizers and remove the approved ones in a single
    /// patch. A failed patch keeps every finalizer for the next tick.
    pub async fn run_pod_finalizers(
        &self,
        resources: &dyn ResourceStore,
        facts: &ObservedFacts<'_>,
    ) -> FinalizerOutcome {
        let mut outcome = self.evaluate_pod(facts).await;
        outcome.interval = self
            .remove(resources, Target::Pod(facts.pod), &mut outcome)
            .await;
        outcome
    }

    /// Release every operator finalizer of a pod no member owns.
    pub async fn release_orphan_pod(&self, resources: &dyn ResourceStore, pod: &Pod) -> FinalizerOutcome {
        let mut outcome = FinalizerOutcome::empty();
        outcome.removed = self.owned_finalizers(pod.metadata.finalizers.as_ref());
        outcome.interval = self.remove(resources, Target::Pod(pod), &mut outcome).await;
        outcome
    }

    /// Evaluate the member-exists finalizer of a volume claim marked for
    /// deletion and remove it once released.
    pub async fn run_pvc_finalizers(
        &self,
        resources: &dyn ResourceStore,
        pvc: &PersistentVolumeClaim,
        member: Option<(&MemberStatus, MemberLocation)>,
        deployment_deleting: bool,
    ) -> FinalizerOutcome {
        let mut outcome = FinalizerOutcome::empty();

        for finalizer in self.owned_finalizers(pvc.metadata.finalizers.as_ref()) {
            if finalizer != FINALIZER_MEMBER_EXISTS {
                continue;
            }
            match member_exists(member, deployment_deleting) {
                GuardDecision::Approved => outcome.removed.push(finalizer),
                GuardDecision::Denied(reason) => outcome.denied.push((finalizer, reason)),
            }
        }

        outcome.interval = self.remove(resources, Target::Pvc(pvc), &mut outcome).await;
        outcome
    }

    async fn remove(
        &self,
        resources: &dyn ResourceStore,
        target: Target<'_>,
        outcome: &mut FinalizerOutcome,
    ) -> Interval {
        if outcome.removed.is_empty() {
            return RECHECK_FINALIZER_INTERVAL;
        }

        let result = match target {
            Target::Pod(pod) => resources.remove_pod_finalizers(pod, &outcome.removed).await,
            Target::Pvc(pvc) => resources.remove_pvc_finalizers(pvc, &outcome.removed).await,
        };

        match result {
            Ok(()) => {
                metrics::record_finalizers_removed(&self.deployment, &outcome.removed);
                FINALIZER_REMOVED_INTERVAL
            }
            Err(e) => {
                warn!(deployment = %self.deployment, finalizers = ?outcome.removed, error = %e, "Failed to remove finalizers");
                metrics::record_error(e.kind());
                outcome.removed.clear();
                RECHECK_SOON_INTERVAL
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guards::{Verdict, FINALIZER_AGENCY_SERVING, FINALIZER_DELAY, FINALIZER_GRACEFUL_SHUTDOWN};
    use crate::member::ServerGroup;
    use crate::resources::{MemoryResourceStore, PodBuilder};
    use async_trait::async_trait;
    use chrono::Utc;

    struct FixedGuard {
        name: &'static str,
        approve: bool,
    }

    #[async_trait]
    impl PodGuard for FixedGuard {
        fn finalizer(&self) -> &'static str {
            self.name
        }

        async fn evaluate(&self, _facts: &ObservedFacts<'_>) -> Verdict {
            if self.approve {
                Verdict::approve()
            } else {
                Verdict::deny("injected denial")
            }
        }
    }

    fn engine(agency: bool, delay: bool) -> FinalizerEngine {
        FinalizerEngine::new("db")
            .with_guard(FixedGuard {
                name: FINALIZER_AGENCY_SERVING,
                approve: agency,
            })
            .with_guard(FixedGuard {
                name: FINALIZER_DELAY,
                approve: delay,
            })
    }

    fn setup(finalizers: &[&str]) -> (MemoryResourceStore, Pod, MemberStatus) {
        let store = MemoryResourceStore::new();
        let pod = PodBuilder::new("db-agnt-1", "db", ServerGroup::Agents)
            .finalizers(finalizers)
            .marked_for_deletion(Utc::now())
            .build();
        store.insert_pod(pod.clone());
        let member = MemberStatus::new("AGNT-1", ServerGroup::Agents, Utc::now()).with_pod("db-agnt-1");
        (store, pod, member)
    }

    fn facts<'a>(pod: &'a Pod, member: &'a MemberStatus, server_dead: bool) -> ObservedFacts<'a> {
        ObservedFacts {
            pod,
            member,
            pvc: None,
            node_unschedulable: false,
            deployment_deleting: false,
            network_attached_volumes: false,
            shutdown_delay: Duration::ZERO,
            server_dead,
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_denied_finalizers_stay() {
        let (store, pod, member) = setup(&[FINALIZER_AGENCY_SERVING, FINALIZER_DELAY]);

        let outcome = engine(false, false)
            .run_pod_finalizers(&store, &facts(&pod, &member, false))
            .await;

        assert!(outcome.removed.is_empty());
        assert_eq!(outcome.denied.len(), 2);
        assert_eq!(outcome.interval, RECHECK_FINALIZER_INTERVAL);
        assert_eq!(store.finalizer_patches(), 0);
        assert_eq!(
            store.pod_finalizers("db-agnt-1"),
            vec![FINALIZER_AGENCY_SERVING, FINALIZER_DELAY]
        );
    }

    #[tokio::test]
    async fn test_approved_subset_removed_in_one_patch() {
        let (store, pod, member) = setup(&[FINALIZER_AGENCY_SERVING, FINALIZER_DELAY]);

        let outcome = engine(true, false)
            .run_pod_finalizers(&store, &facts(&pod, &member, false))
            .await;

        assert_eq!(outcome.removed, vec![FINALIZER_AGENCY_SERVING]);
        assert_eq!(outcome.interval, FINALIZER_REMOVED_INTERVAL);
        assert_eq!(store.finalizer_patches(), 1);
        assert_eq!(store.pod_finalizers("db-agnt-1"), vec![FINALIZER_DELAY]);
    }

    #[tokio::test]
    async fn test_dead_server_drops_owned_finalizers_only() {
        let (store, pod, member) = setup(&[FINALIZER_AGENCY_SERVING, FINALIZER_DELAY, "example.com/foreign"]);

        let outcome = engine(false, false)
            .run_pod_finalizers(&store, &facts(&pod, &member, true))
            .await;

        assert_eq!(outcome.removed.len(), 2);
        assert_eq!(store.pod_finalizers("db-agnt-1"), vec!["example.com/foreign"]);
    }

    #[tokio::test]
    async fn test_failed_patch_keeps_finalizers() {
        let (store, pod, member) = setup(&[FINALIZER_AGENCY_SERVING]);
        store.set_unavailable(true);

        let outcome = engine(true, true)
            .run_pod_finalizers(&store, &facts(&pod, &member, false))
            .await;

        assert!(outcome.removed.is_empty());
        assert_eq!(outcome.interval, RECHECK_SOON_INTERVAL);
        store.set_unavailable(false);
        assert_eq!(store.pod_finalizers("db-agnt-1"), vec![FINALIZER_AGENCY_SERVING]);
    }

    #[tokio::test]
    async fn test_orphan_release() {
        let (store, pod, _) = setup(&[FINALIZER_GRACEFUL_SHUTDOWN, FINALIZER_DELAY]);
        let engine = FinalizerEngine::new("db").with_guard(GracefulShutdownGuard).with_guard(DelayGuard);

        let outcome = engine.release_orphan_pod(&store, &pod).await;

        assert_eq!(outcome.removed.len(), 2);
        assert!(store.pod("db-agnt-1").is_none());
    }
}
