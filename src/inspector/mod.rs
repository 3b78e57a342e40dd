//! Reconciliation of observed pods and volume claims into member status.
//!
//! One call to [`PodInspector::inspect`] is one reconciliation tick: read the
//! status once, walk every pod, member and claim, run the finalizer guards of
//! resources being deleted, then write the status back once with the version
//! it was read at. A version conflict fails the whole tick.
//!
//! The one exception is a guard starting a cleanout job: the status is stored
//! right then, so the job is recorded even if the rest of the tick fails.

mod restarts;
mod volumes;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::InspectionConfig;
use crate::crd::ClusterDeploymentSpec;
use crate::error::Result;
use crate::events::DeploymentEvent;
use crate::finalizers::FinalizerEngine;
use crate::guards::{MemberEffect, ObservedFacts};
use crate::interval::{Interval, MAX_POD_INSPECTOR_INTERVAL, RECHECK_SOON_INTERVAL};
use crate::member::{ConditionType, DeploymentStatus, MemberPhase, MemberStatus};
use crate::metrics;
use crate::resources::pods::{self, is_marked_for_deletion, CORE_CONTAINERS, SERVER_CONTAINER};
use crate::resources::ResourceStore;
use crate::store::{self, StatusStore, StatusVersion};

/// What the inspector needs to know about the deployment itself.
#[derive(Debug, Clone)]
pub struct DeploymentFacts {
    pub name: String,
    pub spec: ClusterDeploymentSpec,
    /// The deployment object carries a deletion timestamp.
    pub deleting: bool,
}

/// Result of one inspection tick.
#[derive(Debug)]
pub struct InspectionReport {
    /// Time until the next tick.
    pub interval: Interval,
    /// Events to publish for the deployment.
    pub events: Vec<DeploymentEvent>,
    /// Number of member pods inspected.
    pub pods_inspected: usize,
    /// The status was written back.
    pub status_written: bool,
}

/// State accumulated during one tick.
struct Tick {
    interval: Interval,
    events: Vec<DeploymentEvent>,
    schedule_timeouts: Vec<String>,
    unscheduled: Vec<String>,
    now: DateTime<Utc>,
    /// Status as last stored, and the version it was stored at.
    stored: DeploymentStatus,
    version: StatusVersion,
    written: bool,
}

impl Tick {
    fn reduce(&mut self, interval: Interval) {
        self.interval = self.interval.reduce_to(interval);
    }
}

/// Member changes made by the finalizer guards of one pod.
#[derive(Default)]
struct FinalizerRun {
    changed: bool,
    started_jobs: Vec<MemberEffect>,
}

/// Periodic pod and volume claim inspection of one deployment.
pub struct PodInspector {
    status: Arc<dyn StatusStore>,
    resources: Arc<dyn ResourceStore>,
    engine: FinalizerEngine,
    config: InspectionConfig,
}

impl PodInspector {
    pub fn new(
        status: Arc<dyn StatusStore>,
        resources: Arc<dyn ResourceStore>,
        engine: FinalizerEngine,
        config: InspectionConfig,
    ) -> Self {
        Self {
            status,
            resources,
            engine,
            config,
        }
    }

    /// Run one inspection tick.
    pub async fn inspect(&self, deployment: &DeploymentFacts) -> Result<InspectionReport> {
        let start = Instant::now();
        let result = self.inspect_at(deployment, Utc::now()).await;

        let pods = result.as_ref().map(|r| r.pods_inspected).unwrap_or_default();
        metrics::record_inspection(
            &deployment.name,
            result.is_ok(),
            pods,
            start.elapsed().as_secs_f64(),
        );
        result
    }

    /// Run one inspection tick as of `now`.
    pub async fn inspect_at(
        &self,
        deployment: &DeploymentFacts,
        now: DateTime<Utc>,
    ) -> Result<InspectionReport> {
        let (mut status, version) = self.status.get_status().await?;
        let pods = self.resources.list_pods().await?;
        let pvcs = self.resources.list_pvcs().await?;

        let mut tick = Tick {
            interval: MAX_POD_INSPECTOR_INTERVAL,
            events: Vec::new(),
            schedule_timeouts: Vec::new(),
            unscheduled: Vec::new(),
            now,
            stored: status.clone(),
            version,
            written: false,
        };

        let mut pods_inspected = 0;
        for pod in &pods {
            if pods::is_image_discovery_pod(pod) {
                continue;
            }
            pods_inspected += 1;
            self.inspect_pod(deployment, &mut status, pod, &pvcs, &mut tick)
                .await?;
        }

        let live: HashSet<String> = pods.iter().map(|p| p.name_any()).collect();
        self.inspect_missing_pods(&mut status, &live, &mut tick);
        self.cleanup_removed_members(&mut status, &pods, &pvcs, &mut tick)
            .await;
        self.inspect_pvcs(deployment, &status, &pvcs, &mut tick).await;
        Self::update_deployment_conditions(deployment, &mut status, &mut tick);

        if status != tick.stored {
            self.status.update_status(&status, &tick.version).await?;
            tick.written = true;
            debug!(deployment = %deployment.name, "Deployment status updated");
        }

        Ok(InspectionReport {
            interval: tick.interval,
            events: tick.events,
            pods_inspected,
            status_written: tick.written,
        })
    }

    async fn inspect_pod(
        &self,
        deployment: &DeploymentFacts,
        status: &mut DeploymentStatus,
        pod: &Pod,
        pvcs: &[PersistentVolumeClaim],
        tick: &mut Tick,
    ) -> Result<()> {
        let pod_name = pod.name_any();
        let Some((found, _)) = status.member_by_pod_name(&pod_name) else {
            warn!(pod = %pod_name, "No member found for pod");
            if is_marked_for_deletion(&pod.metadata)
                && pod.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty())
            {
                warn!(pod = %pod_name, "Pod belongs to the deployment but no member, removing all finalizers");
                let outcome = self.engine.release_orphan_pod(self.resources.as_ref(), pod).await;
                tick.reduce(outcome.interval);
            }
            return Ok(());
        };
        let mut member = found.clone();
        let member_id = member.id.clone();
        let mut changed = self.observe_pod_state(deployment, pod, &mut member, tick);
        let mut started_jobs = Vec::new();

        if !pods::is_pod_scheduled(pod) {
            if pods::is_pod_not_scheduled_for(pod, self.config.pod_schedule_timeout(), tick.now) {
                debug!(pod = %pod_name, "Pod scheduling timeout");
                tick.schedule_timeouts.push(pod_name.clone());
            } else {
                tick.unscheduled.push(pod_name.clone());
            }
            tick.reduce(RECHECK_SOON_INTERVAL);
        }

        if is_marked_for_deletion(&pod.metadata) {
            if member
                .conditions
                .update(ConditionType::Terminating, true, "Pod marked for deletion", "")
            {
                debug!(pod = %pod_name, "Pod marked as terminating");
                changed = true;
            }
            let run = self
                .run_pod_finalizers(deployment, pod, &mut member, pvcs, tick)
                .await;
            changed |= run.changed;
            started_jobs = run.started_jobs;
        }

        if changed {
            tick.reduce(RECHECK_SOON_INTERVAL);
            status.update_member(member)?;
        }
        if !started_jobs.is_empty() {
            self.store_started_jobs(status, &member_id, &started_jobs, tick)
                .await?;
        }
        Ok(())
    }

    /// Store the status in the middle of the tick after a guard started work
    /// in the cluster. On a conflict only `effects` are stored, on a fresh
    /// read, and the tick fails as any conflicting tick does.
    async fn store_started_jobs(
        &self,
        status: &DeploymentStatus,
        member_id: &str,
        effects: &[MemberEffect],
        tick: &mut Tick,
    ) -> Result<()> {
        match self.status.update_status(status, &tick.version).await {
            Ok(version) => {
                debug!(member = %member_id, "Stored started cleanout job");
                tick.version = version;
                tick.stored = status.clone();
                tick.written = true;
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                warn!(member = %member_id, "Status changed during tick, storing started cleanout job on a fresh read");
                store::apply(self.status.as_ref(), |fresh| {
                    let Some(member) = fresh.members.iter_mut().find(|m| m.id == member_id) else {
                        return false;
                    };
                    effects
                        .iter()
                        .fold(false, |changed, effect| effect.apply_to(member) | changed)
                })
                .await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Conditions derived from the pod alone. Returns true on change.
    fn observe_pod_state(
        &self,
        deployment: &DeploymentFacts,
        pod: &Pod,
        member: &mut MemberStatus,
        tick: &mut Tick,
    ) -> bool {
        let mut changed = false;
        let succeeded = pods::is_pod_succeeded(pod, CORE_CONTAINERS);
        let failed = !succeeded && pods::is_pod_failed(pod, CORE_CONTAINERS);

        if succeeded || failed {
            let was_terminated = member.conditions.is_true(ConditionType::Terminated);
            let mut recorded = was_terminated;
            let mut mark = true;

            if pods::restarts_in_place(pod) && !was_terminated {
                if let Some(obs) =
                    restarts::observe_restart(pod, member, self.config.restart_window(), tick.now)
                {
                    changed |= obs.recorded;
                    recorded = true;
                    mark = obs.mark_terminated;
                }
            }

            let reason = if succeeded { "Pod Succeeded" } else { "Pod Failed" };
            if mark && member.conditions.update(ConditionType::Terminated, true, reason, "") {
                debug!(member = %member.id, reason, "Member terminated");
                if failed {
                    restarts::inspect_failed_containers(&deployment.name, pod, member);
                }
                if !recorded {
                    member.record_termination(tick.now);
                }
                changed = true;
            }
        }

        if pods::is_pod_ready(pod) && pods::are_containers_ready(pod, CORE_CONTAINERS) {
            if member.conditions.update(ConditionType::Ready, true, "Pod Ready", "") {
                debug!(member = %member.id, "Member is ready");
                member.is_initialized = true;
                changed = true;
            }
        } else if member
            .conditions
            .update(ConditionType::Ready, false, "Pod Not Ready", "")
        {
            debug!(member = %member.id, "Member is not ready");
            changed = true;
        }

        changed
    }

    /// Evaluate the finalizers of a pod being deleted and record the guards'
    /// effects on `member`.
    async fn run_pod_finalizers(
        &self,
        deployment: &DeploymentFacts,
        pod: &Pod,
        member: &mut MemberStatus,
        pvcs: &[PersistentVolumeClaim],
        tick: &mut Tick,
    ) -> FinalizerRun {
        let node_unschedulable = match pods::node_name(pod) {
            None => false,
            Some(node) => match self.resources.get_node(node).await {
                Ok(Some(node)) => pods::is_node_unschedulable(&node),
                Ok(None) => {
                    warn!(node = %node, pod = %pod.name_any(), "Node not found");
                    false
                }
                Err(e) => {
                    warn!(node = %node, error = %e, "Cannot read node, keeping finalizers");
                    tick.reduce(RECHECK_SOON_INTERVAL);
                    return FinalizerRun::default();
                }
            },
        };

        let pvc = member
            .persistent_volume_claim_name
            .as_deref()
            .and_then(|name| pvcs.iter().find(|p| p.name_any() == name));
        let server_dead = pods::server_terminated_state(pod, SERVER_CONTAINER).is_some();

        let outcome = {
            let facts = ObservedFacts {
                pod,
                member,
                pvc,
                node_unschedulable,
                deployment_deleting: deployment.deleting,
                network_attached_volumes: deployment.spec.network_attached_volumes,
                shutdown_delay: deployment.spec.group(member.group).shutdown_delay(),
                server_dead,
                now: tick.now,
            };
            self.engine
                .run_pod_finalizers(self.resources.as_ref(), &facts)
                .await
        };
        tick.reduce(outcome.interval);

        if !outcome.removed.is_empty() {
            info!(member = %member.id, finalizers = ?outcome.removed, "Removed pod finalizers");
        }

        let mut run = FinalizerRun::default();
        for effect in outcome.effects {
            if !effect.apply_to(member) {
                continue;
            }
            run.changed = true;
            if let MemberEffect::CleanoutFailed { reason } = &effect {
                tick.events.push(DeploymentEvent::CleanoutFailed {
                    member: member.id.clone(),
                    reason: reason.clone(),
                });
            }
            if effect.starts_cluster_job() {
                run.started_jobs.push(effect);
            }
        }
        run
    }

    /// Members whose recorded pod no longer exists.
    fn inspect_missing_pods(
        &self,
        status: &mut DeploymentStatus,
        live: &HashSet<String>,
        tick: &mut Tick,
    ) {
        for member in status.members.iter_mut() {
            let Some(pod_name) = member.pod_name.clone() else {
                continue;
            };
            if live.contains(&pod_name) {
                continue;
            }

            if member.phase.is_awaiting_creation() {
                debug!(pod = %pod_name, "Pod does not exist yet, waiting for it to be created");
            } else if member.phase.is_intentional_shutdown() {
                if member.mark_terminated("Pod Terminated", tick.now) {
                    debug!(member = %member.id, "Pod of stopped member is gone");
                    tick.reduce(RECHECK_SOON_INTERVAL);
                }
            } else {
                info!(member = %member.id, pod = %pod_name, "Pod is gone, member will be recreated");
                member.set_phase(MemberPhase::None);
                member
                    .conditions
                    .update(ConditionType::Ready, false, "Pod Does Not Exist", "");
                member.mark_terminated("Pod Does Not Exist", tick.now);
                tick.events.push(DeploymentEvent::PodGone {
                    pod: pod_name,
                    role: member.group.as_role().to_string(),
                });
                tick.reduce(RECHECK_SOON_INTERVAL);
            }
        }
    }

    fn update_deployment_conditions(
        deployment: &DeploymentFacts,
        status: &mut DeploymentStatus,
        tick: &mut Tick,
    ) {
        let ready = status.all_members_ready(deployment.spec.mode);
        let reason = if ready { "All Members Ready" } else { "Members Not Ready" };
        status
            .conditions
            .update(ConditionType::Ready, ready, reason, "");

        if !tick.schedule_timeouts.is_empty() {
            let message = format!(
                "The following pods cannot be scheduled: {}",
                tick.schedule_timeouts.join(", ")
            );
            if status.conditions.update(
                ConditionType::PodSchedulingFailure,
                true,
                "Pods Scheduling Timeout",
                message,
            ) {
                tick.events.push(DeploymentEvent::PodsSchedulingFailure {
                    pods: tick.schedule_timeouts.clone(),
                });
            }
        } else if status.conditions.is_true(ConditionType::PodSchedulingFailure)
            && tick.unscheduled.is_empty()
            && status.conditions.update(
                ConditionType::PodSchedulingFailure,
                false,
                "Pods Scheduling Resolved",
                "No pod reports a scheduling timeout",
            )
        {
            tick.events.push(DeploymentEvent::PodsSchedulingResolved);
        }
    }
}
