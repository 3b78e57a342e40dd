//! End-to-end termination scenarios
//!
//! Every test drives the inspector tick by tick against in-memory stores and
//! a scripted cluster, the way the controller does against a real API server.

#[allow(dead_code)]
mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use common::*;
use dbcluster_operator::cluster_api::JobStatus;
use dbcluster_operator::config::{InspectionConfig, ReclaimConfig};
use dbcluster_operator::events::DeploymentEvent;
use dbcluster_operator::finalizers::FinalizerEngine;
use dbcluster_operator::guards::{
    FINALIZER_AGENCY_SERVING, FINALIZER_DELAY, FINALIZER_DRAIN, FINALIZER_GRACEFUL_SHUTDOWN,
    FINALIZER_MEMBER_EXISTS,
};
use dbcluster_operator::health_cache::ClusterHealthCache;
use dbcluster_operator::inspector::PodInspector;
use dbcluster_operator::member::{
    ConditionType, DeploymentMode, DeploymentStatus, MemberPhase, ServerGroup,
};
use dbcluster_operator::reclaimer::StaleMemberReclaimer;
use dbcluster_operator::resources::{node, PodBuilder, PvcBuilder};
use dbcluster_operator::store::{InMemoryStatusStore, StatusStore, StatusVersion};
use dbcluster_operator::Result;

const FOREIGN_FINALIZER: &str = "backup.example.com/protect";

// =============================================================================
// Steady state
// =============================================================================

#[tokio::test]
async fn test_steady_state_tick_is_idempotent() {
    let members = vec![
        member("AGNT-1", ServerGroup::Agents, Utc::now()),
        member("AGNT-2", ServerGroup::Agents, Utc::now()),
        member("AGNT-3", ServerGroup::Agents, Utc::now()),
        member("PRMR-1", ServerGroup::DbServers, Utc::now()),
        member("CRDN-1", ServerGroup::Coordinators, Utc::now()),
    ];
    let d = TestDeployment::new(members.clone());
    for m in &members {
        d.resources
            .insert_pod(PodBuilder::new(&pod_name(&m.id), DEPLOYMENT, m.group).build());
        d.resources.insert_pvc(PvcBuilder::new(&pvc_name(&m.id), DEPLOYMENT).build());
    }
    d.resources
        .insert_pod(PodBuilder::image_discovery("db-id-1234", DEPLOYMENT).build());

    let first = d.tick().await;
    assert!(first.status_written);
    assert_eq!(first.pods_inspected, members.len());
    assert!(d.status.snapshot().conditions.is_true(ConditionType::Ready));
    assert!(d.member("AGNT-1").is_initialized);

    let second = d.tick().await;
    assert!(!second.status_written);
    assert!(second.events.is_empty());
    assert_eq!(d.status.write_count(), 1);
    assert_eq!(d.resources.finalizer_patches(), 0);
}

#[tokio::test]
async fn test_conflicting_write_aborts_tick() {
    /// Store whose status changes between every read and write.
    struct RacingStore {
        inner: InMemoryStatusStore,
    }

    #[async_trait]
    impl StatusStore for RacingStore {
        async fn get_status(&self) -> Result<(DeploymentStatus, StatusVersion)> {
            self.inner.get_status().await
        }

        async fn update_status(
            &self,
            status: &DeploymentStatus,
            version: &StatusVersion,
        ) -> Result<StatusVersion> {
            self.inner.replace(self.inner.snapshot());
            self.inner.update_status(status, version).await
        }
    }

    let d = TestDeployment::new(vec![]);
    let mut initial = DeploymentStatus::default();
    initial.add_member(member("CRDN-1", ServerGroup::Coordinators, Utc::now()));
    let store = Arc::new(RacingStore {
        inner: InMemoryStatusStore::new(initial),
    });
    d.resources.insert_pod(
        PodBuilder::new(&pod_name("CRDN-1"), DEPLOYMENT, ServerGroup::Coordinators).build(),
    );

    let inspector = PodInspector::new(
        store.clone(),
        d.resources.clone(),
        FinalizerEngine::standard(DEPLOYMENT, d.cluster.clone(), Duration::from_secs(1)),
        InspectionConfig::default(),
    );

    let err = inspector.inspect_at(&d.facts, Utc::now()).await.unwrap_err();
    assert!(err.is_conflict());

    let stored = store.inner.snapshot();
    assert!(!stored.members[0].conditions.is_true(ConditionType::Ready));
    assert_eq!(store.inner.write_count(), 0);
}

// =============================================================================
// Agents
// =============================================================================

#[tokio::test]
async fn test_agent_released_only_with_healthy_agency() {
    let d = TestDeployment::new(vec![
        member("AGNT-1", ServerGroup::Agents, Utc::now()),
        member("AGNT-2", ServerGroup::Agents, Utc::now()),
        member("AGNT-3", ServerGroup::Agents, Utc::now()),
    ]);
    let pod = pod_name("AGNT-1");
    d.resources.insert_node(node("node-1", false));
    d.resources.insert_node(node("node-7", true));
    d.resources.insert_pod(
        PodBuilder::new(&pod, DEPLOYMENT, ServerGroup::Agents)
            .on_node("node-7")
            .marked_for_deletion(Utc::now())
            .finalizers(&[FINALIZER_AGENCY_SERVING, FOREIGN_FINALIZER])
            .build(),
    );
    d.resources
        .insert_pvc(PvcBuilder::new(&pvc_name("AGNT-1"), DEPLOYMENT).build());
    d.cluster.set_member("AGNT-1", ServerGroup::Agents, true);
    d.cluster.set_member("AGNT-2", ServerGroup::Agents, true);
    d.cluster.set_member("AGNT-3", ServerGroup::Agents, false);

    d.tick().await;
    assert_eq!(
        d.resources.pod_finalizers(&pod),
        vec![FINALIZER_AGENCY_SERVING.to_string(), FOREIGN_FINALIZER.to_string()]
    );
    let agent = d.member("AGNT-1");
    assert!(agent.conditions.is_true(ConditionType::Terminating));
    assert!(!agent.conditions.is_true(ConditionType::AgentRecoveryNeeded));

    d.cluster.set_member("AGNT-3", ServerGroup::Agents, true);
    d.tick().await;

    assert_eq!(d.resources.pod_finalizers(&pod), vec![FOREIGN_FINALIZER.to_string()]);
    assert!(d
        .member("AGNT-1")
        .conditions
        .is_true(ConditionType::AgentRecoveryNeeded));
}

#[tokio::test]
async fn test_agent_restart_in_place_is_released() {
    let d = TestDeployment::new(vec![member("AGNT-1", ServerGroup::Agents, Utc::now())]);
    let pod = pod_name("AGNT-1");
    d.resources.insert_node(node("node-1", false));
    d.resources.insert_pod(
        PodBuilder::new(&pod, DEPLOYMENT, ServerGroup::Agents)
            .marked_for_deletion(Utc::now())
            .finalizers(&[FINALIZER_AGENCY_SERVING])
            .build(),
    );
    d.resources
        .insert_pvc(PvcBuilder::new(&pvc_name("AGNT-1"), DEPLOYMENT).build());
    d.cluster.fail_health(Some("agency unreachable"));

    d.tick().await;

    assert!(d.resources.pod(&pod).is_none());
    assert!(!d
        .member("AGNT-1")
        .conditions
        .is_true(ConditionType::AgentRecoveryNeeded));
}

// =============================================================================
// Data-servers
// =============================================================================

#[tokio::test]
async fn test_dbserver_drains_across_ticks() {
    let d = TestDeployment::new(vec![confirmed_member("PRMR-1", ServerGroup::DbServers)]);
    let pod = pod_name("PRMR-1");
    let pvc = pvc_name("PRMR-1");
    d.resources.insert_node(node("node-1", false));
    d.resources.insert_pod(
        PodBuilder::new(&pod, DEPLOYMENT, ServerGroup::DbServers)
            .marked_for_deletion(Utc::now())
            .finalizers(&[FINALIZER_DRAIN])
            .build(),
    );
    d.resources.insert_pvc(
        PvcBuilder::new(&pvc, DEPLOYMENT)
            .finalizers(&[FINALIZER_MEMBER_EXISTS])
            .marked_for_deletion(Utc::now())
            .build(),
    );

    // Tick 1: cleanout starts.
    d.tick().await;
    let m = d.member("PRMR-1");
    assert_eq!(m.phase, MemberPhase::Drain);
    let job = m.cleanout_job_id.clone().expect("cleanout job recorded");
    assert_eq!(d.cluster.cleanout_requests(), vec!["PRMR-1".to_string()]);
    assert_eq!(d.resources.pod_finalizers(&pod), vec![FINALIZER_DRAIN.to_string()]);
    assert_eq!(
        d.resources.pvc_finalizers(&pvc),
        vec![FINALIZER_MEMBER_EXISTS.to_string()]
    );

    // Tick 2: job still running, nothing new is started.
    d.tick().await;
    assert_eq!(d.cluster.cleanout_requests().len(), 1);
    assert_eq!(d.member("PRMR-1").cleanout_job_id.as_deref(), Some(job.as_str()));

    // Tick 3: job done, pod and claim are released together.
    d.cluster.set_job_status(&job, JobStatus::Succeeded);
    d.tick().await;

    let m = d.member("PRMR-1");
    assert!(m.conditions.is_true(ConditionType::CleanedOut));
    assert_eq!(m.phase, MemberPhase::Created);
    assert!(m.cleanout_job_id.is_none());
    assert!(d.resources.pod(&pod).is_none());
    assert!(d.resources.pvc(&pvc).is_none());
}

#[tokio::test]
async fn test_already_cleaned_out_server_is_released_at_once() {
    let d = TestDeployment::new(vec![confirmed_member("PRMR-1", ServerGroup::DbServers)]);
    let pod = pod_name("PRMR-1");
    d.resources.insert_node(node("node-1", true));
    d.resources.insert_pod(
        PodBuilder::new(&pod, DEPLOYMENT, ServerGroup::DbServers)
            .marked_for_deletion(Utc::now())
            .finalizers(&[FINALIZER_DRAIN])
            .build(),
    );
    d.resources
        .insert_pvc(PvcBuilder::new(&pvc_name("PRMR-1"), DEPLOYMENT).build());
    d.cluster.set_cleaned_out("PRMR-1");

    d.tick().await;

    assert!(d.resources.pod(&pod).is_none());
    assert!(d.cluster.cleanout_requests().is_empty());
    assert!(d
        .member("PRMR-1")
        .conditions
        .is_true(ConditionType::CleanedOut));
}

#[tokio::test]
async fn test_failed_cleanout_keeps_pod() {
    let d = TestDeployment::new(vec![confirmed_member("PRMR-1", ServerGroup::DbServers)]);
    let pod = pod_name("PRMR-1");
    d.resources.insert_node(node("node-1", true));
    d.resources.insert_pod(
        PodBuilder::new(&pod, DEPLOYMENT, ServerGroup::DbServers)
            .marked_for_deletion(Utc::now())
            .finalizers(&[FINALIZER_DRAIN])
            .build(),
    );
    d.resources
        .insert_pvc(PvcBuilder::new(&pvc_name("PRMR-1"), DEPLOYMENT).build());

    d.tick().await;
    let job = d.member("PRMR-1").cleanout_job_id.expect("cleanout job recorded");
    d.cluster.set_job_status(
        &job,
        JobStatus::Failed {
            reason: "no space left".to_string(),
        },
    );
    let report = d.tick().await;

    let m = d.member("PRMR-1");
    assert_eq!(m.phase, MemberPhase::Created);
    assert!(!m.conditions.is_true(ConditionType::CleanedOut));
    let cond = m.conditions.get(ConditionType::CleanedOut).expect("failure recorded");
    assert_eq!(cond.reason, "Cleanout Failed");
    assert_eq!(cond.message, "no space left");
    assert!(report.events.contains(&DeploymentEvent::CleanoutFailed {
        member: "PRMR-1".to_string(),
        reason: "no space left".to_string(),
    }));
    assert_eq!(d.resources.pod_finalizers(&pod), vec![FINALIZER_DRAIN.to_string()]);
}

#[tokio::test]
async fn test_started_cleanout_survives_conflicting_tick() {
    /// Store that loses the first write of the tick to a concurrent writer.
    struct ContendedOnce {
        inner: InMemoryStatusStore,
        contended: AtomicBool,
    }

    #[async_trait]
    impl StatusStore for ContendedOnce {
        async fn get_status(&self) -> Result<(DeploymentStatus, StatusVersion)> {
            self.inner.get_status().await
        }

        async fn update_status(
            &self,
            status: &DeploymentStatus,
            version: &StatusVersion,
        ) -> Result<StatusVersion> {
            if !self.contended.swap(true, Ordering::SeqCst) {
                self.inner.replace(self.inner.snapshot());
            }
            self.inner.update_status(status, version).await
        }
    }

    let d = TestDeployment::new(vec![]);
    let mut initial = DeploymentStatus::default();
    initial.add_member(confirmed_member("PRMR-1", ServerGroup::DbServers));
    let store = Arc::new(ContendedOnce {
        inner: InMemoryStatusStore::new(initial),
        contended: AtomicBool::new(false),
    });
    d.resources.insert_node(node("node-1", false));
    d.resources.insert_pod(
        PodBuilder::new(&pod_name("PRMR-1"), DEPLOYMENT, ServerGroup::DbServers)
            .marked_for_deletion(Utc::now())
            .finalizers(&[FINALIZER_DRAIN])
            .build(),
    );
    d.resources.insert_pvc(
        PvcBuilder::new(&pvc_name("PRMR-1"), DEPLOYMENT)
            .marked_for_deletion(Utc::now())
            .build(),
    );
    let inspector = PodInspector::new(
        store.clone(),
        d.resources.clone(),
        FinalizerEngine::standard(DEPLOYMENT, d.cluster.clone(), Duration::from_secs(1)),
        InspectionConfig::default(),
    );

    let err = inspector.inspect_at(&d.facts, Utc::now()).await.unwrap_err();
    assert!(err.is_conflict());
    let stored = store.inner.snapshot();
    assert_eq!(stored.members[0].phase, MemberPhase::Drain);
    assert_eq!(stored.members[0].cleanout_job_id.as_deref(), Some("job-1"));

    inspector.inspect_at(&d.facts, Utc::now()).await.unwrap();

    assert_eq!(d.cluster.cleanout_requests(), vec!["PRMR-1".to_string()]);
    let stored = store.inner.snapshot();
    assert_eq!(stored.members[0].cleanout_job_id.as_deref(), Some("job-1"));
    assert_eq!(
        d.resources.pod_finalizers(&pod_name("PRMR-1")),
        vec![FINALIZER_DRAIN.to_string()]
    );
}

#[tokio::test]
async fn test_dbserver_without_claim_keeps_pod() {
    let d = TestDeployment::new(vec![confirmed_member("PRMR-1", ServerGroup::DbServers)]);
    let pod = pod_name("PRMR-1");
    d.resources.insert_node(node("node-1", false));
    d.resources.insert_pod(
        PodBuilder::new(&pod, DEPLOYMENT, ServerGroup::DbServers)
            .marked_for_deletion(Utc::now())
            .finalizers(&[FINALIZER_DRAIN])
            .build(),
    );

    d.tick().await;

    assert_eq!(d.resources.pod_finalizers(&pod), vec![FINALIZER_DRAIN.to_string()]);
    assert!(d.cluster.cleanout_requests().is_empty());
}

#[tokio::test]
async fn test_claim_of_active_member_is_never_released() {
    let d = TestDeployment::new(vec![confirmed_member("PRMR-1", ServerGroup::DbServers)]);
    let pvc = pvc_name("PRMR-1");
    d.resources.insert_pod(
        PodBuilder::new(&pod_name("PRMR-1"), DEPLOYMENT, ServerGroup::DbServers).build(),
    );
    d.resources.insert_pvc(
        PvcBuilder::new(&pvc, DEPLOYMENT)
            .finalizers(&[FINALIZER_MEMBER_EXISTS])
            .marked_for_deletion(Utc::now())
            .build(),
    );

    for _ in 0..3 {
        d.tick().await;
    }
    assert_eq!(
        d.resources.pvc_finalizers(&pvc),
        vec![FINALIZER_MEMBER_EXISTS.to_string()]
    );

    let mut status = d.status.snapshot();
    status.remove_member("PRMR-1");
    d.status.replace(status);

    d.tick().await;
    assert!(d.resources.pvc(&pvc).is_none());
    assert!(d.resources.deletion_requests().contains(&pod_name("PRMR-1")));
}

// =============================================================================
// Generic guards
// =============================================================================

#[tokio::test]
async fn test_dead_server_drops_owned_finalizers_only() {
    let d = TestDeployment::new(vec![confirmed_member("PRMR-1", ServerGroup::DbServers)]);
    let pod = pod_name("PRMR-1");
    d.resources.insert_node(node("node-1", true));
    d.resources.insert_pod(
        PodBuilder::new(&pod, DEPLOYMENT, ServerGroup::DbServers)
            .marked_for_deletion(Utc::now())
            .server_terminated(137, Utc::now())
            .finalizers(&[FINALIZER_DRAIN, FINALIZER_GRACEFUL_SHUTDOWN, FOREIGN_FINALIZER])
            .build(),
    );

    d.tick().await;

    assert_eq!(d.resources.pod_finalizers(&pod), vec![FOREIGN_FINALIZER.to_string()]);
    assert!(d.cluster.cleanout_requests().is_empty());
    assert!(d.member("PRMR-1").conditions.is_true(ConditionType::Terminated));
}

#[tokio::test]
async fn test_shutdown_delay_holds_pod() {
    let mut spec = dbcluster_operator::crd::ClusterDeploymentSpec::default();
    spec.coordinators.shutdown_delay_seconds = 30;
    let d = TestDeployment::with_spec(
        vec![member("CRDN-1", ServerGroup::Coordinators, Utc::now())],
        spec,
    );
    let pod = pod_name("CRDN-1");
    let deleted_at = Utc::now();
    d.resources.insert_pod(
        PodBuilder::new(&pod, DEPLOYMENT, ServerGroup::Coordinators)
            .marked_for_deletion(deleted_at)
            .finalizers(&[FINALIZER_DELAY])
            .build(),
    );

    d.tick_at(deleted_at + chrono::Duration::seconds(10)).await;
    assert_eq!(d.resources.pod_finalizers(&pod), vec![FINALIZER_DELAY.to_string()]);

    d.tick_at(deleted_at + chrono::Duration::seconds(31)).await;
    assert!(d.resources.pod(&pod).is_none());
}

#[tokio::test]
async fn test_orphan_pod_is_released() {
    let d = TestDeployment::new(vec![]);
    d.resources.insert_pod(
        PodBuilder::new("db-prmr-gone", DEPLOYMENT, ServerGroup::DbServers)
            .marked_for_deletion(Utc::now())
            .finalizers(&[FINALIZER_DRAIN, FINALIZER_DELAY, FOREIGN_FINALIZER])
            .build(),
    );

    d.tick().await;

    assert_eq!(
        d.resources.pod_finalizers("db-prmr-gone"),
        vec![FOREIGN_FINALIZER.to_string()]
    );
}

// =============================================================================
// Stale members
// =============================================================================

#[tokio::test]
async fn test_vanished_coordinator_is_reclaimed_and_torn_down() {
    let d = TestDeployment::new(vec![member("CRDN-1", ServerGroup::Coordinators, Utc::now())]);
    let pod = pod_name("CRDN-1");
    let pvc = pvc_name("CRDN-1");
    d.resources
        .insert_pod(PodBuilder::new(&pod, DEPLOYMENT, ServerGroup::Coordinators).build());
    d.resources.insert_pvc(
        PvcBuilder::new(&pvc, DEPLOYMENT)
            .finalizers(&[FINALIZER_MEMBER_EXISTS])
            .build(),
    );

    let cache = Arc::new(ClusterHealthCache::new());
    let reclaimer = StaleMemberReclaimer::new(
        DEPLOYMENT,
        DeploymentMode::Cluster,
        d.status.clone(),
        d.resources.clone(),
        cache.clone(),
        Duration::from_secs(20),
        ReclaimConfig::default(),
    );

    d.cluster.set_member("CRDN-1", ServerGroup::Coordinators, true);
    cache.refresh(d.cluster.as_ref(), Duration::from_secs(1)).await.unwrap();
    let report = reclaimer.run_once(Utc::now()).await.unwrap();
    assert_eq!(report.confirmed, vec!["CRDN-1".to_string()]);

    d.cluster.forget_member("CRDN-1");
    cache.refresh(d.cluster.as_ref(), Duration::from_secs(1)).await.unwrap();
    let report = reclaimer.run_once(Utc::now()).await.unwrap();
    assert_eq!(report.removed.len(), 1);
    assert!(d.resources.pod(&pod).is_none());

    // The claim waits on its finalizer until the inspector sees the member
    // is no longer part of the topology.
    assert!(d.resources.pvc(&pvc).is_some());
    d.tick().await;
    assert!(d.resources.pvc(&pvc).is_none());

    d.tick().await;
    let status = d.status.snapshot();
    assert!(status.members.is_empty());
    assert!(status.removed_members.is_empty());
}

// =============================================================================
// Missing pods
// =============================================================================

#[tokio::test]
async fn test_missing_pod_is_reported_once() {
    let d = TestDeployment::new(vec![member("CRDN-1", ServerGroup::Coordinators, Utc::now())]);

    let report = d.tick().await;
    assert_eq!(
        report.events,
        vec![DeploymentEvent::PodGone {
            pod: pod_name("CRDN-1"),
            role: "coordinator".to_string(),
        }]
    );
    let m = d.member("CRDN-1");
    assert_eq!(m.phase, MemberPhase::None);
    assert!(m.conditions.is_true(ConditionType::Terminated));
    assert!(!m.conditions.is_true(ConditionType::Ready));
    assert_eq!(m.recent_terminations.len(), 1);

    let report = d.tick().await;
    assert!(report.events.is_empty());
}

#[tokio::test]
async fn test_api_outage_fails_tick_without_writing() {
    let d = TestDeployment::new(vec![member("CRDN-1", ServerGroup::Coordinators, Utc::now())]);
    d.resources.set_unavailable(true);

    let result = d.inspector.inspect_at(&d.facts, Utc::now()).await;

    assert!(result.is_err());
    assert_eq!(d.status.write_count(), 0);
}
