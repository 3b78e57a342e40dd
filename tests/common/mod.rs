//! Common test utilities for integration tests.

pub mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use dbcluster_operator::cluster_api::ScriptedClusterControl;
use dbcluster_operator::config::InspectionConfig;
use dbcluster_operator::crd::ClusterDeploymentSpec;
use dbcluster_operator::finalizers::FinalizerEngine;
use dbcluster_operator::inspector::{DeploymentFacts, InspectionReport, PodInspector};
use dbcluster_operator::member::{DeploymentStatus, MemberStatus};
use dbcluster_operator::resources::MemoryResourceStore;
use dbcluster_operator::store::InMemoryStatusStore;

pub use fixtures::*;

/// Name of the deployment every harness manages.
pub const DEPLOYMENT: &str = "db";

/// One deployment wired to in-memory stores and a scripted cluster.
pub struct TestDeployment {
    pub status: Arc<InMemoryStatusStore>,
    pub resources: Arc<MemoryResourceStore>,
    pub cluster: Arc<ScriptedClusterControl>,
    pub inspector: PodInspector,
    pub facts: DeploymentFacts,
}

impl TestDeployment {
    pub fn new(members: Vec<MemberStatus>) -> Self {
        Self::with_spec(members, ClusterDeploymentSpec::default())
    }

    pub fn with_spec(members: Vec<MemberStatus>, spec: ClusterDeploymentSpec) -> Self {
        let mut initial = DeploymentStatus::default();
        for member in members {
            initial.add_member(member);
        }

        let status = Arc::new(InMemoryStatusStore::new(initial));
        let resources = Arc::new(MemoryResourceStore::new());
        let cluster = Arc::new(ScriptedClusterControl::new());
        let engine = FinalizerEngine::standard(DEPLOYMENT, cluster.clone(), Duration::from_secs(1));
        let inspector = PodInspector::new(
            status.clone(),
            resources.clone(),
            engine,
            InspectionConfig::default(),
        );

        Self {
            status,
            resources,
            cluster,
            inspector,
            facts: DeploymentFacts {
                name: DEPLOYMENT.to_string(),
                spec,
                deleting: false,
            },
        }
    }

    /// Run one inspection tick at `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> InspectionReport {
        self.inspector
            .inspect_at(&self.facts, now)
            .await
            .expect("inspection tick failed")
    }

    /// Run one inspection tick now.
    pub async fn tick(&self) -> InspectionReport {
        self.tick_at(Utc::now()).await
    }

    /// Stored status of member `id`.
    pub fn member(&self, id: &str) -> MemberStatus {
        let status = self.status.snapshot();
        status
            .members
            .iter()
            .chain(status.removed_members.iter())
            .find(|m| m.id == id)
            .cloned()
            .unwrap_or_else(|| panic!("member {} not in status", id))
    }
}
