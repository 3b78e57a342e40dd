//! Custom Resource Definition for database cluster deployments

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::member::{DeploymentMode, DeploymentStatus, ServerGroup};

/// ClusterDeployment represents one database cluster managed by the operator
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "dbcluster.io",
    version = "v1",
    kind = "ClusterDeployment",
    plural = "clusterdeployments",
    shortname = "cdep",
    status = "DeploymentStatus",
    namespaced,
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDeploymentSpec {
    /// Deployment topology
    #[serde(default)]
    pub mode: DeploymentMode,

    /// Agent (agency) members
    #[serde(default)]
    pub agents: GroupSpec,

    /// Standalone server (Single mode only)
    #[serde(default)]
    pub single: GroupSpec,

    /// Data-server members
    #[serde(default)]
    pub dbservers: GroupSpec,

    /// Coordinator members
    #[serde(default)]
    pub coordinators: GroupSpec,

    /// Volumes survive node eviction (network attached storage)
    #[serde(default)]
    pub network_attached_volumes: bool,
}

/// Settings of one server group
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupSpec {
    /// Number of members
    #[serde(default = "default_count")]
    pub count: i32,

    /// Time a deleted pod is held before its delay finalizer is released
    #[serde(default)]
    pub shutdown_delay_seconds: u64,
}

impl Default for GroupSpec {
    fn default() -> Self {
        Self {
            count: default_count(),
            shutdown_delay_seconds: 0,
        }
    }
}

impl GroupSpec {
    /// Shutdown delay as a duration
    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_secs(self.shutdown_delay_seconds)
    }
}

fn default_count() -> i32 {
    3
}

impl ClusterDeploymentSpec {
    /// Settings of the given group
    pub fn group(&self, group: ServerGroup) -> &GroupSpec {
        match group {
            ServerGroup::Agents => &self.agents,
            ServerGroup::Single => &self.single,
            ServerGroup::DbServers => &self.dbservers,
            ServerGroup::Coordinators => &self.coordinators,
        }
    }
}
