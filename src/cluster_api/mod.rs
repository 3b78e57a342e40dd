//! Administration API of the database cluster.
//!
//! The operator consumes four things from the cluster: its own health view,
//! the cleanout (drain) procedure for data-servers, the cleaned-out server
//! list, and a quorum check over the agency.

mod http;
#[cfg(any(test, feature = "test-helpers"))]
mod mock;

pub use self::http::HttpClusterControl;
#[cfg(any(test, feature = "test-helpers"))]
pub use self::mock::ScriptedClusterControl;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::{OperatorError, Result};
use crate::member::ServerGroup;

/// Liveness of one member as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberHealth {
    /// Role reported by the cluster, if it is one the operator knows.
    pub group: Option<ServerGroup>,
    pub alive: bool,
}

/// The cluster's own view of its members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterHealth {
    pub members: BTreeMap<String, MemberHealth>,
}

impl ClusterHealth {
    pub fn contains(&self, member_id: &str) -> bool {
        self.members.contains_key(member_id)
    }

    pub fn is_alive(&self, member_id: &str) -> bool {
        self.members.get(member_id).map(|m| m.alive).unwrap_or(false)
    }

    /// Agents other than `exclude`.
    pub fn agents_except<'a>(&'a self, exclude: &'a str) -> impl Iterator<Item = (&'a String, &'a MemberHealth)> {
        self.members
            .iter()
            .filter(move |(id, m)| m.group == Some(ServerGroup::Agents) && id.as_str() != exclude)
    }
}

/// Progress of a cleanout job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Succeeded,
    Failed { reason: String },
}

/// Checks that the agency keeps quorum without `exclude`: at least one other
/// agent is known and every other agent is alive.
pub fn remaining_agents_healthy(health: &ClusterHealth, exclude: &str) -> Result<()> {
    let mut remaining = 0;
    for (id, agent) in health.agents_except(exclude) {
        remaining += 1;
        if !agent.alive {
            return Err(OperatorError::AgencyUnhealthy(format!("agent {} is not alive", id)));
        }
    }

    if remaining == 0 {
        return Err(OperatorError::AgencyUnhealthy(format!(
            "no agents besides {} responded",
            exclude
        )));
    }
    Ok(())
}

/// Client of the cluster administration API.
#[async_trait]
pub trait ClusterControl: Send + Sync {
    /// Current health view of the cluster.
    async fn health(&self) -> Result<ClusterHealth>;

    /// Start moving all data off a data-server. Returns the job handle.
    async fn clean_out_server(&self, member_id: &str) -> Result<String>;

    /// Status of a cleanout job.
    async fn cleanout_job_status(&self, job_id: &str) -> Result<JobStatus>;

    /// Returns true if the data-server holds no data anymore.
    async fn is_cleaned_out(&self, member_id: &str) -> Result<bool>;

    /// Ok if the agency stays healthy without `exclude`.
    async fn agency_healthy(&self, exclude: &str) -> Result<()>;
}
