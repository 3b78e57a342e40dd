use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ConditionList, ConditionType, MemberStatus, ServerGroup};
use crate::error::{OperatorError, Result};

/// Topology of the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum DeploymentMode {
    /// One standalone server.
    Single,
    /// Agents, data-servers and coordinators.
    #[default]
    Cluster,
}

/// Where a member was found in the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberLocation {
    /// Part of the desired topology.
    Active,
    /// Taken out of the topology; its resources are still being torn down.
    Removed,
}

/// Aggregate status of a deployment.
///
/// Persisted as a whole with optimistic concurrency; see
/// [`StatusStore`](crate::store::StatusStore).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    /// Members of the desired topology.
    #[serde(default)]
    pub members: Vec<MemberStatus>,
    /// Members removed from the topology whose pod or volume still exists.
    #[serde(default)]
    pub removed_members: Vec<MemberStatus>,
    /// Deployment level conditions.
    #[serde(default)]
    pub conditions: ConditionList,
}

impl DeploymentStatus {
    /// Admit a member to the topology.
    pub fn add_member(&mut self, member: MemberStatus) {
        self.members.push(member);
    }

    /// Find a member (active or removed) by the name of its pod.
    pub fn member_by_pod_name(&self, pod_name: &str) -> Option<(&MemberStatus, MemberLocation)> {
        self.find(|m| m.pod_name.as_deref() == Some(pod_name))
    }

    /// Find a member (active or removed) by the name of its volume claim.
    pub fn member_by_pvc_name(&self, pvc_name: &str) -> Option<(&MemberStatus, MemberLocation)> {
        self.find(|m| m.persistent_volume_claim_name.as_deref() == Some(pvc_name))
    }

    /// Find an active member by ID.
    pub fn member_by_id(&self, id: &str) -> Option<&MemberStatus> {
        self.members.iter().find(|m| m.id == id)
    }

    fn find<F>(&self, pred: F) -> Option<(&MemberStatus, MemberLocation)>
    where
        F: Fn(&MemberStatus) -> bool,
    {
        if let Some(m) = self.members.iter().find(|m| pred(m)) {
            return Some((m, MemberLocation::Active));
        }
        self.removed_members
            .iter()
            .find(|m| pred(m))
            .map(|m| (m, MemberLocation::Removed))
    }

    /// Replace the stored member with the same ID.
    pub fn update_member(&mut self, member: MemberStatus) -> Result<()> {
        let slot = self
            .members
            .iter_mut()
            .chain(self.removed_members.iter_mut())
            .find(|m| m.id == member.id)
            .ok_or_else(|| OperatorError::MemberNotFound(member.id.clone()))?;
        *slot = member;
        Ok(())
    }

    /// Take a member out of the topology.
    ///
    /// The entry moves to `removed_members` and is dropped once its pod and
    /// volume are gone.
    pub fn remove_member(&mut self, id: &str) -> Option<&MemberStatus> {
        let idx = self.members.iter().position(|m| m.id == id)?;
        let mut member = self.members.remove(idx);
        member
            .conditions
            .update(ConditionType::MemberOfCluster, false, "Removed", "Member is no longer part of the cluster");
        self.removed_members.push(member);
        self.removed_members.last()
    }

    /// Forget a removed member.
    pub fn drop_removed_member(&mut self, id: &str) -> bool {
        let before = self.removed_members.len();
        self.removed_members.retain(|m| m.id != id);
        before != self.removed_members.len()
    }

    /// Returns true if every member relevant for `mode` is ready.
    pub fn all_members_ready(&self, mode: DeploymentMode) -> bool {
        let relevant = |group: ServerGroup| match mode {
            DeploymentMode::Single => group == ServerGroup::Single,
            DeploymentMode::Cluster => group != ServerGroup::Single,
        };
        self.members
            .iter()
            .filter(|m| relevant(m.group))
            .all(|m| m.conditions.is_true(ConditionType::Ready))
    }
}
