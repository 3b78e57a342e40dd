// Members and resources shared by the termination scenarios

use chrono::{DateTime, Utc};

use dbcluster_operator::member::{ConditionType, MemberPhase, MemberStatus, ServerGroup};

/// Pod name of a member.
pub fn pod_name(id: &str) -> String {
    format!("db-{}", id.to_lowercase())
}

/// Volume claim name of a member.
pub fn pvc_name(id: &str) -> String {
    format!("db-{}-data", id.to_lowercase())
}

/// A created member with a pod and a claim.
pub fn member(id: &str, group: ServerGroup, created_at: DateTime<Utc>) -> MemberStatus {
    MemberStatus::new(id, group, created_at)
        .with_pod(pod_name(id))
        .with_pvc(pvc_name(id))
        .with_phase(MemberPhase::Created)
}

/// A created member the cluster has already confirmed.
pub fn confirmed_member(id: &str, group: ServerGroup) -> MemberStatus {
    let mut m = member(id, group, Utc::now());
    m.conditions
        .update(ConditionType::MemberOfCluster, true, "Member Found", "");
    m
}
