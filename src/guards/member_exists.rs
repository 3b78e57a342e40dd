use tracing::debug;

use super::GuardDecision;
use crate::member::{ConditionType, MemberLocation, MemberStatus};

/// Decide whether a volume claim's member-exists finalizer may go.
///
/// `member` is the member owning the claim and where it was found, `None` if
/// no member references it.
pub fn member_exists(
    member: Option<(&MemberStatus, MemberLocation)>,
    deployment_deleting: bool,
) -> GuardDecision {
    if deployment_deleting {
        return GuardDecision::Approved;
    }

    let (member, location) = match member {
        Some(found) => found,
        None => return GuardDecision::Approved,
    };

    if location == MemberLocation::Removed {
        debug!(member = %member.id, "Member left the topology, volume can go");
        return GuardDecision::Approved;
    }
    if member.phase.is_failed() {
        return GuardDecision::Approved;
    }
    if member.group.can_rebuild_from_empty_volume()
        && member.conditions.is_true(ConditionType::Terminated)
    {
        debug!(member = %member.id, "Terminated agent can be rebuilt, volume can go");
        return GuardDecision::Approved;
    }
    if member.conditions.is_true(ConditionType::CleanedOut) {
        return GuardDecision::Approved;
    }

    GuardDecision::denied(format!("member {} still uses the volume", member.id))
}
