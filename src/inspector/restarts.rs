//! Termination accounting for pods whose containers restart in place.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use std::time::Duration;
use tracing::{debug, warn};

use crate::member::{ConditionType, MemberStatus};
use crate::metrics;
use crate::resources::pods::{
    self, init_container_statuses, last_terminated_state, terminated_state,
    EXIT_CODE_UPGRADE_NEEDED, INIT_CONTAINER_UPGRADE, INIT_CONTAINER_VERSION_CHECK,
    SERVER_CONTAINER,
};

/// What a restarting server container tells about its member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct RestartObservation {
    /// The termination time was appended to the member's history.
    pub recorded: bool,
    /// The server restarted too quickly and counts as terminated.
    pub mark_terminated: bool,
}

/// Inspect the server container of a pod restarted in place by the kubelet.
///
/// Returns `None` if the container is not terminated right now.
pub(super) fn observe_restart(
    pod: &Pod,
    member: &mut MemberStatus,
    window: Duration,
    now: DateTime<Utc>,
) -> Option<RestartObservation> {
    let statuses = pod.status.as_ref()?.container_statuses.as_deref()?;
    let server = pods::container_status(statuses, SERVER_CONTAINER)?;
    let current = terminated_state(server)?;

    let mut recorded = false;
    if let Some(finished) = current.finished_at.as_ref().map(|t| t.0) {
        if member.recent_terminations_since(finished) == 0 {
            member.record_termination(finished);
            recorded = true;
        }
    }

    let allowed_since = now - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
    let mark_terminated = last_terminated_state(server)
        .and_then(|t| t.finished_at.as_ref())
        .map(|finished| finished.0 >= allowed_since)
        .unwrap_or(false);

    if mark_terminated {
        debug!(member = %member.id, "Server keeps restarting, marking member terminated");
    } else {
        debug!(member = %member.id, "Server is restarting, not marking member terminated yet");
    }

    Some(RestartObservation {
        recorded,
        mark_terminated,
    })
}

/// Record what the failed containers of a pod say about its member.
///
/// Returns true if the member status changed. Accounting never fails the
/// caller.
pub(super) fn inspect_failed_containers(deployment: &str, pod: &Pod, member: &mut MemberStatus) -> bool {
    let mut changed = false;
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();

    let init_statuses = init_container_statuses(pod);
    for name in pods::failed_container_names(init_statuses) {
        let Some(t) = pods::container_status(init_statuses, &name).and_then(terminated_state) else {
            continue;
        };

        if name == INIT_CONTAINER_VERSION_CHECK && t.exit_code == EXIT_CODE_UPGRADE_NEEDED {
            if !member.upgrade {
                member.upgrade = true;
                changed = true;
            }
        } else if name == INIT_CONTAINER_UPGRADE {
            changed |= member
                .conditions
                .update(ConditionType::UpgradeFailed, true, "Upgrade Failed", "");
        }

        log_failure(deployment, pod_name, member, &name, t, "Init container failed");
    }

    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or(&[]);
    for name in pods::failed_container_names(statuses) {
        if let Some(t) = pods::container_status(statuses, &name).and_then(terminated_state) {
            log_failure(deployment, pod_name, member, &name, t, "Core container failed");
        }
    }

    changed
}

fn log_failure(
    deployment: &str,
    pod: &str,
    member: &MemberStatus,
    container: &str,
    t: &k8s_openapi::api::core::v1::ContainerStateTerminated,
    what: &str,
) {
    let reason = t.reason.as_deref().unwrap_or_default();
    warn!(
        member = %member.id,
        pod = %pod,
        container = %container,
        exit_code = t.exit_code,
        reason = %reason,
        message = t.message.as_deref().unwrap_or_default(),
        signal = t.signal.unwrap_or_default(),
        finished = ?t.finished_at.as_ref().map(|f| f.0),
        "Pod failed in unexpected way: {}", what
    );
    metrics::record_container_restart(deployment, &member.id, container, reason, t.exit_code);
}
