//! Predicates over observed pod, volume claim and node state.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    ContainerStateTerminated, ContainerStatus, Node, PersistentVolumeClaim, Pod,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::time::Duration;

use super::{LABEL_ROLE, ROLE_IMAGE_DISCOVERY};

/// Name of the database server container.
pub const SERVER_CONTAINER: &str = "server";
/// Init container checking the data directory version.
pub const INIT_CONTAINER_VERSION_CHECK: &str = "version-check";
/// Init container running a database upgrade.
pub const INIT_CONTAINER_UPGRADE: &str = "upgrade";
/// Exit code of the version check asking for an upgrade.
pub const EXIT_CODE_UPGRADE_NEEDED: i32 = 11;

/// Containers whose state decides the state of the member.
pub const CORE_CONTAINERS: &[&str] = &[SERVER_CONTAINER];

pub fn is_marked_for_deletion(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

pub fn deletion_timestamp(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    meta.deletion_timestamp.as_ref().map(|t| t.0)
}

/// Auxiliary pods that do not back a member.
pub fn is_image_discovery_pod(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_ROLE))
        .map(|role| role == ROLE_IMAGE_DISCOVERY)
        .unwrap_or(false)
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

fn container_statuses(pod: &Pod) -> &[ContainerStatus] {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or(&[])
}

/// Init container statuses of the pod.
pub fn init_container_statuses(pod: &Pod) -> &[ContainerStatus] {
    pod.status
        .as_ref()
        .and_then(|s| s.init_container_statuses.as_deref())
        .unwrap_or(&[])
}

/// Status of the named container.
pub fn container_status<'a>(statuses: &'a [ContainerStatus], name: &str) -> Option<&'a ContainerStatus> {
    statuses.iter().find(|c| c.name == name)
}

/// Current termination state of a container.
pub fn terminated_state(status: &ContainerStatus) -> Option<&ContainerStateTerminated> {
    status.state.as_ref().and_then(|s| s.terminated.as_ref())
}

/// Previous termination state of a container.
pub fn last_terminated_state(status: &ContainerStatus) -> Option<&ContainerStateTerminated> {
    status.last_state.as_ref().and_then(|s| s.terminated.as_ref())
}

/// Termination state of the named container in the pod.
pub fn server_terminated_state<'a>(pod: &'a Pod, container: &str) -> Option<&'a ContainerStateTerminated> {
    container_status(container_statuses(pod), container).and_then(terminated_state)
}

/// Pod terminated and every core container exited with code 0.
pub fn is_pod_succeeded(pod: &Pod, core: &[&str]) -> bool {
    if pod_phase(pod) == Some("Succeeded") {
        return true;
    }
    let statuses = container_statuses(pod);
    !core.is_empty()
        && core.iter().all(|name| {
            container_status(statuses, name)
                .and_then(terminated_state)
                .map(|t| t.exit_code == 0)
                .unwrap_or(false)
        })
}

/// Pod terminated with at least one core container exiting non-zero.
pub fn is_pod_failed(pod: &Pod, core: &[&str]) -> bool {
    if pod_phase(pod) == Some("Failed") {
        return true;
    }
    let statuses = container_statuses(pod);
    core.iter().any(|name| {
        container_status(statuses, name)
            .and_then(terminated_state)
            .map(|t| t.exit_code != 0)
            .unwrap_or(false)
    })
}

fn pod_condition_is(pod: &Pod, condition_type: &str, status: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|c| c.iter().any(|cond| cond.type_ == condition_type && cond.status == status))
        .unwrap_or(false)
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod_condition_is(pod, "Ready", "True")
}

/// Every core container reports ready.
pub fn are_containers_ready(pod: &Pod, core: &[&str]) -> bool {
    let statuses = container_statuses(pod);
    core.iter()
        .all(|name| container_status(statuses, name).map(|c| c.ready).unwrap_or(false))
}

pub fn is_pod_scheduled(pod: &Pod) -> bool {
    pod_condition_is(pod, "PodScheduled", "True")
}

/// Pod has been waiting for a node longer than `timeout`.
pub fn is_pod_not_scheduled_for(pod: &Pod, timeout: Duration, now: DateTime<Utc>) -> bool {
    let Ok(timeout) = chrono::Duration::from_std(timeout) else {
        return false;
    };

    let since = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| {
            c.iter()
                .find(|cond| cond.type_ == "PodScheduled" && cond.status == "False")
        })
        .and_then(|cond| cond.last_transition_time.as_ref().map(|t| t.0))
        .or_else(|| pod.metadata.creation_timestamp.as_ref().map(|t| t.0));

    since.map(|t| now - t > timeout).unwrap_or(false)
}

/// The server container is running.
pub fn is_server_container_running(pod: &Pod) -> bool {
    container_status(container_statuses(pod), SERVER_CONTAINER)
        .and_then(|c| c.state.as_ref())
        .map(|s| s.running.is_some())
        .unwrap_or(false)
}

/// Names of containers that terminated with a non-zero exit code.
pub fn failed_container_names(statuses: &[ContainerStatus]) -> Vec<String> {
    statuses
        .iter()
        .filter(|c| terminated_state(c).map(|t| t.exit_code != 0).unwrap_or(false))
        .map(|c| c.name.clone())
        .collect()
}

/// Kubelet restarts the containers of this pod in place.
pub fn restarts_in_place(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.restart_policy.as_deref())
        .map(|p| p == "Always")
        .unwrap_or(false)
}

pub fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
}

pub fn is_node_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

pub fn is_pvc_marked_for_deletion(pvc: &PersistentVolumeClaim) -> bool {
    is_marked_for_deletion(&pvc.metadata)
}
