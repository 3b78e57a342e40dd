//! Builders for pod, volume claim and node objects as the operator sees them.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStatus, Node,
    NodeSpec, PersistentVolumeClaim, Pod, PodCondition, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::BTreeMap;

use super::pods::SERVER_CONTAINER;
use super::{LABEL_DEPLOYMENT, LABEL_ROLE, ROLE_IMAGE_DISCOVERY};
use crate::member::ServerGroup;

fn labels(deployment: &str, role: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_DEPLOYMENT.to_string(), deployment.to_string()),
        (LABEL_ROLE.to_string(), role.to_string()),
    ])
}

fn condition(kind: &str, status: bool, at: DateTime<Utc>) -> PodCondition {
    PodCondition {
        type_: kind.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        last_transition_time: Some(Time(at)),
        ..Default::default()
    }
}

fn terminated(exit_code: i32, finished_at: DateTime<Utc>) -> ContainerStateTerminated {
    ContainerStateTerminated {
        exit_code,
        reason: Some(if exit_code == 0 { "Completed" } else { "Error" }.to_string()),
        finished_at: Some(Time(finished_at)),
        ..Default::default()
    }
}

/// Builds a member pod. Starts scheduled, running and ready.
pub struct PodBuilder {
    pod: Pod,
}

impl PodBuilder {
    pub fn new(name: &str, deployment: &str, group: ServerGroup) -> Self {
        Self::with_role(name, deployment, group.as_role())
    }

    /// An image discovery pod, which backs no member.
    pub fn image_discovery(name: &str, deployment: &str) -> Self {
        Self::with_role(name, deployment, ROLE_IMAGE_DISCOVERY)
    }

    fn with_role(name: &str, deployment: &str, role: &str) -> Self {
        let now = Utc::now();
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels(deployment, role)),
                creation_timestamp: Some(Time(now)),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-1".to_string()),
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![
                    condition("PodScheduled", true, now),
                    condition("Ready", true, now),
                ]),
                container_statuses: Some(vec![ContainerStatus {
                    name: SERVER_CONTAINER.to_string(),
                    ready: true,
                    state: Some(ContainerState {
                        running: Some(ContainerStateRunning {
                            started_at: Some(Time(now)),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        };
        Self { pod }
    }

    fn status(&mut self) -> &mut PodStatus {
        self.pod.status.get_or_insert_with(Default::default)
    }

    fn set_condition(&mut self, kind: &str, value: bool, at: DateTime<Utc>) {
        let conditions = self.status().conditions.get_or_insert_with(Vec::new);
        conditions.retain(|c| c.type_ != kind);
        conditions.push(condition(kind, value, at));
    }

    fn server_status(&mut self) -> &mut ContainerStatus {
        let statuses = self.status().container_statuses.get_or_insert_with(Vec::new);
        let idx = match statuses.iter().position(|c| c.name == SERVER_CONTAINER) {
            Some(idx) => idx,
            None => {
                statuses.push(ContainerStatus {
                    name: SERVER_CONTAINER.to_string(),
                    ..Default::default()
                });
                statuses.len() - 1
            }
        };
        &mut statuses[idx]
    }

    pub fn on_node(mut self, node: &str) -> Self {
        if let Some(spec) = self.pod.spec.as_mut() {
            spec.node_name = Some(node.to_string());
        }
        self
    }

    pub fn ready(mut self, ready: bool) -> Self {
        self.set_condition("Ready", ready, Utc::now());
        self.server_status().ready = ready;
        self
    }

    /// Pod waiting for a node since `since`.
    pub fn unscheduled_since(mut self, since: DateTime<Utc>) -> Self {
        self.pod.metadata.creation_timestamp = Some(Time(since));
        if let Some(spec) = self.pod.spec.as_mut() {
            spec.node_name = None;
        }
        let status = self.status();
        status.phase = Some("Pending".to_string());
        status.container_statuses = None;
        self.set_condition("PodScheduled", false, since);
        self.set_condition("Ready", false, since);
        self
    }

    pub fn marked_for_deletion(mut self, at: DateTime<Utc>) -> Self {
        self.pod.metadata.deletion_timestamp = Some(Time(at));
        self
    }

    pub fn grace_period(mut self, secs: i64) -> Self {
        self.pod.metadata.deletion_grace_period_seconds = Some(secs);
        self
    }

    pub fn finalizers(mut self, finalizers: &[&str]) -> Self {
        self.pod.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn restart_policy(mut self, policy: &str) -> Self {
        if let Some(spec) = self.pod.spec.as_mut() {
            spec.restart_policy = Some(policy.to_string());
        }
        self
    }

    /// Server container exited with `exit_code`.
    pub fn server_terminated(mut self, exit_code: i32, finished_at: DateTime<Utc>) -> Self {
        let server = self.server_status();
        server.ready = false;
        server.state = Some(ContainerState {
            terminated: Some(terminated(exit_code, finished_at)),
            ..Default::default()
        });
        self.set_condition("Ready", false, finished_at);
        self
    }

    /// Server container was restarted in place after exiting with `exit_code`.
    pub fn server_restarted(mut self, exit_code: i32, finished_at: DateTime<Utc>, restarts: i32) -> Self {
        let server = self.server_status();
        server.restart_count = restarts;
        server.last_state = Some(ContainerState {
            terminated: Some(terminated(exit_code, finished_at)),
            ..Default::default()
        });
        self
    }

    /// An init container exited with `exit_code`.
    pub fn init_container_terminated(mut self, name: &str, exit_code: i32) -> Self {
        let now = Utc::now();
        let statuses = self.status().init_container_statuses.get_or_insert_with(Vec::new);
        statuses.retain(|c| c.name != name);
        statuses.push(ContainerStatus {
            name: name.to_string(),
            state: Some(ContainerState {
                terminated: Some(terminated(exit_code, now)),
                ..Default::default()
            }),
            ..Default::default()
        });
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        self.status().phase = Some(phase.to_string());
        self
    }

    pub fn build(self) -> Pod {
        self.pod
    }
}

/// Builds a member volume claim.
pub struct PvcBuilder {
    pvc: PersistentVolumeClaim,
}

impl PvcBuilder {
    pub fn new(name: &str, deployment: &str) -> Self {
        let mut meta = ObjectMeta {
            name: Some(name.to_string()),
            creation_timestamp: Some(Time(Utc::now())),
            resource_version: Some("1".to_string()),
            ..Default::default()
        };
        meta.labels = Some(BTreeMap::from([(
            LABEL_DEPLOYMENT.to_string(),
            deployment.to_string(),
        )]));
        Self {
            pvc: PersistentVolumeClaim {
                metadata: meta,
                ..Default::default()
            },
        }
    }

    pub fn finalizers(mut self, finalizers: &[&str]) -> Self {
        self.pvc.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn marked_for_deletion(mut self, at: DateTime<Utc>) -> Self {
        self.pvc.metadata.deletion_timestamp = Some(Time(at));
        self
    }

    pub fn build(self) -> PersistentVolumeClaim {
        self.pvc
    }
}

/// A node, optionally cordoned.
pub fn node(name: &str, unschedulable: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            unschedulable: Some(unschedulable),
            ..Default::default()
        }),
        ..Default::default()
    }
}
