//! Kubernetes events raised for a deployment.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Notable change observed while reconciling a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentEvent {
    /// A member's pod disappeared without being asked to.
    PodGone { pod: String, role: String },
    /// Pods could not be scheduled within the timeout.
    PodsSchedulingFailure { pods: Vec<String> },
    /// No pod is waiting for a node anymore.
    PodsSchedulingResolved,
    /// A member vanished from the cluster and was taken out of the topology.
    MemberRemoved { member: String, role: String },
    /// The cleanout job of a data-server failed; its pod is kept.
    CleanoutFailed { member: String, reason: String },
}

impl DeploymentEvent {
    pub fn reason(&self) -> &'static str {
        match self {
            DeploymentEvent::PodGone { .. } => "PodGone",
            DeploymentEvent::PodsSchedulingFailure { .. } => "PodsSchedulingFailure",
            DeploymentEvent::PodsSchedulingResolved => "PodsSchedulingResolved",
            DeploymentEvent::MemberRemoved { .. } => "MemberRemoved",
            DeploymentEvent::CleanoutFailed { .. } => "CleanoutFailed",
        }
    }

    pub fn message(&self) -> String {
        match self {
            DeploymentEvent::PodGone { pod, role } => {
                format!("Pod {} of member {} is gone", pod, role)
            }
            DeploymentEvent::PodsSchedulingFailure { pods } => {
                format!("The following pods cannot be scheduled: {}", pods.join(", "))
            }
            DeploymentEvent::PodsSchedulingResolved => {
                "No pod reports a scheduling timeout".to_string()
            }
            DeploymentEvent::MemberRemoved { member, role } => {
                format!("Member {} ({}) is no longer part of the cluster", member, role)
            }
            DeploymentEvent::CleanoutFailed { member, reason } => {
                format!("Cleanout of data-server {} failed: {}", member, reason)
            }
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            DeploymentEvent::PodGone { .. }
                | DeploymentEvent::PodsSchedulingFailure { .. }
                | DeploymentEvent::CleanoutFailed { .. }
        )
    }

    /// Event as published through the kube event recorder.
    pub fn to_kube_event(&self) -> Event {
        Event {
            type_: if self.is_warning() {
                EventType::Warning
            } else {
                EventType::Normal
            },
            reason: self.reason().to_string(),
            note: Some(self.message()),
            action: "Reconcile".to_string(),
            secondary: None,
        }
    }
}

/// Destination of deployment events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish an event. Failures are logged, never returned.
    async fn publish(&self, event: &DeploymentEvent);
}

/// Publishes events on the deployment object through the kube recorder.
pub struct KubeEventSink {
    recorder: Recorder,
    reference: ObjectReference,
}

impl KubeEventSink {
    pub fn new(recorder: Recorder, reference: ObjectReference) -> Self {
        Self {
            recorder,
            reference,
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, event: &DeploymentEvent) {
        if let Err(e) = self
            .recorder
            .publish(&event.to_kube_event(), &self.reference)
            .await
        {
            warn!(reason = event.reason(), error = %e, "Failed to publish event");
        }
    }
}

/// Keeps published events in memory.
#[cfg(any(test, feature = "test-helpers"))]
#[derive(Default)]
pub struct CollectingSink {
    events: parking_lot::Mutex<Vec<DeploymentEvent>>,
}

#[cfg(any(test, feature = "test-helpers"))]
impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DeploymentEvent> {
        self.events.lock().clone()
    }
}

#[cfg(any(test, feature = "test-helpers"))]
#[async_trait]
impl EventSink for CollectingSink {
    async fn publish(&self, event: &DeploymentEvent) {
        self.events.lock().push(event.clone());
    }
}
