//! Release gates ("finalizers") on member pods and volume claims.
//!
//! Each finalizer name maps to one [`PodGuard`] (or, for volume claims, to
//! [`member_exists`]). Guards see a single consistent [`ObservedFacts`]
//! snapshot and return a [`Verdict`]: the decision plus the member status
//! changes they want recorded. The [`FinalizerEngine`](crate::finalizers::FinalizerEngine)
//! applies the effects and removes approved finalizers; guards never touch
//! the resources themselves.

mod agency;
mod delay;
mod drain;
mod member_exists;

pub use agency::AgencyServingGuard;
pub use delay::{DelayGuard, GracefulShutdownGuard};
pub use drain::{DrainGuard, DrainState};
pub use member_exists::member_exists;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};

use crate::member::{ConditionType, MemberPhase, MemberStatus};

/// Finalizer guarding an agent's pod while it serves the agency.
pub const FINALIZER_AGENCY_SERVING: &str = "agent.dbcluster.io/agency-serving";
/// Finalizer guarding a data-server's pod until it is drained.
pub const FINALIZER_DRAIN: &str = "dbserver.dbcluster.io/drain";
/// Finalizer held until the server container has stopped.
pub const FINALIZER_GRACEFUL_SHUTDOWN: &str = "dbcluster.io/graceful-shutdown";
/// Finalizer holding a pod for the group's shutdown delay.
pub const FINALIZER_DELAY: &str = "pod.dbcluster.io/delay";
/// Finalizer holding a volume claim while its member is part of the topology.
pub const FINALIZER_MEMBER_EXISTS: &str = "pvc.dbcluster.io/member-exists";

/// Outcome of one guard evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Approved,
    Denied(String),
}

impl GuardDecision {
    pub fn denied(reason: impl Into<String>) -> Self {
        GuardDecision::Denied(reason.into())
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, GuardDecision::Approved)
    }
}

/// Change to the member status requested by a guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEffect {
    /// Set a condition to true.
    SetCondition {
        condition: ConditionType,
        reason: String,
    },
    /// Enter `Drain` with a cleanout job.
    StartDrain { job_id: String },
    /// Move to a phase, clearing any cleanout job unless it is `Drain`.
    SetPhase(MemberPhase),
    /// Record why the last cleanout job failed.
    CleanoutFailed { reason: String },
}

impl MemberEffect {
    pub fn condition(condition: ConditionType, reason: impl Into<String>) -> Self {
        MemberEffect::SetCondition {
            condition,
            reason: reason.into(),
        }
    }

    /// Apply to `member`. Returns true if the member changed.
    pub fn apply_to(&self, member: &mut MemberStatus) -> bool {
        match self {
            MemberEffect::SetCondition { condition, reason } => {
                member.conditions.update(*condition, true, reason.as_str(), "")
            }
            MemberEffect::StartDrain { job_id } => {
                let changed = member.phase != MemberPhase::Drain
                    || member.cleanout_job_id.as_deref() != Some(job_id.as_str());
                member.start_drain(job_id.as_str());
                changed
            }
            MemberEffect::SetPhase(phase) => {
                let changed = member.phase != *phase
                    || (*phase != MemberPhase::Drain && member.cleanout_job_id.is_some());
                member.set_phase(*phase);
                changed
            }
            MemberEffect::CleanoutFailed { reason } => {
                member
                    .conditions
                    .set(ConditionType::CleanedOut, false, "Cleanout Failed", reason.as_str())
            }
        }
    }

    /// The effect records work started in the cluster, which is lost unless
    /// stored before anything else can fail.
    pub fn starts_cluster_job(&self) -> bool {
        matches!(self, MemberEffect::StartDrain { .. })
    }
}

/// Guard decision plus the status changes to record with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub decision: GuardDecision,
    pub effects: Vec<MemberEffect>,
}

impl Verdict {
    pub fn approve() -> Self {
        Self {
            decision: GuardDecision::Approved,
            effects: Vec::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: GuardDecision::denied(reason),
            effects: Vec::new(),
        }
    }

    pub fn with_effect(mut self, effect: MemberEffect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Everything a guard may look at, captured once per pod per tick.
#[derive(Debug, Clone)]
pub struct ObservedFacts<'a> {
    pub pod: &'a Pod,
    pub member: &'a MemberStatus,
    /// Volume claim of the member. `None` if it was not found.
    pub pvc: Option<&'a PersistentVolumeClaim>,
    /// The pod's node is cordoned.
    pub node_unschedulable: bool,
    /// The whole deployment is being deleted.
    pub deployment_deleting: bool,
    /// Member volumes survive node eviction.
    pub network_attached_volumes: bool,
    /// Shutdown delay configured for the member's group.
    pub shutdown_delay: std::time::Duration,
    /// The server container is confirmed stopped.
    pub server_dead: bool,
    pub now: DateTime<Utc>,
}

impl ObservedFacts<'_> {
    /// The member's volume claim is being deleted.
    pub fn pvc_marked_for_deletion(&self) -> bool {
        self.pvc
            .map(crate::resources::pods::is_pvc_marked_for_deletion)
            .unwrap_or(false)
    }
}

/// Check deciding whether one pod finalizer may be removed.
#[async_trait]
pub trait PodGuard: Send + Sync {
    /// Finalizer name this guard answers for.
    fn finalizer(&self) -> &'static str;

    async fn evaluate(&self, facts: &ObservedFacts<'_>) -> Verdict;
}
