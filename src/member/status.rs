use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ConditionList, ConditionType, MemberPhase, ServerGroup};

/// Number of termination timestamps kept per member.
pub const MAX_RECENT_TERMINATIONS: usize = 10;

/// Status of a single cluster member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    /// Stable identifier, immutable for the lifetime of the member.
    pub id: String,
    /// Role of the member.
    pub group: ServerGroup,
    /// Lifecycle phase.
    #[serde(default)]
    pub phase: MemberPhase,
    /// Condition set.
    #[serde(default)]
    pub conditions: ConditionList,
    /// Name of the pod currently backing this member.
    #[serde(default)]
    pub pod_name: Option<String>,
    /// Name of the volume claim holding the member's data.
    #[serde(default)]
    pub persistent_volume_claim_name: Option<String>,
    /// Handle of the cleanout job; only set while the phase is `Drain`.
    #[serde(default)]
    pub cleanout_job_id: Option<String>,
    /// Recent termination times, oldest first.
    #[serde(default)]
    pub recent_terminations: Vec<DateTime<Utc>>,
    /// Time the member was admitted to the topology.
    pub created_at: DateTime<Utc>,
    /// Set once the member has been ready; never reverts.
    #[serde(default)]
    pub is_initialized: bool,
    /// Set when the version check requested an upgrade.
    #[serde(default)]
    pub upgrade: bool,
}

impl MemberStatus {
    /// Create a new member in phase `None`.
    pub fn new(id: impl Into<String>, group: ServerGroup, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            group,
            phase: MemberPhase::None,
            conditions: ConditionList::new(),
            pod_name: None,
            persistent_volume_claim_name: None,
            cleanout_job_id: None,
            recent_terminations: Vec::new(),
            created_at,
            is_initialized: false,
            upgrade: false,
        }
    }

    /// Create a new member with a generated ID.
    pub fn with_generated_id(group: ServerGroup, created_at: DateTime<Utc>) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self::new(format!("{}-{}", group.id_prefix(), &suffix[..8]), group, created_at)
    }

    /// Set the pod name.
    pub fn with_pod(mut self, pod_name: impl Into<String>) -> Self {
        self.pod_name = Some(pod_name.into());
        self
    }

    /// Set the volume claim name.
    pub fn with_pvc(mut self, pvc_name: impl Into<String>) -> Self {
        self.persistent_volume_claim_name = Some(pvc_name.into());
        self
    }

    /// Set the phase.
    pub fn with_phase(mut self, phase: MemberPhase) -> Self {
        self.set_phase(phase);
        self
    }

    /// Age of the member at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    /// Move to `phase`. Leaving `Drain` clears the cleanout job handle.
    pub fn set_phase(&mut self, phase: MemberPhase) {
        if phase != MemberPhase::Drain {
            self.cleanout_job_id = None;
        }
        self.phase = phase;
    }

    /// Enter `Drain` with the given cleanout job.
    pub fn start_drain(&mut self, job_id: impl Into<String>) {
        self.phase = MemberPhase::Drain;
        self.cleanout_job_id = Some(job_id.into());
    }

    /// Set `Terminated` to true, recording the termination time on the first
    /// transition. Returns true if the condition changed.
    pub fn mark_terminated(&mut self, reason: &str, at: DateTime<Utc>) -> bool {
        if self.conditions.update(ConditionType::Terminated, true, reason, "") {
            self.record_termination(at);
            return true;
        }
        false
    }

    /// Append a termination time, dropping the oldest beyond the limit.
    pub fn record_termination(&mut self, at: DateTime<Utc>) {
        self.recent_terminations.push(at);
        if self.recent_terminations.len() > MAX_RECENT_TERMINATIONS {
            let excess = self.recent_terminations.len() - MAX_RECENT_TERMINATIONS;
            self.recent_terminations.drain(..excess);
        }
    }

    /// Number of terminations at or after `since`.
    pub fn recent_terminations_since(&self, since: DateTime<Utc>) -> usize {
        self.recent_terminations
            .iter()
            .rev()
            .take_while(|t| **t >= since)
            .count()
    }

    /// Drop terminations older than `before`. Returns the number removed.
    pub fn remove_terminations_before(&mut self, before: DateTime<Utc>) -> usize {
        let old = self.recent_terminations.len();
        self.recent_terminations.retain(|t| *t >= before);
        old - self.recent_terminations.len()
    }

    /// Most recent termination, if any.
    pub fn last_termination(&self) -> Option<DateTime<Utc>> {
        self.recent_terminations.last().copied()
    }
}
