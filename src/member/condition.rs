use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kind of a condition. Conditions are a closed set; there is no string-keyed
/// escape hatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    /// Pod (member) or all members (deployment) are ready.
    Ready,
    /// Pod has been marked for deletion.
    Terminating,
    /// Server process of the member has terminated.
    Terminated,
    /// Agent must fully resynchronize when recreated.
    AgentRecoveryNeeded,
    /// All data has been moved off the data-server.
    CleanedOut,
    /// Member has been seen in the cluster's own health view.
    MemberOfCluster,
    /// Upgrade init container failed.
    UpgradeFailed,
    /// Deployment level: pods cannot be scheduled.
    PodSchedulingFailure,
}

/// A single named boolean with reason and message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition kind.
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    /// Current value.
    pub status: bool,
    /// Machine readable reason of the last transition.
    #[serde(default)]
    pub reason: String,
    /// Human readable message of the last transition.
    #[serde(default)]
    pub message: String,
    /// Time of the last transition.
    pub last_transition_time: DateTime<Utc>,
}

/// Set of conditions, at most one per [`ConditionType`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ConditionList(Vec<Condition>);

impl ConditionList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the condition to `status`.
    ///
    /// Returns true when the list changed. Setting a condition to the value it
    /// already has is a no-op, so callers can use the return value to trigger
    /// one-shot side effects.
    pub fn update(
        &mut self,
        condition_type: ConditionType,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        if let Some(existing) = self.0.iter_mut().find(|c| c.condition_type == condition_type) {
            if existing.status == status {
                return false;
            }
            existing.status = status;
            existing.reason = reason.into();
            existing.message = message.into();
            existing.last_transition_time = Utc::now();
            return true;
        }

        self.0.push(Condition {
            condition_type,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        });
        true
    }

    /// Set the condition to `status` with `reason` and `message`, also when
    /// only the reason or message differ. Returns true when the list changed.
    pub fn set(
        &mut self,
        condition_type: ConditionType,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        let (reason, message) = (reason.into(), message.into());
        if let Some(existing) = self.0.iter_mut().find(|c| c.condition_type == condition_type) {
            if existing.status == status && existing.reason == reason && existing.message == message {
                return false;
            }
            if existing.status != status {
                existing.last_transition_time = Utc::now();
            }
            existing.status = status;
            existing.reason = reason;
            existing.message = message;
            return true;
        }
        self.update(condition_type, status, reason, message)
    }

    /// Returns true if the condition exists and is true.
    pub fn is_true(&self, condition_type: ConditionType) -> bool {
        self.get(condition_type).map(|c| c.status).unwrap_or(false)
    }

    /// Get the condition of the given kind.
    pub fn get(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.condition_type == condition_type)
    }

    /// Remove the condition of the given kind. Returns true if it existed.
    pub fn remove(&mut self, condition_type: ConditionType) -> bool {
        let before = self.0.len();
        self.0.retain(|c| c.condition_type != condition_type);
        before != self.0.len()
    }

    /// Iterate over all conditions.
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    /// Number of conditions.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no condition is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
