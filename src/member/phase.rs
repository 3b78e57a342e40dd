use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum MemberPhase {
    /// No pod exists; the member is waiting to be (re)created.
    #[default]
    None,
    /// Pod creation has been requested.
    Pending,
    /// Pod has been created.
    Created,
    /// Member is being upgraded; its pod is expected to go away.
    Upgrading,
    /// A cleanout job is moving data off the member.
    Drain,
    /// Member is being shut down on purpose.
    ShuttingDown,
    /// Member failed and holds no recoverable state.
    Failed,
}

impl MemberPhase {
    /// Returns true if the member failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, MemberPhase::Failed)
    }

    /// Returns true if the pod has not been created yet.
    pub fn is_awaiting_creation(&self) -> bool {
        matches!(self, MemberPhase::None | MemberPhase::Pending)
    }

    /// Returns true if a missing pod is an expected absence.
    pub fn is_intentional_shutdown(&self) -> bool {
        matches!(
            self,
            MemberPhase::ShuttingDown | MemberPhase::Upgrading | MemberPhase::Failed
        )
    }
}

impl std::fmt::Display for MemberPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
