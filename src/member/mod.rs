//! Member status model.
//!
//! [`DeploymentStatus`] is the aggregate root persisted in the
//! `ClusterDeployment` status subresource. It holds one [`MemberStatus`] per
//! cluster member, each with its [`MemberPhase`] and [`ConditionList`].

mod condition;
mod deployment;
mod group;
mod phase;
mod status;

pub use condition::{Condition, ConditionList, ConditionType};
pub use deployment::{DeploymentMode, DeploymentStatus, MemberLocation};
pub use group::ServerGroup;
pub use phase::MemberPhase;
pub use status::{MemberStatus, MAX_RECENT_TERMINATIONS};
