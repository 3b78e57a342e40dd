use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ObservedFacts, PodGuard, Verdict, FINALIZER_DELAY, FINALIZER_GRACEFUL_SHUTDOWN};
use crate::resources::pods::deletion_timestamp;

/// Holds a deleted pod for the group's shutdown delay, counted from the
/// moment its grace period started.
pub struct DelayGuard;

#[async_trait]
impl PodGuard for DelayGuard {
    fn finalizer(&self) -> &'static str {
        FINALIZER_DELAY
    }

    async fn evaluate(&self, facts: &ObservedFacts<'_>) -> Verdict {
        if facts.shutdown_delay.is_zero() {
            return Verdict::approve();
        }
        let Some(deleted_at) = deletion_timestamp(&facts.pod.metadata) else {
            return Verdict::deny("pod is not being deleted");
        };
        let Ok(delay) = chrono::Duration::from_std(facts.shutdown_delay) else {
            return Verdict::deny("shutdown delay out of range");
        };

        let grace_secs = facts.pod.metadata.deletion_grace_period_seconds.unwrap_or(0);
        let release_at = chrono::Duration::try_seconds(grace_secs)
            .and_then(|grace| deleted_at.checked_sub_signed(grace))
            .and_then(|start| start.checked_add_signed(delay));
        let Some(release_at) = release_at else {
            warn!(member = %facts.member.id, grace_secs, "Shutdown delay ends beyond representable time");
            return Verdict::deny("shutdown delay out of range");
        };

        if facts.now >= release_at {
            Verdict::approve()
        } else {
            let left = release_at - facts.now;
            debug!(member = %facts.member.id, left_secs = left.num_seconds(), "Shutdown delay not over");
            Verdict::deny(format!("shutdown delay ends in {}s", left.num_seconds()))
        }
    }
}

/// Held until the server container has stopped.
pub struct GracefulShutdownGuard;

#[async_trait]
impl PodGuard for GracefulShutdownGuard {
    fn finalizer(&self) -> &'static str {
        FINALIZER_GRACEFUL_SHUTDOWN
    }

    async fn evaluate(&self, facts: &ObservedFacts<'_>) -> Verdict {
        if facts.server_dead {
            Verdict::approve()
        } else {
            Verdict::deny("server container still running")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::{MemberStatus, ServerGroup};
    use crate::resources::PodBuilder;
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    fn facts<'a>(
        pod: &'a k8s_openapi::api::core::v1::Pod,
        member: &'a MemberStatus,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> ObservedFacts<'a> {
        ObservedFacts {
            pod,
            member,
            pvc: None,
            node_unschedulable: false,
            deployment_deleting: false,
            network_attached_volumes: false,
            shutdown_delay: delay,
            server_dead: false,
            now,
        }
    }

    #[tokio::test]
    async fn test_delay_counts_from_grace_start() {
        let deleted_at = Utc::now();
        let pod = PodBuilder::new("db-crdn-1", "db", ServerGroup::Coordinators)
            .marked_for_deletion(deleted_at)
            .grace_period(30)
            .build();
        let member = MemberStatus::new("CRDN-1", ServerGroup::Coordinators, Utc::now());
        let delay = Duration::from_secs(60);

        // Grace started 30s before the deletion timestamp; release 30s after it.
        let early = facts(&pod, &member, delay, deleted_at + chrono::Duration::seconds(10));
        assert!(!DelayGuard.evaluate(&early).await.decision.is_approved());

        let late = facts(&pod, &member, delay, deleted_at + chrono::Duration::seconds(31));
        assert!(DelayGuard.evaluate(&late).await.decision.is_approved());
    }

    #[tokio::test]
    async fn test_huge_delay_is_held_not_panicking() {
        let pod = PodBuilder::new("db-crdn-1", "db", ServerGroup::Coordinators)
            .marked_for_deletion(Utc::now())
            .build();
        let member = MemberStatus::new("CRDN-1", ServerGroup::Coordinators, Utc::now());

        let f = facts(&pod, &member, Duration::from_secs(9_000_000_000_000), Utc::now());
        assert_eq!(
            DelayGuard.evaluate(&f).await,
            Verdict::deny("shutdown delay out of range")
        );
    }

    #[tokio::test]
    async fn test_huge_grace_period_is_held() {
        let pod = PodBuilder::new("db-crdn-1", "db", ServerGroup::Coordinators)
            .marked_for_deletion(Utc::now())
            .grace_period(i64::MAX)
            .build();
        let member = MemberStatus::new("CRDN-1", ServerGroup::Coordinators, Utc::now());

        let f = facts(&pod, &member, Duration::from_secs(60), Utc::now());
        assert!(!DelayGuard.evaluate(&f).await.decision.is_approved());
    }

    #[tokio::test]
    async fn test_zero_delay_releases() {
        let pod = PodBuilder::new("db-crdn-1", "db", ServerGroup::Coordinators)
            .marked_for_deletion(Utc::now())
            .build();
        let member = MemberStatus::new("CRDN-1", ServerGroup::Coordinators, Utc::now());

        let f = facts(&pod, &member, Duration::ZERO, Utc::now());
        assert_eq!(DelayGuard.evaluate(&f).await, Verdict::approve());
    }

    #[tokio::test]
    async fn test_graceful_shutdown_waits_for_dead_server() {
        let pod = PodBuilder::new("db-crdn-1", "db", ServerGroup::Coordinators).build();
        let member = MemberStatus::new("CRDN-1", ServerGroup::Coordinators, Utc::now());
        let mut f = facts(&pod, &member, Duration::ZERO, Utc::now());

        assert!(!GracefulShutdownGuard.evaluate(&f).await.decision.is_approved());
        f.server_dead = true;
        assert!(GracefulShutdownGuard.evaluate(&f).await.decision.is_approved());
    }
}
