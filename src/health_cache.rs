//! Time-stamped cache of the cluster's health view.
//!
//! The cache is the only state shared between the operator's loops. A single
//! lock guards both refresh and read, and readers always get a copy.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cluster_api::{ClusterControl, ClusterHealth};
use crate::error::{with_timeout, OperatorError, Result};
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;

/// Health view captured at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterHealthSnapshot {
    pub health: ClusterHealth,
    pub captured_at: DateTime<Utc>,
}

impl ClusterHealthSnapshot {
    pub fn new(health: ClusterHealth, captured_at: DateTime<Utc>) -> Self {
        Self {
            health,
            captured_at,
        }
    }

    /// Returns true if the snapshot is not older than `max_age` at `now`.
    pub fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => now - self.captured_at <= max_age,
            Err(_) => true,
        }
    }
}

/// Latest cluster health snapshot of one deployment.
#[derive(Default)]
pub struct ClusterHealthCache {
    latest: Mutex<Option<ClusterHealthSnapshot>>,
}

impl ClusterHealthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot.
    pub fn store(&self, snapshot: ClusterHealthSnapshot) {
        *self.latest.lock() = Some(snapshot);
    }

    /// Copy of the latest snapshot, regardless of age.
    pub fn snapshot(&self) -> Option<ClusterHealthSnapshot> {
        self.latest.lock().clone()
    }

    /// Copy of the latest snapshot if it is not older than `max_age`.
    pub fn fresh_snapshot(&self, max_age: Duration, now: DateTime<Utc>) -> Result<ClusterHealthSnapshot> {
        match self.snapshot() {
            None => Err(OperatorError::HealthUnavailable("no health snapshot yet".to_string())),
            Some(s) if !s.is_fresh(max_age, now) => Err(OperatorError::HealthUnavailable(format!(
                "health snapshot captured at {} is stale",
                s.captured_at
            ))),
            Some(s) => Ok(s),
        }
    }

    /// Fetch the health view and store it. On failure the previous snapshot
    /// stays in place and ages out.
    pub async fn refresh(&self, cluster: &dyn ClusterControl, timeout: Duration) -> Result<()> {
        let health = with_timeout(timeout, "cluster health", cluster.health()).await?;
        debug!(members = health.members.len(), "Cluster health refreshed");
        self.store(ClusterHealthSnapshot::new(health, Utc::now()));
        Ok(())
    }
}

/// Refresh `cache` every `period` until `shutdown` fires.
pub async fn run_health_loop(
    deployment: String,
    cache: Arc<ClusterHealthCache>,
    cluster: Arc<dyn ClusterControl>,
    period: Duration,
    timeout: Duration,
    shutdown: ShutdownCoordinator,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait_for_shutdown() => {
                debug!(deployment = %deployment, "Health loop stopped");
                return;
            }
        }

        match cache.refresh(cluster.as_ref(), timeout).await {
            Ok(()) => metrics::record_health_fetch(&deployment, true),
            Err(e) => {
                warn!(deployment = %deployment, error = %e, "Cluster health refresh failed");
                metrics::record_health_fetch(&deployment, false);
                metrics::record_error(e.kind());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_api::ScriptedClusterControl;
    use crate::member::ServerGroup;

    #[test]
    fn test_empty_cache_is_unavailable() {
        let cache = ClusterHealthCache::new();
        assert!(matches!(
            cache.fresh_snapshot(Duration::from_secs(20), Utc::now()),
            Err(OperatorError::HealthUnavailable(_))
        ));
    }

    #[test]
    fn test_stale_snapshot_is_rejected() {
        let cache = ClusterHealthCache::new();
        let now = Utc::now();
        cache.store(ClusterHealthSnapshot::new(
            ClusterHealth::default(),
            now - chrono::Duration::seconds(30),
        ));

        assert!(cache.fresh_snapshot(Duration::from_secs(20), now).is_err());
        assert!(cache.fresh_snapshot(Duration::from_secs(60), now).is_ok());
    }

    #[test]
    fn test_readers_get_copies() {
        let cache = ClusterHealthCache::new();
        cache.store(ClusterHealthSnapshot::new(ClusterHealth::default(), Utc::now()));

        let mut copy = cache.snapshot().unwrap();
        copy.health.members.clear();
        copy.captured_at = Utc::now() - chrono::Duration::days(1);

        assert!(cache.fresh_snapshot(Duration::from_secs(20), Utc::now()).is_ok());
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_previous_snapshot() {
        let cluster = ScriptedClusterControl::new();
        cluster.set_member("AGNT-1", ServerGroup::Agents, true);
        let cache = ClusterHealthCache::new();

        cache.refresh(&cluster, Duration::from_secs(1)).await.unwrap();
        cluster.fail_health(Some("connection refused"));
        assert!(cache.refresh(&cluster, Duration::from_secs(1)).await.is_err());

        let snapshot = cache.snapshot().unwrap();
        assert!(snapshot.health.is_alive("AGNT-1"));
    }
}
