//! Configuration module for the operator.

use crate::error::{OperatorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration of the operator process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Cluster health cache settings.
    pub health: HealthConfig,
    /// Stale member reclamation settings.
    pub reclaim: ReclaimConfig,
    /// Pod/volume inspection settings.
    pub inspection: InspectionConfig,
    /// Timeouts of outbound calls.
    pub timeouts: TimeoutConfig,
    /// How to reach the database cluster of a deployment.
    pub database: DatabaseConfig,
}

impl OperatorConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OperatorError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| OperatorError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.health.refresh_interval_secs == 0 {
            return Err(OperatorError::InvalidConfig {
                field: "health.refresh_interval_secs".to_string(),
                reason: "Refresh interval must be non-zero".to_string(),
            });
        }

        if self.health.max_age_secs <= self.health.refresh_interval_secs {
            return Err(OperatorError::InvalidConfig {
                field: "health.max_age_secs".to_string(),
                reason: "Maximum health age must exceed the refresh interval".to_string(),
            });
        }

        if self.reclaim.interval_secs == 0 {
            return Err(OperatorError::InvalidConfig {
                field: "reclaim.interval_secs".to_string(),
                reason: "Reclaim interval must be non-zero".to_string(),
            });
        }

        if self.timeouts.kubernetes_secs == 0 || self.timeouts.cluster_secs == 0 {
            return Err(OperatorError::InvalidConfig {
                field: "timeouts".to_string(),
                reason: "Timeouts must be non-zero".to_string(),
            });
        }

        if self.inspection.tick_deadline_secs < self.timeouts.cluster_secs {
            return Err(OperatorError::InvalidConfig {
                field: "inspection.tick_deadline_secs".to_string(),
                reason: "Tick deadline must cover at least one cluster call".to_string(),
            });
        }

        Ok(())
    }
}

/// Cluster health cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Period of the health refresh loop.
    pub refresh_interval_secs: u64,
    /// Snapshots older than this are not used for decisions.
    pub max_age_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 5,
            max_age_secs: 20,
        }
    }
}

impl HealthConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Stale member reclamation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    /// Period of the reclaim loop.
    pub interval_secs: u64,
    /// Members never seen in the cluster are kept at least this long.
    pub min_member_age_secs: u64,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            min_member_age_secs: 600,
        }
    }
}

impl ReclaimConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn min_member_age(&self) -> Duration {
        Duration::from_secs(self.min_member_age_secs)
    }
}

/// Pod/volume inspection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectionConfig {
    /// Unscheduled pods older than this raise a scheduling failure.
    pub pod_schedule_timeout_secs: u64,
    /// A server restarting within this window of its previous termination
    /// is marked terminated.
    pub restart_window_secs: u64,
    /// Upper bound for one reconciliation tick.
    pub tick_deadline_secs: u64,
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            pod_schedule_timeout_secs: 60,
            restart_window_secs: 30,
            tick_deadline_secs: 60,
        }
    }
}

impl InspectionConfig {
    pub fn pod_schedule_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_schedule_timeout_secs)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    pub fn tick_deadline(&self) -> Duration {
        Duration::from_secs(self.tick_deadline_secs)
    }
}

/// Timeouts of outbound calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Kubernetes API calls.
    pub kubernetes_secs: u64,
    /// Database cluster API calls.
    pub cluster_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            kubernetes_secs: 10,
            cluster_secs: 15,
        }
    }
}

impl TimeoutConfig {
    pub fn kubernetes(&self) -> Duration {
        Duration::from_secs(self.kubernetes_secs)
    }

    pub fn cluster(&self) -> Duration {
        Duration::from_secs(self.cluster_secs)
    }
}

/// How to reach the database cluster of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// URL scheme of the cluster API.
    pub scheme: String,
    /// Port of the cluster API service.
    pub port: u16,
    /// Optional bearer token.
    pub token: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            port: 8529,
            token: None,
        }
    }
}

impl DatabaseConfig {
    /// Endpoint of the deployment's client service.
    pub fn endpoint(&self, deployment: &str, namespace: &str) -> String {
        format!(
            "{}://{}.{}.svc:{}",
            self.scheme, deployment, namespace, self.port
        )
    }
}
