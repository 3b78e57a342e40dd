use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

use super::{remaining_agents_healthy, ClusterControl, ClusterHealth, JobStatus, MemberHealth};
use crate::error::{OperatorError, Result};
use crate::member::ServerGroup;

/// Deterministic cluster for tests and dry runs.
///
/// Health, job progress and cleaned-out servers are set by the caller; every
/// cleanout request is recorded.
#[derive(Default)]
pub struct ScriptedClusterControl {
    state: Mutex<Script>,
}

#[derive(Default)]
struct Script {
    health: ClusterHealth,
    health_error: Option<String>,
    jobs: BTreeMap<String, JobStatus>,
    cleaned_out: BTreeSet<String>,
    cleanout_requests: Vec<String>,
    health_calls: usize,
    next_job: u64,
}

impl ScriptedClusterControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `member_id` in the health view.
    pub fn set_member(&self, member_id: &str, group: ServerGroup, alive: bool) {
        self.state.lock().health.members.insert(
            member_id.to_string(),
            MemberHealth {
                group: Some(group),
                alive,
            },
        );
    }

    /// Drop `member_id` from the health view.
    pub fn forget_member(&self, member_id: &str) {
        self.state.lock().health.members.remove(member_id);
    }

    /// Make health queries fail with `error`, or succeed again with `None`.
    pub fn fail_health(&self, error: Option<&str>) {
        self.state.lock().health_error = error.map(str::to_string);
    }

    pub fn set_job_status(&self, job_id: &str, status: JobStatus) {
        self.state.lock().jobs.insert(job_id.to_string(), status);
    }

    pub fn set_cleaned_out(&self, member_id: &str) {
        self.state.lock().cleaned_out.insert(member_id.to_string());
    }

    /// Members a cleanout was requested for, in order.
    pub fn cleanout_requests(&self) -> Vec<String> {
        self.state.lock().cleanout_requests.clone()
    }

    pub fn health_calls(&self) -> usize {
        self.state.lock().health_calls
    }

    fn current_health(&self) -> Result<ClusterHealth> {
        let mut state = self.state.lock();
        state.health_calls += 1;
        match state.health_error {
            Some(ref e) => Err(OperatorError::HealthUnavailable(e.clone())),
            None => Ok(state.health.clone()),
        }
    }
}

#[async_trait]
impl ClusterControl for ScriptedClusterControl {
    async fn health(&self) -> Result<ClusterHealth> {
        self.current_health()
    }

    async fn clean_out_server(&self, member_id: &str) -> Result<String> {
        let mut state = self.state.lock();
        state.next_job += 1;
        let job_id = format!("job-{}", state.next_job);
        state.jobs.insert(job_id.clone(), JobStatus::Pending);
        state.cleanout_requests.push(member_id.to_string());
        Ok(job_id)
    }

    async fn cleanout_job_status(&self, job_id: &str) -> Result<JobStatus> {
        self.state
            .lock()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| OperatorError::Cluster(format!("unknown job {}", job_id)))
    }

    async fn is_cleaned_out(&self, member_id: &str) -> Result<bool> {
        Ok(self.state.lock().cleaned_out.contains(member_id))
    }

    async fn agency_healthy(&self, exclude: &str) -> Result<()> {
        let health = self.current_health()?;
        remaining_agents_healthy(&health, exclude)
    }
}
