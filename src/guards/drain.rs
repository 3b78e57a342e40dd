use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{MemberEffect, ObservedFacts, PodGuard, Verdict, FINALIZER_DRAIN};
use crate::cluster_api::{ClusterControl, JobStatus};
use crate::error::{with_timeout, Result};
use crate::member::{ConditionType, MemberPhase, MemberStatus};

/// Drain progress of a data-server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainState {
    /// No cleanout started.
    Created,
    /// Cleanout job in flight.
    Drain { job_id: String },
    /// No data left on the server. Terminal.
    CleanedOut,
    /// Cleanout job failed; the member keeps serving.
    Failed { reason: String },
}

impl DrainState {
    /// Current drain state recorded in the member status.
    pub fn of(member: &MemberStatus) -> Self {
        if member.conditions.is_true(ConditionType::CleanedOut) {
            return DrainState::CleanedOut;
        }
        match (member.phase, member.cleanout_job_id.as_deref()) {
            (MemberPhase::Drain, Some(job)) if !job.is_empty() => DrainState::Drain {
                job_id: job.to_string(),
            },
            _ => DrainState::Created,
        }
    }
}

/// Result of one drain transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainStep {
    pub state: DrainState,
    /// Cleaned out without a completed job because the server already
    /// terminated.
    pub forced: bool,
}

impl DrainStep {
    fn to(state: DrainState) -> Self {
        Self {
            state,
            forced: false,
        }
    }

    fn forced() -> Self {
        Self {
            state: DrainState::CleanedOut,
            forced: true,
        }
    }
}

/// Keeps a data-server's pod until its data has been moved elsewhere.
pub struct DrainGuard {
    cluster: Arc<dyn ClusterControl>,
    timeout: Duration,
}

impl DrainGuard {
    pub fn new(cluster: Arc<dyn ClusterControl>, timeout: Duration) -> Self {
        Self { cluster, timeout }
    }

    /// Move the drain one step forward from `state`.
    pub async fn advance(&self, state: DrainState, member: &MemberStatus) -> Result<DrainStep> {
        let terminated = member.conditions.is_true(ConditionType::Terminated);

        match state {
            DrainState::Created => {
                let cleaned_out = with_timeout(
                    self.timeout,
                    "cleaned out check",
                    self.cluster.is_cleaned_out(&member.id),
                )
                .await?;
                if cleaned_out {
                    return Ok(DrainStep::to(DrainState::CleanedOut));
                }
                if terminated {
                    return Ok(Self::escape(member, None));
                }

                let job_id = with_timeout(
                    self.timeout,
                    "cleanout start",
                    self.cluster.clean_out_server(&member.id),
                )
                .await?;
                info!(member = %member.id, job = %job_id, "Started cleanout of data-server");
                Ok(DrainStep::to(DrainState::Drain { job_id }))
            }
            DrainState::Drain { job_id } => {
                let status = with_timeout(
                    self.timeout,
                    "cleanout job status",
                    self.cluster.cleanout_job_status(&job_id),
                )
                .await?;

                match status {
                    JobStatus::Succeeded => {
                        info!(member = %member.id, job = %job_id, "Cleanout finished");
                        Ok(DrainStep::to(DrainState::CleanedOut))
                    }
                    JobStatus::Failed { reason } => {
                        warn!(member = %member.id, job = %job_id, reason = %reason, "Cleanout job failed");
                        Ok(DrainStep::to(DrainState::Failed { reason }))
                    }
                    JobStatus::Pending if terminated => Ok(Self::escape(member, Some(&job_id))),
                    JobStatus::Pending => {
                        debug!(member = %member.id, job = %job_id, "Cleanout still running");
                        Ok(DrainStep::to(DrainState::Drain { job_id }))
                    }
                }
            }
            done @ (DrainState::CleanedOut | DrainState::Failed { .. }) => Ok(DrainStep::to(done)),
        }
    }

    /// The server is gone while its data was never moved. Holding the
    /// finalizer cannot bring the data back, so the member counts as cleaned
    /// out from here on.
    fn escape(member: &MemberStatus, job_id: Option<&str>) -> DrainStep {
        error!(
            member = %member.id,
            job = job_id.unwrap_or(""),
            degraded_safety = true,
            "Data-server terminated before its cleanout completed, releasing it as cleaned out"
        );
        DrainStep::forced()
    }

    fn data_at_risk(facts: &ObservedFacts<'_>) -> bool {
        (facts.node_unschedulable && !facts.network_attached_volumes)
            || facts.pvc_marked_for_deletion()
            || facts.member.phase == MemberPhase::Drain
    }
}

#[async_trait]
impl PodGuard for DrainGuard {
    fn finalizer(&self) -> &'static str {
        FINALIZER_DRAIN
    }

    async fn evaluate(&self, facts: &ObservedFacts<'_>) -> Verdict {
        let member = facts.member;

        if member.phase.is_failed() {
            return Verdict::approve();
        }
        if !member.conditions.is_true(ConditionType::MemberOfCluster) {
            debug!(member = %member.id, "Not a member of the cluster, drain finalizer can go");
            return Verdict::approve();
        }
        if facts.deployment_deleting {
            return Verdict::approve();
        }

        let state = DrainState::of(member);
        if state == DrainState::CleanedOut {
            return Verdict::approve();
        }
        if member.persistent_volume_claim_name.is_some() && facts.pvc.is_none() {
            warn!(member = %member.id, "Volume claim of the data-server not found, keeping drain finalizer");
            return Verdict::deny("volume claim of the data-server not found");
        }
        if !Self::data_at_risk(facts) {
            debug!(member = %member.id, "Data-server is only restarting, drain finalizer can go");
            return Verdict::approve();
        }

        let step = match self.advance(state, member).await {
            Ok(step) => step,
            Err(e) => {
                debug!(member = %member.id, error = %e, "Drain could not advance");
                return Verdict::deny(format!("drain could not advance: {}", e));
            }
        };

        match step.state {
            DrainState::CleanedOut => {
                let reason = if step.forced {
                    "Draining server failed"
                } else {
                    "CleanedOut"
                };
                let mut verdict = Verdict::approve()
                    .with_effect(MemberEffect::condition(ConditionType::CleanedOut, reason));
                if member.phase == MemberPhase::Drain {
                    verdict = verdict.with_effect(MemberEffect::SetPhase(MemberPhase::Created));
                }
                verdict
            }
            DrainState::Drain { job_id } => {
                Verdict::deny(format!("cleanout job {} in progress", job_id))
                    .with_effect(MemberEffect::StartDrain { job_id })
            }
            DrainState::Failed { reason } => Verdict::deny(format!("cleanout failed: {}", reason))
                .with_effect(MemberEffect::SetPhase(MemberPhase::Created))
                .with_effect(MemberEffect::CleanoutFailed { reason }),
            DrainState::Created => Verdict::deny("cleanout not started"),
        }
    }
}
