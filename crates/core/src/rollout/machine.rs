use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use crate::domain::rollout::RolloutStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutEvent {
    Started,
    SimulationPassed,
    SimulationFailed,
    CanaryPassed,
    CanaryFailed,
    ProductionDeployed,
    MonitoringElapsed,
    DeploymentFailed,
    AbortRequested,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: RolloutStatus,
    pub to: RolloutStatus,
    pub event: RolloutEvent,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RolloutTransitionError {
    #[error("invalid rollout transition from {state:?} using event {event:?}")]
    InvalidTransition { state: RolloutStatus, event: RolloutEvent },
    #[error("rollout already reached terminal status {0:?}")]
    AlreadyTerminal(RolloutStatus),
}

/// Forward-only rollout lifecycle:
/// pending, simulating, canarying, deploying_full, monitoring, then a terminal status.
#[derive(Clone, Debug, Default)]
pub struct RolloutMachine;

impl RolloutMachine {
    pub fn initial_state(&self) -> RolloutStatus {
        RolloutStatus::Pending
    }

    pub fn apply(
        &self,
        current: RolloutStatus,
        event: RolloutEvent,
    ) -> Result<TransitionOutcome, RolloutTransitionError> {
        use RolloutEvent::{
            AbortRequested, CanaryFailed, CanaryPassed, DeploymentFailed, MonitoringElapsed,
            ProductionDeployed, SimulationFailed, SimulationPassed, Started,
        };
        use RolloutStatus::{
            Aborted, Canarying, DeployingFull, Failed, Monitoring, Pending, Simulating, Succeeded,
        };

        if current.is_terminal() {
            return Err(RolloutTransitionError::AlreadyTerminal(current));
        }

        let to = match (current, event) {
            (Pending, Started) => Simulating,
            (Simulating, SimulationPassed) => Canarying,
            (Simulating, SimulationFailed) => Failed,
            (Canarying, CanaryPassed) => DeployingFull,
            (Canarying, CanaryFailed) => Failed,
            (DeployingFull, ProductionDeployed) => Monitoring,
            (Monitoring, MonitoringElapsed) => Succeeded,
            (_, DeploymentFailed) => Failed,
            (_, AbortRequested) => Aborted,
            _ => {
                return Err(RolloutTransitionError::InvalidTransition { state: current, event });
            }
        };

        Ok(TransitionOutcome { from: current, to, event })
    }

    pub fn apply_with_audit<S>(
        &self,
        current: RolloutStatus,
        event: RolloutEvent,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, RolloutTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, event);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    audit
                        .event(
                            "rollout.transition_applied",
                            AuditCategory::Rollout,
                            AuditOutcome::Success,
                        )
                        .with_metadata("from", outcome.from.as_str())
                        .with_metadata("to", outcome.to.as_str())
                        .with_metadata("event", format!("{:?}", outcome.event)),
                );
            }
            Err(error) => {
                sink.emit(
                    audit
                        .event(
                            "rollout.transition_rejected",
                            AuditCategory::Rollout,
                            AuditOutcome::Rejected,
                        )
                        .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}
