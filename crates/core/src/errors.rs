use thiserror::Error;

use crate::domain::candidate::{RuleId, ValidationError};
use crate::domain::rollout::{ExecutionId, RolloutStatus};
use crate::rollout::machine::RolloutTransitionError;
use crate::rollout::store::StoreError;

/// Errors surfaced to callers of the rollout operation surface.
///
/// Threshold breaches and provider failures during a run are not errors here:
/// they end the execution as `failed` and are read back through its status.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RolloutError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("rule `{rule_id}` already has an active rollout `{execution_id}`")]
    ConcurrencyConflict { rule_id: RuleId, execution_id: ExecutionId },
    #[error("no rollout recorded for rule `{0}`")]
    NotFound(RuleId),
    #[error("rollout for rule `{rule_id}` is not active (status `{}`)", .status.as_str())]
    NotActive { rule_id: RuleId, status: RolloutStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] RolloutTransitionError),
}

impl RolloutError {
    /// Stable identifier used in CLI payloads and logs.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::NotFound(_) => "not_found",
            Self::NotActive { .. } => "not_active",
            Self::Store(_) => "store",
            Self::Transition(_) => "invalid_transition",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Validation(_) => "The rule candidate was rejected. Fix it and try again.",
            Self::ConcurrencyConflict { .. } => {
                "A rollout is already in progress for this rule. Wait for it or abort it first."
            }
            Self::NotFound(_) => "No rollout has been recorded for this rule.",
            Self::NotActive { .. } => "The rollout has already finished.",
            Self::Store(_) => "Rollout state is temporarily unavailable. Please retry shortly.",
            Self::Transition(_) => "An unexpected internal error occurred.",
        }
    }

    pub fn from_lookup(rule_id: &RuleId, error: StoreError) -> Self {
        match error {
            StoreError::NotFound(_) => Self::NotFound(rule_id.clone()),
            other => Self::Store(other),
        }
    }
}
