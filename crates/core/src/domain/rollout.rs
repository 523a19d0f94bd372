use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::candidate::{RuleCandidate, RuleId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(format!("rollout-{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier the enforcement provider assigned to a deployed rule variant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariantId(pub String);

impl std::fmt::Display for VariantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Pending,
    Simulating,
    Canarying,
    DeployingFull,
    Monitoring,
    Succeeded,
    Failed,
    Aborted,
}

impl RolloutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Simulating => "simulating",
            Self::Canarying => "canarying",
            Self::DeployingFull => "deploying_full",
            Self::Monitoring => "monitoring",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "simulating" => Some(Self::Simulating),
            "canarying" => Some(Self::Canarying),
            "deploying_full" => Some(Self::DeployingFull),
            "monitoring" => Some(Self::Monitoring),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    pub fn phase(&self) -> Option<RolloutPhase> {
        match self {
            Self::Simulating => Some(RolloutPhase::Simulation),
            Self::Canarying => Some(RolloutPhase::Canary),
            Self::DeployingFull | Self::Monitoring => Some(RolloutPhase::Production),
            Self::Pending | Self::Succeeded | Self::Failed | Self::Aborted => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    Simulation,
    Canary,
    Production,
}

impl RolloutPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simulation => "simulation",
            Self::Canary => "canary",
            Self::Production => "production",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "simulation" => Some(Self::Simulation),
            "canary" => Some(Self::Canary),
            "production" => Some(Self::Production),
            _ => None,
        }
    }

    /// Shadow and canary variants are temporary; the production rule is kept.
    pub fn is_temporary(&self) -> bool {
        !matches!(self, Self::Production)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseDecision {
    Proceed,
    Rollback,
    Warn,
}

impl PhaseDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proceed => "proceed",
            Self::Rollback => "rollback",
            Self::Warn => "warn",
        }
    }
}

/// Metrics captured during one observation window. The shape depends on the phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseMetrics {
    FalsePositive {
        matched_events: usize,
        false_positive_candidates: usize,
        false_positive_rate_pct: f64,
    },
    ErrorRate {
        in_scope_requests: usize,
        errored_requests: usize,
        error_rate_pct: f64,
    },
    NotCollected,
}

impl PhaseMetrics {
    /// The headline percentage the phase decision was taken on.
    pub fn rate_pct(&self) -> Option<f64> {
        match self {
            Self::FalsePositive { false_positive_rate_pct, .. } => Some(*false_positive_rate_pct),
            Self::ErrorRate { error_rate_pct, .. } => Some(*error_rate_pct),
            Self::NotCollected => None,
        }
    }
}

/// Durable checkpoint for the phase currently in flight.
///
/// Persisted before every suspension so a restarted process neither redeploys a
/// live variant nor restarts an observation window from zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePhase {
    pub phase: RolloutPhase,
    pub started_at: DateTime<Utc>,
    pub variant_key: String,
    pub variant_id: Option<VariantId>,
    pub window_started_at: Option<DateTime<Utc>>,
    pub window_ends_at: Option<DateTime<Utc>>,
}

/// Append-only record of a finished phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: RolloutPhase,
    pub deployed_variant_id: Option<VariantId>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub metrics: PhaseMetrics,
    pub decision: PhaseDecision,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RolloutFailure {
    pub phase: RolloutPhase,
    pub reason: String,
    pub error_class: String,
    pub last_metrics: Option<PhaseMetrics>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RolloutExecution {
    pub id: ExecutionId,
    pub rule_id: RuleId,
    pub candidate: RuleCandidate,
    pub canary_duration_minutes: u32,
    pub status: RolloutStatus,
    pub active_phase: Option<ActivePhase>,
    pub phase_history: Vec<PhaseResult>,
    pub failure: Option<RolloutFailure>,
    pub correlation_id: String,
    pub state_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RolloutExecution {
    pub fn new(
        candidate: RuleCandidate,
        canary_duration_minutes: u32,
        correlation_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExecutionId::generate(),
            rule_id: candidate.rule_id.clone(),
            candidate,
            canary_duration_minutes,
            status: RolloutStatus::Pending,
            active_phase: None,
            phase_history: Vec::new(),
            failure: None,
            correlation_id: correlation_id.into(),
            state_version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn current_phase(&self) -> Option<RolloutPhase> {
        self.active_phase.as_ref().map(|active| active.phase).or_else(|| self.status.phase())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn last_metrics(&self) -> Option<&PhaseMetrics> {
        self.phase_history.last().map(|result| &result.metrics)
    }

    pub fn result_for(&self, phase: RolloutPhase) -> Option<&PhaseResult> {
        self.phase_history.iter().find(|result| result.phase == phase)
    }

    /// Whether the history is a prefix of simulation, canary, production.
    pub fn history_is_ordered(&self) -> bool {
        const ORDER: [RolloutPhase; 3] =
            [RolloutPhase::Simulation, RolloutPhase::Canary, RolloutPhase::Production];
        self.phase_history.len() <= ORDER.len()
            && self.phase_history.iter().zip(ORDER.iter()).all(|(result, phase)| result.phase == *phase)
    }
}
