pub mod analysis;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod rollout;

pub use analysis::{
    Anomaly, AnomalyClassifier, AnomalyKind, AnomalyReport, ClassifierThresholds,
    EvaluatorConfig, MetricsEvaluator, RiskAssessment, RiskAssessor, RiskTier, RuleSimulator,
    SimulationReport, Severity,
};
pub use audit::{AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use config::{AppConfig, ConfigError, LoadOptions};
pub use domain::candidate::{RateLimit, RuleAction, RuleCandidate, RuleId, RuleScope, ValidationError};
pub use domain::rollout::{
    ExecutionId, PhaseDecision, PhaseMetrics, PhaseResult, RolloutExecution, RolloutPhase,
    RolloutStatus, VariantId,
};
pub use domain::traffic::{LogRecord, RawEvent};
pub use errors::RolloutError;
pub use rollout::{
    InMemoryRolloutStore, InMemoryRuleDeployer, ManualClock, RolloutClock, RolloutOrchestrator,
    RolloutServices, RuleDeployer, RuleProposalStore, SystemClock,
};
