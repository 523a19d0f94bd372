pub mod classifier;
pub mod metrics;
pub mod risk;
pub mod simulator;

pub use classifier::{
    Anomaly, AnomalyClassifier, AnomalyKind, AnomalyReport, ClassifierThresholds, Severity,
};
pub use metrics::{EvaluatorConfig, MetricsEvaluator};
pub use risk::{RiskAssessment, RiskAssessor, RiskTier};
pub use simulator::{RuleSimulator, SimulationReport};

/// Percentages are reported with two decimals.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
