//! Decision metrics over the raw events captured while a rule variant was live.

use serde::{Deserialize, Serialize};

use crate::analysis::round2;
use crate::domain::rollout::PhaseMetrics;
use crate::domain::traffic::RawEvent;

/// Substrings that mark a matched request as a genuine attack.
pub const KNOWN_ATTACK_MARKERS: &[&str] = &[
    "..",
    "%2e%2e",
    "union select",
    "drop table",
    "' or '1'='1",
    "<script",
    "javascript:",
    "onerror=",
    "/etc/passwd",
    "wp-admin",
    "wp-login",
    "phpmyadmin",
    "/.env",
    "/.git",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Status codes at or above this value count as elevated errors.
    pub error_status_floor: u16,
    pub attack_markers: Vec<String>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            error_status_floor: 500,
            attack_markers: KNOWN_ATTACK_MARKERS.iter().map(|marker| marker.to_string()).collect(),
        }
    }
}

/// Pure, deterministic metric computation. No I/O.
#[derive(Clone, Debug, Default)]
pub struct MetricsEvaluator {
    config: EvaluatorConfig,
}

impl MetricsEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    fn looks_malicious(&self, event: &RawEvent) -> bool {
        let url = event.full_url_lower();
        self.config.attack_markers.iter().any(|marker| url.contains(marker.as_str()))
    }

    /// Percentage of matched events that carry no known attack marker.
    /// Returns 0 when nothing matched.
    pub fn false_positive_rate(&self, events: &[RawEvent]) -> f64 {
        match self.false_positive_metrics(events) {
            PhaseMetrics::FalsePositive { false_positive_rate_pct, .. } => false_positive_rate_pct,
            _ => 0.0,
        }
    }

    /// Percentage of rule-affected requests that answered with an elevated error status.
    /// Returns 0 when no request was affected.
    pub fn error_rate(&self, events: &[RawEvent]) -> f64 {
        match self.error_rate_metrics(events) {
            PhaseMetrics::ErrorRate { error_rate_pct, .. } => error_rate_pct,
            _ => 0.0,
        }
    }

    pub fn false_positive_metrics(&self, events: &[RawEvent]) -> PhaseMetrics {
        let (matched, candidates) = events
            .iter()
            .filter(|event| event.matched)
            .fold((0usize, 0usize), |(matched, candidates), event| {
                (matched + 1, candidates + usize::from(!self.looks_malicious(event)))
            });

        PhaseMetrics::FalsePositive {
            matched_events: matched,
            false_positive_candidates: candidates,
            false_positive_rate_pct: rate(candidates, matched),
        }
    }

    pub fn error_rate_metrics(&self, events: &[RawEvent]) -> PhaseMetrics {
        let (in_scope, errored) = events
            .iter()
            .filter(|event| event.matched)
            .fold((0usize, 0usize), |(in_scope, errored), event| {
                let elevated = event.status_code >= self.config.error_status_floor;
                (in_scope + 1, errored + usize::from(elevated))
            });

        PhaseMetrics::ErrorRate {
            in_scope_requests: in_scope,
            errored_requests: errored,
            error_rate_pct: rate(errored, in_scope),
        }
    }
}

fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round2(part as f64 / whole as f64 * 100.0)
}
