use serde::{Deserialize, Serialize};

use crate::domain::candidate::{RuleAction, RuleCandidate, RuleScope};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }

    fn raise(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium | Self::High => Self::High,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub tier: RiskTier,
    pub contributing_factors: Vec<String>,
    pub expected_false_positive_risk: RiskTier,
}

/// Fields whose presence makes an expression target broad populations.
const BROAD_FIELDS: &[&str] = &["ip.geoip.country", "ip.geoip.continent", "ip.geoip.asnum"];
/// Fields scored by the provider; reliable but probabilistic.
const SCORED_FIELDS: &[&str] = &["cf.threat_score", "cf.bot_management.score", "cf.client.bot"];
/// Literal attack signatures; matches are almost always malicious.
const SIGNATURE_LITERALS: &[&str] =
    &["..", "%2e%2e", "union select", "drop table", "<script", "javascript:", "/etc/passwd"];

/// Scores a candidate's blast radius and false-positive exposure. Stateless.
#[derive(Clone, Debug, Default)]
pub struct RiskAssessor;

impl RiskAssessor {
    pub fn assess(&self, candidate: &RuleCandidate) -> RiskAssessment {
        let mut factors = Vec::new();

        let mut tier = match (candidate.action, &candidate.scope) {
            (RuleAction::Log, _) => {
                factors.push("log action does not affect traffic".to_string());
                RiskTier::Low
            }
            (RuleAction::Block, RuleScope::Zone) => {
                factors.push("block action applies to the whole zone".to_string());
                RiskTier::High
            }
            (RuleAction::Block, RuleScope::Hostname(host)) => {
                factors.push(format!("block action applies to every path on `{host}`"));
                RiskTier::High
            }
            (RuleAction::Block, RuleScope::Path(path)) => {
                factors.push(format!("block action limited to path `{path}`"));
                RiskTier::Medium
            }
            (action, RuleScope::Zone) => {
                factors.push(format!("{} action applies to the whole zone", action.as_str()));
                RiskTier::Medium
            }
            (action, scope) => {
                factors.push(format!(
                    "{} action limited to {} scope",
                    action.as_str(),
                    scope.as_str()
                ));
                RiskTier::Low
            }
        };

        if let Some(rate_limit) = &candidate.rate_limit {
            if rate_limit.threshold < 10 {
                factors.push(format!(
                    "rate limit threshold of {} requests per {}s is aggressive",
                    rate_limit.threshold, rate_limit.period_secs
                ));
                tier = tier.raise();
            }
            if rate_limit.mitigation_timeout_secs >= 3600 {
                factors.push(format!(
                    "mitigation lasts {}s once triggered",
                    rate_limit.mitigation_timeout_secs
                ));
            }
        }

        let expression = candidate.expression.to_ascii_lowercase();
        let mut false_positive_risk = if BROAD_FIELDS.iter().any(|field| expression.contains(field)) {
            factors.push("expression matches on geography or network ownership".to_string());
            RiskTier::High
        } else if SIGNATURE_LITERALS.iter().any(|literal| expression.contains(literal)) {
            factors.push("expression matches literal attack signatures".to_string());
            RiskTier::Low
        } else if SCORED_FIELDS.iter().any(|field| expression.contains(field)) {
            factors.push("expression relies on provider threat or bot scores".to_string());
            RiskTier::Medium
        } else {
            factors.push("expression has no recognised attack signature".to_string());
            RiskTier::Medium
        };

        if expression.contains(" or ") || expression.contains("||") {
            factors.push("disjunctive expression widens the match set".to_string());
            false_positive_risk = false_positive_risk.raise();
        }

        if false_positive_risk == RiskTier::High && candidate.action != RuleAction::Log {
            tier = tier.raise();
        }

        RiskAssessment {
            tier,
            contributing_factors: factors,
            expected_false_positive_risk: false_positive_risk,
        }
    }
}
