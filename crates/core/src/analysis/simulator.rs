//! Offline what-if evaluation of a rule candidate against historical traffic.
//!
//! Expression matching here is heuristic: it recognises the expression shapes
//! the rule generator emits (attack substrings, threat/bot score comparisons,
//! country filters) and scores requests with mock threat and bot scores. It is
//! a pre-flight estimate, not a replacement for the provider's shadow phase.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::analysis::round2;
use crate::domain::candidate::{RuleAction, RuleCandidate};
use crate::domain::traffic::LogRecord;

/// Estimated false-positive rate above which the report recommends refinement.
pub const REPORT_WARNING_FP_PCT: f64 = 10.0;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedRequest {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub path: String,
    pub method: String,
    pub status_code: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub rule_id: String,
    pub expression: String,
    pub action: RuleAction,
    pub description: String,
    pub total_requests: usize,
    pub matched: usize,
    pub would_block: usize,
    pub would_challenge: usize,
    pub would_log: usize,
    pub match_rate_pct: f64,
    pub false_positive_rate_estimate_pct: f64,
    pub matched_requests: Vec<MatchedRequest>,
    pub false_positive_candidates: Vec<LogRecord>,
}

impl SimulationReport {
    pub fn exceeds_false_positive_warning(&self) -> bool {
        self.false_positive_rate_estimate_pct > REPORT_WARNING_FP_PCT
    }

    /// Plain-text rendering for operators.
    pub fn render_report(&self) -> String {
        let rule = "=".repeat(80);
        let sub = "-".repeat(80);
        let mut lines = vec![
            rule.clone(),
            "RULE SIMULATION REPORT".to_string(),
            rule.clone(),
            String::new(),
            "RULE DETAILS".to_string(),
            sub.clone(),
            format!("Rule: {}", self.rule_id),
            format!("Expression: {}", self.expression),
            format!("Action: {}", self.action.as_str()),
            format!("Description: {}", self.description),
            String::new(),
            "SIMULATION RESULTS".to_string(),
            sub.clone(),
            format!("Total Requests Analyzed: {}", self.total_requests),
            format!("Matched Requests: {} ({}%)", self.matched, self.match_rate_pct),
            format!("Would Block: {}", self.would_block),
            format!("Would Challenge: {}", self.would_challenge),
            format!("Would Log: {}", self.would_log),
            String::new(),
            "FALSE POSITIVE ANALYSIS".to_string(),
            sub,
            format!("Potential False Positives: {}", self.false_positive_candidates.len()),
            format!("Estimated FP Rate: {}%", self.false_positive_rate_estimate_pct),
            String::new(),
        ];

        if self.exceeds_false_positive_warning() {
            lines.push("WARNING: High false positive rate detected.".to_string());
            lines.push("Consider refining the rule expression before deployment.".to_string());
        } else {
            lines.push("False positive rate is acceptable.".to_string());
        }
        lines.push(String::new());
        lines.push(rule);

        lines.join("\n")
    }
}

#[derive(Clone, Debug, Default)]
pub struct RuleSimulator;

impl RuleSimulator {
    pub fn simulate(&self, candidate: &RuleCandidate, records: &[LogRecord]) -> SimulationReport {
        let mut report = SimulationReport {
            rule_id: candidate.rule_id.0.clone(),
            expression: candidate.expression.clone(),
            action: candidate.action,
            description: candidate.description.clone(),
            total_requests: records.len(),
            matched: 0,
            would_block: 0,
            would_challenge: 0,
            would_log: 0,
            match_rate_pct: 0.0,
            false_positive_rate_estimate_pct: 0.0,
            matched_requests: Vec::new(),
            false_positive_candidates: Vec::new(),
        };

        for record in records {
            if !expression_matches(&candidate.expression, record) {
                continue;
            }

            report.matched += 1;
            match candidate.action {
                RuleAction::Block => report.would_block += 1,
                action if action.is_challenge() => report.would_challenge += 1,
                _ => report.would_log += 1,
            }

            report.matched_requests.push(MatchedRequest {
                timestamp: record.timestamp,
                client_ip: record.client_ip.clone(),
                path: record.path.clone(),
                method: record.method.clone(),
                status_code: record.status_code,
            });

            if looks_legitimate(record) {
                report.false_positive_candidates.push(record.clone());
            }
        }

        if report.total_requests > 0 {
            report.match_rate_pct =
                round2(report.matched as f64 / report.total_requests as f64 * 100.0);
        }
        if report.matched > 0 {
            report.false_positive_rate_estimate_pct = round2(
                report.false_positive_candidates.len() as f64 / report.matched as f64 * 100.0,
            );
        }

        report
    }
}

// ---------------------------------------------------------------------------
// Expression heuristics
// ---------------------------------------------------------------------------

const TRAVERSAL_MARKERS: &[&str] = &["..", "%2e%2e"];
const SQLI_MARKERS: &[&str] = &["union select", "drop table", "' or '1'='1"];
const XSS_MARKERS: &[&str] = &["<script", "javascript:", "onerror="];

fn country_filter() -> &'static Regex {
    static COUNTRY: OnceLock<Regex> = OnceLock::new();
    COUNTRY.get_or_init(|| Regex::new(r#"eq "([A-Z]{2})""#).expect("static country pattern"))
}

fn browser_version() -> &'static Regex {
    static VERSION: OnceLock<Regex> = OnceLock::new();
    VERSION.get_or_init(|| Regex::new(r"\d+\.\d+").expect("static version pattern"))
}

fn expression_matches(expression: &str, record: &LogRecord) -> bool {
    let url = record.full_url_lower();
    let any_in_url = |markers: &[&str]| markers.iter().any(|marker| url.contains(marker));

    if (expression.contains(r#"contains "..""#) || expression.contains(r#"contains "%2e%2e""#))
        && any_in_url(TRAVERSAL_MARKERS)
    {
        return true;
    }

    if (expression.contains("union select") || expression.contains("drop table"))
        && any_in_url(SQLI_MARKERS)
    {
        return true;
    }

    if (expression.contains("<script") || expression.contains("javascript:"))
        && any_in_url(XSS_MARKERS)
    {
        return true;
    }

    if expression.contains("cf.threat_score")
        && expression.contains("gt 10")
        && mock_threat_score(record) > 10
    {
        return true;
    }

    if expression.contains("cf.bot_management.score")
        && expression.contains("lt 30")
        && mock_bot_score(record) < 30
    {
        return true;
    }

    if expression.contains("ip.geoip.country") {
        if let Some(target) = country_filter().captures(expression).and_then(|caps| caps.get(1)) {
            if record.country.as_deref() == Some(target.as_str()) {
                return true;
            }
        }
    }

    false
}

fn mock_threat_score(record: &LogRecord) -> u32 {
    let mut score = 0;
    let path = record.path.to_ascii_lowercase();
    if ["admin", "wp-", "phpmyadmin", ".env"].iter().any(|marker| path.contains(marker)) {
        score += 20;
    }
    if record.status_code >= 400 {
        score += 10;
    }
    let user_agent = record.user_agent.to_ascii_lowercase();
    if user_agent.contains("bot") || user_agent.contains("curl") {
        score += 15;
    }
    score
}

/// 0-100, lower is more bot-like.
fn mock_bot_score(record: &LogRecord) -> u32 {
    let user_agent = record.user_agent.to_ascii_lowercase();
    if ["bot", "crawler", "spider"].iter().any(|marker| user_agent.contains(marker)) {
        10
    } else if user_agent.contains("curl") || user_agent.contains("wget") {
        5
    } else if user_agent.len() < 20 {
        25
    } else {
        80
    }
}

fn looks_legitimate(record: &LogRecord) -> bool {
    if record.status_code == 200
        && ["/api/", "/static/", "/assets/"].iter().any(|prefix| record.path.contains(prefix))
    {
        return true;
    }

    ["Chrome/", "Firefox/", "Safari/"].iter().any(|browser| record.user_agent.contains(browser))
        && browser_version().is_match(&record.user_agent)
}
