//! Traffic anomaly classification.
//!
//! Scans a batch of edge log records for attack signatures (path traversal,
//! SQL injection, cross-site scripting), flags bot-like clients, and derives
//! volumetric signals (DDoS, API abuse) from per-client and per-path frequency
//! tables. The classifier is a pure function of its input batch: identical
//! batches always serialize to identical reports.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::analysis::round2;
use crate::domain::candidate::RateLimit;
use crate::domain::traffic::LogRecord;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Thresholds for the aggregate detectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierThresholds {
    /// A client is a DDoS suspect above this multiple of the mean per-client count.
    pub ddos_multiplier: f64,
    /// Share of batch volume a single API path may take before it is flagged.
    pub api_abuse_share: f64,
    /// Path prefixes that identify the API namespace.
    pub api_prefixes: Vec<String>,
    /// Bot share above which bot traffic is reported as MEDIUM.
    pub bot_share: f64,
    /// Share of 4xx/5xx responses above which the batch is flagged.
    pub error_share: f64,
    /// User agents shorter than this are treated as bots.
    pub min_user_agent_len: usize,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            ddos_multiplier: 5.0,
            api_abuse_share: 0.30,
            api_prefixes: vec!["/api/".to_string(), "/graphql".to_string()],
            bot_share: 0.30,
            error_share: 0.20,
            min_user_agent_len: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    PathTraversal,
    SqlInjection,
    Xss,
    BotTraffic,
    Ddos,
    ApiAbuse,
    HighErrorRate,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PathTraversal => "path_traversal",
            Self::SqlInjection => "sql_injection",
            Self::Xss => "xss",
            Self::BotTraffic => "bot_traffic",
            Self::Ddos => "ddos",
            Self::ApiAbuse => "api_abuse",
            Self::HighErrorRate => "high_error_rate",
        }
    }

    /// Attack signatures count toward aggregate severity; volumetric signals do not.
    pub fn is_attack_signature(&self) -> bool {
        matches!(self, Self::PathTraversal | Self::SqlInjection | Self::Xss)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub count: usize,
    pub percentage: f64,
    pub severity: Severity,
    pub description: String,
    pub affected_paths: BTreeSet<String>,
    pub affected_ips: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCount {
    pub client_ip: String,
    pub requests: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Block,
    RateLimit,
    Challenge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub anomaly: AnomalyKind,
    pub action: RecommendedAction,
    pub priority: Severity,
    pub description: String,
    pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    /// Timestamp of the newest record in the batch.
    pub analyzed_at: Option<DateTime<Utc>>,
    pub record_count: usize,
    pub time_window: Option<TimeWindow>,
    pub anomalies: Vec<Anomaly>,
    pub aggregate_severity: Severity,
    pub confidence_percent: u8,
    pub suspicious_ips: BTreeSet<String>,
    pub suspicious_paths: BTreeSet<String>,
    pub top_clients: Vec<ClientCount>,
    pub recommendations: Vec<Recommendation>,
}

impl AnomalyReport {
    pub fn anomaly(&self, kind: AnomalyKind) -> Option<&Anomaly> {
        self.anomalies.iter().find(|anomaly| anomaly.kind == kind)
    }
}

// ---------------------------------------------------------------------------
// Detectors
// ---------------------------------------------------------------------------

struct AttackPatterns {
    path_traversal: Regex,
    sql_injection: Regex,
    xss: Regex,
}

const BOT_TOKENS: &[&str] =
    &["bot", "crawler", "spider", "scraper", "curl", "wget", "python-requests", "go-http-client"];

fn attack_patterns() -> &'static AttackPatterns {
    static PATTERNS: OnceLock<AttackPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| AttackPatterns {
        path_traversal: Regex::new(r"(?i)\.\.[/\\]|\.\.%2f|\.\.%5c|%2e%2e")
            .expect("path traversal pattern compiles"),
        sql_injection: Regex::new(
            r#"(?i)\b(union|select|insert|drop|delete|update)\b.+\b(from|where|table)\b|['"]\s*(or|and)\s*['"]\s*=\s*['"]|(?:'\s*|\d\s+)(or|and)\s+[\d']+\s*=\s*[\d']+"#,
        )
        .expect("sql injection pattern compiles"),
        xss: Regex::new(r"(?i)<script|%3cscript|javascript:|onerror\s*=|onload\s*=")
            .expect("xss pattern compiles"),
    })
}

fn matches_any(pattern: &Regex, record: &LogRecord) -> bool {
    pattern.is_match(&record.path) || record.query.as_deref().is_some_and(|q| pattern.is_match(q))
}

#[derive(Default)]
struct Hits {
    count: usize,
    paths: BTreeSet<String>,
    ips: BTreeSet<String>,
}

impl Hits {
    fn record(&mut self, record: &LogRecord) {
        self.count += 1;
        self.paths.insert(record.path.clone());
        self.ips.insert(record.client_ip.clone());
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Stateless anomaly classifier. Thresholds are fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct AnomalyClassifier {
    thresholds: ClassifierThresholds,
}

impl AnomalyClassifier {
    pub fn new(thresholds: ClassifierThresholds) -> Self {
        Self { thresholds }
    }

    pub fn is_bot(&self, user_agent: &str) -> bool {
        let lowered = user_agent.to_ascii_lowercase();
        user_agent.len() < self.thresholds.min_user_agent_len
            || BOT_TOKENS.iter().any(|token| lowered.contains(token))
    }

    fn is_api_path(&self, path: &str) -> bool {
        self.thresholds.api_prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn classify(&self, batch: &[LogRecord]) -> AnomalyReport {
        let patterns = attack_patterns();
        let total = batch.len();

        let mut traversal = Hits::default();
        let mut sqli = Hits::default();
        let mut xss = Hits::default();
        let mut bots = Hits::default();
        let mut errors = Hits::default();
        let mut client_counts: BTreeMap<&str, usize> = BTreeMap::new();
        let mut path_counts: BTreeMap<&str, usize> = BTreeMap::new();
        let mut window: Option<(DateTime<Utc>, DateTime<Utc>)> = None;

        for record in batch {
            *client_counts.entry(record.client_ip.as_str()).or_default() += 1;
            *path_counts.entry(record.path.as_str()).or_default() += 1;

            window = Some(match window {
                Some((start, end)) => (start.min(record.timestamp), end.max(record.timestamp)),
                None => (record.timestamp, record.timestamp),
            });

            if matches_any(&patterns.path_traversal, record) {
                traversal.record(record);
            }
            if matches_any(&patterns.sql_injection, record) {
                sqli.record(record);
            }
            if matches_any(&patterns.xss, record) {
                xss.record(record);
            }
            if self.is_bot(&record.user_agent) {
                bots.record(record);
            }
            if record.status_code >= 400 {
                errors.record(record);
            }
        }

        let mut anomalies = Vec::new();
        let mut suspicious_ips = BTreeSet::new();
        let mut suspicious_paths = BTreeSet::new();

        let signatures = [
            (AnomalyKind::PathTraversal, traversal, Severity::High),
            (AnomalyKind::SqlInjection, sqli, Severity::Critical),
            (AnomalyKind::Xss, xss, Severity::High),
        ];
        let mut attack_matches = 0usize;
        for (kind, hits, severity) in signatures {
            if hits.count == 0 {
                continue;
            }
            attack_matches += hits.count;
            suspicious_ips.extend(hits.ips.iter().cloned());
            suspicious_paths.extend(hits.paths.iter().cloned());
            anomalies.push(Anomaly {
                kind,
                count: hits.count,
                percentage: percentage(hits.count, total),
                severity,
                description: format!(
                    "Detected {} {} attempts",
                    hits.count,
                    kind.as_str().replace('_', " ")
                ),
                affected_paths: hits.paths,
                affected_ips: hits.ips,
            });
        }

        if bots.count > 0 {
            let share = bots.count as f64 / total as f64;
            let severity =
                if share > self.thresholds.bot_share { Severity::Medium } else { Severity::Low };
            anomalies.push(Anomaly {
                kind: AnomalyKind::BotTraffic,
                count: bots.count,
                percentage: percentage(bots.count, total),
                severity,
                description: format!(
                    "Bot-like traffic: {}% of requests",
                    percentage(bots.count, total)
                ),
                affected_paths: BTreeSet::new(),
                affected_ips: bots.ips,
            });
        }

        if !client_counts.is_empty() {
            let mean = total as f64 / client_counts.len() as f64;
            let ddos: BTreeSet<String> = client_counts
                .iter()
                .filter(|(_, count)| **count as f64 > mean * self.thresholds.ddos_multiplier)
                .map(|(ip, _)| (*ip).to_string())
                .collect();
            if !ddos.is_empty() {
                suspicious_ips.extend(ddos.iter().cloned());
                anomalies.push(Anomaly {
                    kind: AnomalyKind::Ddos,
                    count: ddos.len(),
                    percentage: percentage(ddos.len(), client_counts.len()),
                    severity: Severity::Critical,
                    description: format!(
                        "Potential DDoS: {} clients above {}x the mean request rate",
                        ddos.len(),
                        self.thresholds.ddos_multiplier
                    ),
                    affected_paths: BTreeSet::new(),
                    affected_ips: ddos,
                });
            }
        }

        let abused: Vec<(&str, usize)> = path_counts
            .iter()
            .filter(|(path, count)| {
                **count as f64 > total as f64 * self.thresholds.api_abuse_share
                    && self.is_api_path(path)
            })
            .map(|(path, count)| (*path, *count))
            .collect();
        if !abused.is_empty() {
            let requests: usize = abused.iter().map(|(_, count)| count).sum();
            let paths: BTreeSet<String> =
                abused.iter().map(|(path, _)| (*path).to_string()).collect();
            suspicious_paths.extend(paths.iter().cloned());
            anomalies.push(Anomaly {
                kind: AnomalyKind::ApiAbuse,
                count: requests,
                percentage: percentage(requests, total),
                severity: Severity::High,
                description: format!(
                    "API abuse: {} path(s) receiving more than {}% of traffic",
                    paths.len(),
                    round2(self.thresholds.api_abuse_share * 100.0)
                ),
                affected_paths: paths,
                affected_ips: BTreeSet::new(),
            });
        }

        if total > 0 && errors.count as f64 / total as f64 > self.thresholds.error_share {
            anomalies.push(Anomaly {
                kind: AnomalyKind::HighErrorRate,
                count: errors.count,
                percentage: percentage(errors.count, total),
                severity: Severity::Medium,
                description: format!(
                    "High error rate: {}% of requests returning 4xx/5xx",
                    percentage(errors.count, total)
                ),
                affected_paths: errors.paths,
                affected_ips: BTreeSet::new(),
            });
        }

        let match_ratio = if total == 0 { 0.0 } else { attack_matches as f64 / total as f64 };
        let aggregate_severity = if match_ratio > 0.10 {
            Severity::High
        } else if match_ratio > 0.05 {
            Severity::Medium
        } else {
            Severity::Low
        };
        // Capped so that no batch claims certainty.
        let confidence_percent = (match_ratio * 1000.0).round().min(95.0) as u8;

        let mut top_clients: Vec<ClientCount> = client_counts
            .iter()
            .map(|(ip, count)| ClientCount { client_ip: (*ip).to_string(), requests: *count })
            .collect();
        top_clients.sort_by(|a, b| b.requests.cmp(&a.requests).then(a.client_ip.cmp(&b.client_ip)));
        top_clients.truncate(10);

        let recommendations = anomalies.iter().filter_map(recommend).collect();

        AnomalyReport {
            analyzed_at: window.map(|(_, end)| end),
            record_count: total,
            time_window: window.map(|(start, end)| TimeWindow {
                start,
                end,
                duration_seconds: (end - start).num_seconds(),
            }),
            anomalies,
            aggregate_severity,
            confidence_percent,
            suspicious_ips,
            suspicious_paths,
            top_clients,
            recommendations,
        }
    }
}

fn percentage(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(count as f64 / total as f64 * 100.0)
}

fn recommend(anomaly: &Anomaly) -> Option<Recommendation> {
    let (action, priority, description, rate_limit) = match anomaly.kind {
        AnomalyKind::PathTraversal | AnomalyKind::SqlInjection | AnomalyKind::Xss => (
            RecommendedAction::Block,
            Severity::High,
            format!("Block {} patterns immediately", anomaly.kind.as_str().replace('_', " ")),
            None,
        ),
        AnomalyKind::Ddos => (
            RecommendedAction::RateLimit,
            Severity::Critical,
            "Apply aggressive rate limiting per client IP".to_string(),
            Some(RateLimit { threshold: 100, period_secs: 10, mitigation_timeout_secs: 600 }),
        ),
        AnomalyKind::ApiAbuse => (
            RecommendedAction::Challenge,
            Severity::High,
            "Challenge clients hammering the API namespace".to_string(),
            None,
        ),
        AnomalyKind::BotTraffic if anomaly.severity >= Severity::Medium => (
            RecommendedAction::Challenge,
            Severity::Medium,
            "Enable bot management or add a JavaScript challenge".to_string(),
            None,
        ),
        AnomalyKind::BotTraffic | AnomalyKind::HighErrorRate => return None,
    };

    Some(Recommendation { anomaly: anomaly.kind, action, priority, description, rate_limit })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::{AnomalyClassifier, AnomalyKind, RecommendedAction, Severity};
    use crate::domain::traffic::LogRecord;

    const BROWSER_UA: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/124.0.0.0";

    fn base_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z").expect("valid ts").with_timezone(&Utc)
    }

    fn record(index: usize, ip: &str, path: &str, user_agent: &str, status: u16) -> LogRecord {
        LogRecord {
            timestamp: base_time() + Duration::seconds(index as i64),
            client_ip: ip.to_string(),
            path: path.to_string(),
            query: None,
            method: "GET".to_string(),
            status_code: status,
            user_agent: user_agent.to_string(),
            country: Some("NL".to_string()),
            asn: Some(64500),
        }
    }

    fn sqli_batch() -> Vec<LogRecord> {
        (0..100)
            .map(|i| {
                let ip = format!("198.51.100.{}", i % 50);
                if i < 20 {
                    record(i, &ip, "/api/users?id=1' OR '1'='1", BROWSER_UA, 200)
                } else {
                    record(i, &ip, &format!("/products/{i}"), BROWSER_UA, 200)
                }
            })
            .collect()
    }

    #[test]
    fn sql_injection_share_above_ten_percent_is_high_severity() {
        let report = AnomalyClassifier::default().classify(&sqli_batch());

        let sqli = report.anomaly(AnomalyKind::SqlInjection).expect("sql injection reported");
        assert_eq!(sqli.count, 20);
        assert_eq!(sqli.severity, Severity::Critical);
        assert_eq!(report.aggregate_severity, Severity::High);
        assert_eq!(report.confidence_percent, 95);
        assert!(report.suspicious_paths.contains("/api/users?id=1' OR '1'='1"));
        assert_eq!(report.record_count, 100);
        assert!(report
            .recommendations
            .iter()
            .any(|rec| rec.anomaly == AnomalyKind::SqlInjection
                && rec.action == RecommendedAction::Block));
    }

    #[test]
    fn classification_is_deterministic() {
        let classifier = AnomalyClassifier::default();
        let batch = sqli_batch();

        let first = serde_json::to_string(&classifier.classify(&batch)).expect("serialize");
        let second = serde_json::to_string(&classifier.classify(&batch)).expect("serialize");

        assert_eq!(first, second);
    }

    #[test]
    fn severity_bands_follow_match_ratio() {
        let classifier = AnomalyClassifier::default();
        let batch_with = |hits: usize| -> Vec<LogRecord> {
            (0..100)
                .map(|i| {
                    let ip = format!("192.0.2.{}", i % 25);
                    if i < hits {
                        record(i, &ip, "/static/../../etc/passwd", BROWSER_UA, 404)
                    } else {
                        record(i, &ip, "/index.html", BROWSER_UA, 200)
                    }
                })
                .collect()
        };

        let medium = classifier.classify(&batch_with(7));
        assert_eq!(medium.aggregate_severity, Severity::Medium);
        assert_eq!(medium.confidence_percent, 70);

        let low = classifier.classify(&batch_with(5));
        assert_eq!(low.aggregate_severity, Severity::Low);
        assert_eq!(low.confidence_percent, 50);
        assert_eq!(
            low.anomaly(AnomalyKind::PathTraversal).map(|anomaly| anomaly.count),
            Some(5)
        );
    }

    #[test]
    fn xss_and_encoded_traversal_are_detected_in_query() {
        let mut xss = record(0, "203.0.113.1", "/search", BROWSER_UA, 200);
        xss.query = Some("q=<script>alert(1)</script>".to_string());
        let mut encoded = record(1, "203.0.113.2", "/files", BROWSER_UA, 200);
        encoded.query = Some("name=%2e%2e%2fsecrets".to_string());

        let report = AnomalyClassifier::default().classify(&[xss, encoded]);

        assert_eq!(report.anomaly(AnomalyKind::Xss).map(|a| a.count), Some(1));
        assert_eq!(report.anomaly(AnomalyKind::PathTraversal).map(|a| a.count), Some(1));
    }

    #[test]
    fn flooding_client_is_reported_as_ddos() {
        let mut batch: Vec<LogRecord> = (0..20)
            .map(|i| record(i, &format!("198.51.100.{i}"), "/index.html", BROWSER_UA, 200))
            .collect();
        batch.extend((20..120).map(|i| record(i, "203.0.113.66", "/index.html", BROWSER_UA, 200)));

        let report = AnomalyClassifier::default().classify(&batch);

        let ddos = report.anomaly(AnomalyKind::Ddos).expect("ddos reported");
        assert_eq!(ddos.count, 1);
        assert!(ddos.affected_ips.contains("203.0.113.66"));
        assert!(report.suspicious_ips.contains("203.0.113.66"));
        assert_eq!(report.top_clients[0].client_ip, "203.0.113.66");
        assert_eq!(report.top_clients[0].requests, 100);
    }

    #[test]
    fn dominant_api_path_is_reported_as_abuse_but_static_path_is_not() {
        let api_batch: Vec<LogRecord> = (0..10)
            .map(|i| {
                let path = if i < 4 { "/api/login" } else { "/home" };
                record(i, &format!("192.0.2.{i}"), path, BROWSER_UA, 200)
            })
            .collect();
        let report = AnomalyClassifier::default().classify(&api_batch);
        let abuse = report.anomaly(AnomalyKind::ApiAbuse).expect("api abuse reported");
        assert_eq!(abuse.count, 4);
        assert!(abuse.affected_paths.contains("/api/login"));

        let static_batch: Vec<LogRecord> = (0..10)
            .map(|i| {
                let path = if i < 4 { "/assets/app.js" } else { "/home" };
                record(i, &format!("192.0.2.{i}"), path, BROWSER_UA, 200)
            })
            .collect();
        let report = AnomalyClassifier::default().classify(&static_batch);
        assert!(report.anomaly(AnomalyKind::ApiAbuse).is_none());
    }

    #[test]
    fn bots_are_reported_without_raising_severity() {
        let batch: Vec<LogRecord> = (0..10)
            .map(|i| {
                let ua = if i < 4 { "Googlebot/2.1" } else { BROWSER_UA };
                record(i, &format!("192.0.2.{i}"), "/index.html", ua, 200)
            })
            .collect();

        let report = AnomalyClassifier::default().classify(&batch);

        let bots = report.anomaly(AnomalyKind::BotTraffic).expect("bots reported");
        assert_eq!(bots.count, 4);
        assert_eq!(bots.severity, Severity::Medium);
        assert_eq!(report.aggregate_severity, Severity::Low);
        assert!(AnomalyClassifier::default().is_bot("curl/8"));
    }

    #[test]
    fn empty_batch_yields_quiet_report() {
        let report = AnomalyClassifier::default().classify(&[]);

        assert_eq!(report.record_count, 0);
        assert!(report.anomalies.is_empty());
        assert_eq!(report.aggregate_severity, Severity::Low);
        assert_eq!(report.confidence_percent, 0);
        assert!(report.analyzed_at.is_none());
    }
}
