use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One edge request as exported by the traffic log pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "clientIP", alias = "clientIp")]
    pub client_ip: String,
    pub path: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub asn: Option<u32>,
}

impl LogRecord {
    /// Lowercased `path?query` used by substring heuristics.
    pub fn full_url_lower(&self) -> String {
        full_url_lower(&self.path, self.query.as_deref())
    }
}

/// A request observed while a rule variant was live, as reported by the deployer.
/// Uses the same wire names as [`LogRecord`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub occurred_at: DateTime<Utc>,
    #[serde(rename = "clientIP", alias = "clientIp")]
    pub client_ip: String,
    pub path: String,
    #[serde(default)]
    pub query: Option<String>,
    pub status_code: u16,
    #[serde(default)]
    pub user_agent: String,
    /// Whether the rule variant's expression matched this request.
    pub matched: bool,
}

impl RawEvent {
    pub fn full_url_lower(&self) -> String {
        full_url_lower(&self.path, self.query.as_deref())
    }
}

fn full_url_lower(path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) if !query.is_empty() => format!("{path}?{query}").to_ascii_lowercase(),
        _ => path.to_ascii_lowercase(),
    }
}

fn default_method() -> String {
    "GET".to_string()
}
