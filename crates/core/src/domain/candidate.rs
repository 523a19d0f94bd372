use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub String);

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Log,
    Challenge,
    JsChallenge,
    ManagedChallenge,
    Block,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Challenge => "challenge",
            Self::JsChallenge => "js_challenge",
            Self::ManagedChallenge => "managed_challenge",
            Self::Block => "block",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "log" => Some(Self::Log),
            "challenge" => Some(Self::Challenge),
            "js_challenge" => Some(Self::JsChallenge),
            "managed_challenge" => Some(Self::ManagedChallenge),
            "block" => Some(Self::Block),
            _ => None,
        }
    }

    pub fn is_challenge(&self) -> bool {
        matches!(self, Self::Challenge | Self::JsChallenge | Self::ManagedChallenge)
    }

    /// The action exposed to canary traffic: `block` is softened to `challenge`.
    pub fn canary_action(&self) -> Self {
        match self {
            Self::Block => Self::Challenge,
            other => *other,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum RuleScope {
    Zone,
    Hostname(String),
    Path(String),
}

impl RuleScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zone => "zone",
            Self::Hostname(_) => "hostname",
            Self::Path(_) => "path",
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Zone => None,
            Self::Hostname(host) => Some(host.as_str()),
            Self::Path(path) => Some(path.as_str()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimit {
    pub threshold: u32,
    pub period_secs: u32,
    pub mitigation_timeout_secs: u32,
}

/// Immutable description of a filtering rule under evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCandidate {
    pub rule_id: RuleId,
    #[serde(default)]
    pub description: String,
    pub expression: String,
    pub action: RuleAction,
    pub scope: RuleScope,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("rule id must not be empty")]
    EmptyRuleId,
    #[error("rule expression must not be empty")]
    EmptyExpression,
    #[error("rule expression is malformed: {0}")]
    MalformedExpression(String),
    #[error("rule scope is invalid: {0}")]
    InvalidScope(String),
    #[error("rate limit `{field}` must be greater than zero")]
    InvalidRateLimit { field: &'static str },
    #[error("{field} must be in range {min}..={max} minutes, got {value}")]
    DurationOutOfRange { field: &'static str, value: i64, min: u32, max: u32 },
}

impl RuleCandidate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.rule_id.0.trim().is_empty() {
            return Err(ValidationError::EmptyRuleId);
        }
        if self.expression.trim().is_empty() {
            return Err(ValidationError::EmptyExpression);
        }
        check_expression_balance(&self.expression)?;

        match &self.scope {
            RuleScope::Zone => {}
            RuleScope::Hostname(host) => {
                if host.trim().is_empty() || host.contains('/') {
                    return Err(ValidationError::InvalidScope(format!(
                        "hostname scope `{host}` must be a bare host name"
                    )));
                }
            }
            RuleScope::Path(path) => {
                if !path.starts_with('/') {
                    return Err(ValidationError::InvalidScope(format!(
                        "path scope `{path}` must start with `/`"
                    )));
                }
            }
        }

        if let Some(rate_limit) = &self.rate_limit {
            if rate_limit.threshold == 0 {
                return Err(ValidationError::InvalidRateLimit { field: "threshold" });
            }
            if rate_limit.period_secs == 0 {
                return Err(ValidationError::InvalidRateLimit { field: "period_secs" });
            }
            if rate_limit.mitigation_timeout_secs == 0 {
                return Err(ValidationError::InvalidRateLimit {
                    field: "mitigation_timeout_secs",
                });
            }
        }

        Ok(())
    }

    /// Same rule with a different enforcement action; scope and expression unchanged.
    pub fn with_action(&self, action: RuleAction) -> Self {
        Self { action, ..self.clone() }
    }

    /// SHA-256 over the canonical JSON encoding of the candidate.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{}|{}|{}", self.rule_id, self.expression, self.action.as_str())
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

fn check_expression_balance(expression: &str) -> Result<(), ValidationError> {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for ch in expression.chars() {
        if in_string {
            match ch {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(ValidationError::MalformedExpression(
                        "unexpected closing parenthesis".to_string(),
                    ));
                }
            }
            _ => {}
        }
    }

    if in_string {
        return Err(ValidationError::MalformedExpression("unterminated string literal".to_string()));
    }
    if depth != 0 {
        return Err(ValidationError::MalformedExpression("unbalanced parentheses".to_string()));
    }
    Ok(())
}
