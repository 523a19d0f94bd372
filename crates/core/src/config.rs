use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::{ClassifierThresholds, EvaluatorConfig};

#[derive(Clone, Debug, Default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub rollout: RolloutConfig,
    pub analysis: AnalysisConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Phase windows, decision thresholds and provider call policy for staged rollouts.
#[derive(Clone, Debug, PartialEq)]
pub struct RolloutConfig {
    pub simulation_window_minutes: u32,
    pub monitoring_window_minutes: u32,
    pub min_canary_minutes: u32,
    pub max_canary_minutes: u32,
    /// Simulation proceeds only while the false-positive rate stays strictly below this.
    pub false_positive_threshold_pct: f64,
    /// Canary proceeds only while the error rate stays strictly below this.
    pub canary_error_budget_pct: f64,
    /// Production error rate above this is reported as a warning.
    pub production_warn_threshold_pct: f64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: u32,
    pub provider_timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisConfig {
    pub ddos_multiplier: f64,
    pub api_abuse_share: f64,
    pub api_prefixes: Vec<String>,
    pub bot_share: f64,
    pub error_share: f64,
    pub error_status_floor: u16,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite://edgesec.db".to_string(), max_connections: 5, timeout_secs: 30 }
    }
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            simulation_window_minutes: 10,
            monitoring_window_minutes: 60,
            min_canary_minutes: 1,
            max_canary_minutes: 1440,
            false_positive_threshold_pct: 15.0,
            canary_error_budget_pct: 5.0,
            production_warn_threshold_pct: 10.0,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            retry_multiplier: 2,
            provider_timeout_secs: 30,
        }
    }
}

impl RolloutConfig {
    pub fn simulation_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.simulation_window_minutes))
    }

    pub fn monitoring_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.monitoring_window_minutes))
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> chrono::Duration {
        let factor = u64::from(self.retry_multiplier).saturating_pow(attempt.saturating_sub(1));
        let millis = self.retry_base_delay_ms.saturating_mul(factor);
        chrono::Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX))
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        let thresholds = ClassifierThresholds::default();
        Self {
            ddos_multiplier: thresholds.ddos_multiplier,
            api_abuse_share: thresholds.api_abuse_share,
            api_prefixes: thresholds.api_prefixes,
            bot_share: thresholds.bot_share,
            error_share: thresholds.error_share,
            error_status_floor: EvaluatorConfig::default().error_status_floor,
        }
    }
}

impl AnalysisConfig {
    pub fn classifier_thresholds(&self) -> ClassifierThresholds {
        ClassifierThresholds {
            ddos_multiplier: self.ddos_multiplier,
            api_abuse_share: self.api_abuse_share,
            api_prefixes: self.api_prefixes.clone(),
            bot_share: self.bot_share,
            error_share: self.error_share,
            ..ClassifierThresholds::default()
        }
    }

    pub fn evaluator_config(&self) -> EvaluatorConfig {
        EvaluatorConfig { error_status_floor: self.error_status_floor, ..EvaluatorConfig::default() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Compact }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("edgesec.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(rollout) = patch.rollout {
            let target = &mut self.rollout;
            if let Some(value) = rollout.simulation_window_minutes {
                target.simulation_window_minutes = value;
            }
            if let Some(value) = rollout.monitoring_window_minutes {
                target.monitoring_window_minutes = value;
            }
            if let Some(value) = rollout.min_canary_minutes {
                target.min_canary_minutes = value;
            }
            if let Some(value) = rollout.max_canary_minutes {
                target.max_canary_minutes = value;
            }
            if let Some(value) = rollout.false_positive_threshold_pct {
                target.false_positive_threshold_pct = value;
            }
            if let Some(value) = rollout.canary_error_budget_pct {
                target.canary_error_budget_pct = value;
            }
            if let Some(value) = rollout.production_warn_threshold_pct {
                target.production_warn_threshold_pct = value;
            }
            if let Some(value) = rollout.retry_attempts {
                target.retry_attempts = value;
            }
            if let Some(value) = rollout.retry_base_delay_ms {
                target.retry_base_delay_ms = value;
            }
            if let Some(value) = rollout.retry_multiplier {
                target.retry_multiplier = value;
            }
            if let Some(value) = rollout.provider_timeout_secs {
                target.provider_timeout_secs = value;
            }
        }

        if let Some(analysis) = patch.analysis {
            let target = &mut self.analysis;
            if let Some(value) = analysis.ddos_multiplier {
                target.ddos_multiplier = value;
            }
            if let Some(value) = analysis.api_abuse_share {
                target.api_abuse_share = value;
            }
            if let Some(value) = analysis.api_prefixes {
                target.api_prefixes = value;
            }
            if let Some(value) = analysis.bot_share {
                target.bot_share = value;
            }
            if let Some(value) = analysis.error_share {
                target.error_share = value;
            }
            if let Some(value) = analysis.error_status_floor {
                target.error_status_floor = value;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("EDGESEC_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("EDGESEC_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("EDGESEC_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("EDGESEC_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("EDGESEC_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("EDGESEC_ROLLOUT_SIMULATION_WINDOW_MINUTES") {
            self.rollout.simulation_window_minutes =
                parse_u32("EDGESEC_ROLLOUT_SIMULATION_WINDOW_MINUTES", &value)?;
        }
        if let Some(value) = read_env("EDGESEC_ROLLOUT_MONITORING_WINDOW_MINUTES") {
            self.rollout.monitoring_window_minutes =
                parse_u32("EDGESEC_ROLLOUT_MONITORING_WINDOW_MINUTES", &value)?;
        }
        if let Some(value) = read_env("EDGESEC_ROLLOUT_FALSE_POSITIVE_THRESHOLD_PCT") {
            self.rollout.false_positive_threshold_pct =
                parse_f64("EDGESEC_ROLLOUT_FALSE_POSITIVE_THRESHOLD_PCT", &value)?;
        }
        if let Some(value) = read_env("EDGESEC_ROLLOUT_CANARY_ERROR_BUDGET_PCT") {
            self.rollout.canary_error_budget_pct =
                parse_f64("EDGESEC_ROLLOUT_CANARY_ERROR_BUDGET_PCT", &value)?;
        }
        if let Some(value) = read_env("EDGESEC_ROLLOUT_PRODUCTION_WARN_THRESHOLD_PCT") {
            self.rollout.production_warn_threshold_pct =
                parse_f64("EDGESEC_ROLLOUT_PRODUCTION_WARN_THRESHOLD_PCT", &value)?;
        }
        if let Some(value) = read_env("EDGESEC_ROLLOUT_RETRY_ATTEMPTS") {
            self.rollout.retry_attempts = parse_u32("EDGESEC_ROLLOUT_RETRY_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("EDGESEC_ROLLOUT_RETRY_BASE_DELAY_MS") {
            self.rollout.retry_base_delay_ms =
                parse_u64("EDGESEC_ROLLOUT_RETRY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("EDGESEC_ROLLOUT_PROVIDER_TIMEOUT_SECS") {
            self.rollout.provider_timeout_secs =
                parse_u64("EDGESEC_ROLLOUT_PROVIDER_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("EDGESEC_ANALYSIS_DDOS_MULTIPLIER") {
            self.analysis.ddos_multiplier = parse_f64("EDGESEC_ANALYSIS_DDOS_MULTIPLIER", &value)?;
        }
        if let Some(value) = read_env("EDGESEC_ANALYSIS_ERROR_STATUS_FLOOR") {
            self.analysis.error_status_floor =
                parse_u16("EDGESEC_ANALYSIS_ERROR_STATUS_FLOOR", &value)?;
        }

        let log_level =
            read_env("EDGESEC_LOGGING_LEVEL").or_else(|| read_env("EDGESEC_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("EDGESEC_LOGGING_FORMAT").or_else(|| read_env("EDGESEC_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_rollout(&self.rollout)?;
        validate_analysis(&self.analysis)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("edgesec.toml"), PathBuf::from("config/edgesec.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_rollout(rollout: &RolloutConfig) -> Result<(), ConfigError> {
    if rollout.simulation_window_minutes == 0 || rollout.monitoring_window_minutes == 0 {
        return Err(ConfigError::Validation(
            "rollout simulation and monitoring windows must be greater than zero".to_string(),
        ));
    }

    if rollout.min_canary_minutes == 0 || rollout.min_canary_minutes > rollout.max_canary_minutes {
        return Err(ConfigError::Validation(
            "rollout.min_canary_minutes must be in range 1..=rollout.max_canary_minutes"
                .to_string(),
        ));
    }

    for (key, value) in [
        ("rollout.false_positive_threshold_pct", rollout.false_positive_threshold_pct),
        ("rollout.canary_error_budget_pct", rollout.canary_error_budget_pct),
        ("rollout.production_warn_threshold_pct", rollout.production_warn_threshold_pct),
    ] {
        if !(value > 0.0 && value <= 100.0) {
            return Err(ConfigError::Validation(format!("{key} must be in range (0, 100]")));
        }
    }

    if rollout.retry_attempts == 0 || rollout.retry_multiplier == 0 {
        return Err(ConfigError::Validation(
            "rollout.retry_attempts and rollout.retry_multiplier must be at least 1".to_string(),
        ));
    }

    if rollout.provider_timeout_secs == 0 || rollout.provider_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "rollout.provider_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_analysis(analysis: &AnalysisConfig) -> Result<(), ConfigError> {
    if analysis.ddos_multiplier <= 1.0 {
        return Err(ConfigError::Validation(
            "analysis.ddos_multiplier must be greater than 1".to_string(),
        ));
    }

    for (key, value) in [
        ("analysis.api_abuse_share", analysis.api_abuse_share),
        ("analysis.bot_share", analysis.bot_share),
        ("analysis.error_share", analysis.error_share),
    ] {
        if !(value > 0.0 && value <= 1.0) {
            return Err(ConfigError::Validation(format!("{key} must be in range (0, 1]")));
        }
    }

    if !(100..=599).contains(&analysis.error_status_floor) {
        return Err(ConfigError::Validation(
            "analysis.error_status_floor must be an HTTP status code".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    rollout: Option<RolloutPatch>,
    analysis: Option<AnalysisPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RolloutPatch {
    simulation_window_minutes: Option<u32>,
    monitoring_window_minutes: Option<u32>,
    min_canary_minutes: Option<u32>,
    max_canary_minutes: Option<u32>,
    false_positive_threshold_pct: Option<f64>,
    canary_error_budget_pct: Option<f64>,
    production_warn_threshold_pct: Option<f64>,
    retry_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_multiplier: Option<u32>,
    provider_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AnalysisPatch {
    ddos_multiplier: Option<f64>,
    api_abuse_share: Option<f64>,
    api_prefixes: Option<Vec<String>>,
    bot_share: Option<f64>,
    error_share: Option<f64>,
    error_status_floor: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
