pub mod assess;
pub mod classify;
pub mod history;
pub mod migrate;
pub mod simulate;
pub mod status;

use std::fs;
use std::path::Path;

use edgesec_core::config::{AppConfig, LoadOptions};
use edgesec_core::domain::candidate::RuleId;
use edgesec_core::errors::RolloutError;
use edgesec_core::rollout::store::StoreError;
use edgesec_db::{connect, migrations, SqlRolloutRepository};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Runtime;

/// Error class, message and exit code of a failed command step.
pub(crate) type Failure = (&'static str, String, u8);

pub(crate) const EXIT_CONFIG: u8 = 2;
pub(crate) const EXIT_RUNTIME: u8 = 3;
pub(crate) const EXIT_DB: u8 = 4;
pub(crate) const EXIT_MIGRATION: u8 = 5;
pub(crate) const EXIT_INPUT_READ: u8 = 6;
pub(crate) const EXIT_INPUT_PARSE: u8 = 7;
pub(crate) const EXIT_VALIDATION: u8 = 8;
pub(crate) const EXIT_NOT_FOUND: u8 = 9;
pub(crate) const EXIT_STORE: u8 = 10;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data: None,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn success_with_data<T: Serialize>(
        command: &str,
        message: impl Into<String>,
        data: &T,
    ) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => {
                let payload = CommandOutcome {
                    command: command.to_string(),
                    status: "ok".to_string(),
                    error_class: None,
                    message: message.into(),
                    data: Some(data),
                };
                Self { exit_code: 0, output: serialize_payload(payload) }
            }
            Err(error) => Self::failure(command, "serialization", error.to_string(), 1),
        }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    pub(crate) fn from_failure(command: &str, (error_class, message, exit_code): Failure) -> Self {
        Self::failure(command, error_class, message, exit_code)
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Loads the layered configuration. A broken configuration becomes the failure
/// payload of the command that was asked for.
pub fn load_config(command: &str) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            EXIT_CONFIG,
        )
    })
}

pub(crate) fn runtime() -> Result<Runtime, Failure> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        ("runtime_init", format!("failed to initialize async runtime: {error}"), EXIT_RUNTIME)
    })
}

/// Reads and decodes a JSON input file.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, Failure> {
    let raw = fs::read_to_string(path).map_err(|error| {
        ("input_read", format!("cannot read `{}`: {error}", path.display()), EXIT_INPUT_READ)
    })?;
    serde_json::from_str(&raw).map_err(|error| {
        ("input_parse", format!("invalid JSON in `{}`: {error}", path.display()), EXIT_INPUT_PARSE)
    })
}

/// Connects to the configured database with migrations applied.
pub(crate) async fn open_store(config: &AppConfig) -> Result<SqlRolloutRepository, Failure> {
    let pool = connect(&config.database)
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), EXIT_DB))?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| ("migration", error.to_string(), EXIT_MIGRATION))?;
    Ok(SqlRolloutRepository::new(pool))
}

pub(crate) fn rollout_failure(error: RolloutError) -> Failure {
    let exit_code = match error {
        RolloutError::NotFound(_) => EXIT_NOT_FOUND,
        RolloutError::Validation(_) => EXIT_VALIDATION,
        _ => EXIT_STORE,
    };
    (error.error_class(), error.to_string(), exit_code)
}

pub(crate) fn lookup_failure(rule_id: &RuleId, error: StoreError) -> Failure {
    rollout_failure(RolloutError::from_lookup(rule_id, error))
}
