use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row};

use edgesec_core::domain::candidate::RuleId;
use edgesec_core::domain::rollout::{ExecutionId, RolloutExecution, RolloutStatus};
use edgesec_core::rollout::store::{RuleProposalStore, StoreError};

use super::RepositoryError;
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT
        id,
        rule_id,
        status,
        candidate_json,
        canary_duration_minutes,
        active_phase_json,
        phase_history_json,
        failure_json,
        correlation_id,
        state_version,
        created_at,
        updated_at,
        completed_at
     FROM rollout_execution";

/// SQLite-backed rollout store. Executions are upserted by id and never deleted.
pub struct SqlRolloutRepository {
    pool: DbPool,
}

impl SqlRolloutRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn stored_version(&self, id: &ExecutionId) -> Result<Option<u32>, RepositoryError> {
        let version = sqlx::query_scalar::<_, i64>(
            "SELECT state_version FROM rollout_execution WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        version.map(|value| parse_u32("state_version", value)).transpose()
    }

    async fn upsert(&self, execution: &RolloutExecution) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO rollout_execution (
                id,
                rule_id,
                status,
                candidate_json,
                canary_duration_minutes,
                active_phase_json,
                phase_history_json,
                failure_json,
                correlation_id,
                state_version,
                created_at,
                updated_at,
                completed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                candidate_json = excluded.candidate_json,
                canary_duration_minutes = excluded.canary_duration_minutes,
                active_phase_json = excluded.active_phase_json,
                phase_history_json = excluded.phase_history_json,
                failure_json = excluded.failure_json,
                state_version = excluded.state_version,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at
             WHERE rollout_execution.state_version < excluded.state_version",
        )
        .bind(&execution.id.0)
        .bind(&execution.rule_id.0)
        .bind(execution.status.as_str())
        .bind(encode_json("candidate_json", &execution.candidate)?)
        .bind(i64::from(execution.canary_duration_minutes))
        .bind(execution.active_phase.as_ref().map(|active| encode_json("active_phase_json", active)).transpose()?)
        .bind(encode_json("phase_history_json", &execution.phase_history)?)
        .bind(execution.failure.as_ref().map(|failure| encode_json("failure_json", failure)).transpose()?)
        .bind(&execution.correlation_id)
        .bind(i64::from(execution.state_version))
        .bind(format_timestamp(execution.created_at))
        .bind(format_timestamp(execution.updated_at))
        .bind(execution.completed_at.map(format_timestamp))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn fetch_latest(&self, rule_id: &RuleId) -> Result<Option<RolloutExecution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE rule_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1"
        ))
        .bind(&rule_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(execution_from_row).transpose()
    }

    async fn fetch_by_id(&self, id: &ExecutionId) -> Result<Option<RolloutExecution>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(execution_from_row).transpose()
    }

    async fn fetch_for_rule(&self, rule_id: &RuleId) -> Result<Vec<RolloutExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE rule_id = ? ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(&rule_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(execution_from_row).collect()
    }

    async fn fetch_unfinished(&self) -> Result<Vec<RolloutExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS}
             WHERE status NOT IN ('succeeded', 'failed', 'aborted')
             ORDER BY created_at ASC, rowid ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(execution_from_row).collect()
    }
}

#[async_trait::async_trait]
impl RuleProposalStore for SqlRolloutRepository {
    async fn save(&self, execution: &RolloutExecution) -> Result<(), StoreError> {
        if self.upsert(execution).await? > 0 {
            return Ok(());
        }

        let stored = self.stored_version(&execution.id).await?.unwrap_or_default();
        Err(StoreError::StaleWrite {
            execution_id: execution.id.0.clone(),
            stored,
            attempted: execution.state_version,
        })
    }

    async fn load(&self, rule_id: &RuleId) -> Result<RolloutExecution, StoreError> {
        self.fetch_latest(rule_id).await?.ok_or_else(|| StoreError::NotFound(rule_id.0.clone()))
    }

    async fn load_execution(&self, id: &ExecutionId) -> Result<RolloutExecution, StoreError> {
        self.fetch_by_id(id).await?.ok_or_else(|| StoreError::NotFound(id.0.clone()))
    }

    async fn list_for_rule(&self, rule_id: &RuleId) -> Result<Vec<RolloutExecution>, StoreError> {
        Ok(self.fetch_for_rule(rule_id).await?)
    }

    async fn list_unfinished(&self) -> Result<Vec<RolloutExecution>, StoreError> {
        Ok(self.fetch_unfinished().await?)
    }
}

fn execution_from_row(row: SqliteRow) -> Result<RolloutExecution, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = RolloutStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown rollout status `{status_raw}`"))
    })?;

    Ok(RolloutExecution {
        id: ExecutionId(row.try_get("id")?),
        rule_id: RuleId(row.try_get("rule_id")?),
        candidate: decode_json("candidate_json", row.try_get("candidate_json")?)?,
        canary_duration_minutes: parse_u32(
            "canary_duration_minutes",
            row.try_get("canary_duration_minutes")?,
        )?,
        status,
        active_phase: row
            .try_get::<Option<String>, _>("active_phase_json")?
            .map(|value| decode_json("active_phase_json", value))
            .transpose()?,
        phase_history: decode_json("phase_history_json", row.try_get("phase_history_json")?)?,
        failure: row
            .try_get::<Option<String>, _>("failure_json")?
            .map(|value| decode_json("failure_json", value))
            .transpose()?,
        correlation_id: row.try_get("correlation_id")?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    })
}

/// Fixed-width UTC so text ordering in SQL matches time ordering.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn encode_json<T: Serialize>(column: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("cannot encode `{column}`: {error}")))
}

fn decode_json<T: DeserializeOwned>(column: &str, value: String) -> Result<T, RepositoryError> {
    serde_json::from_str(&value)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}

fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
