use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::candidate::RuleId;
use crate::domain::rollout::{ExecutionId, RolloutExecution};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no rollout execution found for `{0}`")]
    NotFound(String),
    #[error(
        "stale write for execution `{execution_id}`: stored version {stored}, attempted {attempted}"
    )]
    StaleWrite { execution_id: String, stored: u32, attempted: u32 },
    #[error("rollout store backend failure: {0}")]
    Backend(String),
}

/// Durable home of rollout executions.
///
/// Records are keyed by execution id and never deleted, so a rule's full
/// rollout history stays available after each execution terminates. Saves are
/// optimistic: a write must carry a `state_version` newer than the stored one.
#[async_trait]
pub trait RuleProposalStore: Send + Sync {
    async fn save(&self, execution: &RolloutExecution) -> Result<(), StoreError>;

    /// Latest execution for the rule. Unknown rules are `StoreError::NotFound`.
    async fn load(&self, rule_id: &RuleId) -> Result<RolloutExecution, StoreError>;

    async fn load_execution(&self, id: &ExecutionId) -> Result<RolloutExecution, StoreError>;

    /// Oldest first.
    async fn list_for_rule(&self, rule_id: &RuleId) -> Result<Vec<RolloutExecution>, StoreError>;

    async fn list_unfinished(&self) -> Result<Vec<RolloutExecution>, StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryRolloutStore {
    executions: Arc<Mutex<Vec<RolloutExecution>>>,
}

impl InMemoryRolloutStore {
    fn executions(&self) -> MutexGuard<'_, Vec<RolloutExecution>> {
        match self.executions.lock() {
            Ok(executions) => executions,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl RuleProposalStore for InMemoryRolloutStore {
    async fn save(&self, execution: &RolloutExecution) -> Result<(), StoreError> {
        let mut executions = self.executions();
        match executions.iter().position(|stored| stored.id == execution.id) {
            Some(index) if executions[index].state_version >= execution.state_version => {
                Err(StoreError::StaleWrite {
                    execution_id: execution.id.0.clone(),
                    stored: executions[index].state_version,
                    attempted: execution.state_version,
                })
            }
            Some(index) => {
                executions[index] = execution.clone();
                Ok(())
            }
            None => {
                executions.push(execution.clone());
                Ok(())
            }
        }
    }

    async fn load(&self, rule_id: &RuleId) -> Result<RolloutExecution, StoreError> {
        self.executions()
            .iter()
            .filter(|execution| &execution.rule_id == rule_id)
            .max_by_key(|execution| execution.created_at)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(rule_id.0.clone()))
    }

    async fn load_execution(&self, id: &ExecutionId) -> Result<RolloutExecution, StoreError> {
        self.executions()
            .iter()
            .find(|execution| &execution.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.0.clone()))
    }

    async fn list_for_rule(&self, rule_id: &RuleId) -> Result<Vec<RolloutExecution>, StoreError> {
        let mut history: Vec<RolloutExecution> = self
            .executions()
            .iter()
            .filter(|execution| &execution.rule_id == rule_id)
            .cloned()
            .collect();
        history.sort_by_key(|execution| execution.created_at);
        Ok(history)
    }

    async fn list_unfinished(&self) -> Result<Vec<RolloutExecution>, StoreError> {
        Ok(self.executions().iter().filter(|execution| !execution.is_terminal()).cloned().collect())
    }
}
