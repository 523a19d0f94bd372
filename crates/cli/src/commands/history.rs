use edgesec_core::config::AppConfig;
use edgesec_core::domain::candidate::RuleId;
use edgesec_core::errors::RolloutError;
use edgesec_core::rollout::store::RuleProposalStore;

use crate::commands::{lookup_failure, open_store, rollout_failure, runtime, CommandResult};

const COMMAND: &str = "history";

pub fn run(config: &AppConfig, rule_id: &str) -> CommandResult {
    let rule_id = RuleId(rule_id.to_string());
    let outcome = runtime().and_then(|runtime| {
        runtime.block_on(async {
            let store = open_store(config).await?;
            let history =
                store.list_for_rule(&rule_id).await.map_err(|error| lookup_failure(&rule_id, error))?;
            if history.is_empty() {
                return Err(rollout_failure(RolloutError::NotFound(rule_id.clone())));
            }
            Ok(history)
        })
    });

    match outcome {
        Ok(history) => CommandResult::success_with_data(
            COMMAND,
            format!("{} rollout executions recorded for rule {rule_id}", history.len()),
            &history,
        ),
        Err(failure) => CommandResult::from_failure(COMMAND, failure),
    }
}
