use edgesec_core::config::AppConfig;
use edgesec_core::domain::candidate::RuleId;
use edgesec_core::rollout::store::RuleProposalStore;

use crate::commands::{lookup_failure, open_store, runtime, CommandResult};

const COMMAND: &str = "status";

pub fn run(config: &AppConfig, rule_id: &str) -> CommandResult {
    let rule_id = RuleId(rule_id.to_string());
    let outcome = runtime().and_then(|runtime| {
        runtime.block_on(async {
            let store = open_store(config).await?;
            store.load(&rule_id).await.map_err(|error| lookup_failure(&rule_id, error))
        })
    });

    match outcome {
        Ok(execution) => {
            let message = format!(
                "rollout {} for rule {} is {}",
                execution.id,
                execution.rule_id,
                execution.status.as_str()
            );
            CommandResult::success_with_data(COMMAND, message, &execution)
        }
        Err(failure) => CommandResult::from_failure(COMMAND, failure),
    }
}
