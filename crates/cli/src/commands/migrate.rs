use edgesec_core::config::AppConfig;

use crate::commands::{open_store, runtime, CommandResult, Failure};

const COMMAND: &str = "migrate";

pub fn run(config: &AppConfig) -> CommandResult {
    let outcome = runtime().and_then(|runtime| {
        runtime.block_on(async {
            // Opening the store applies pending migrations.
            let _store = open_store(config).await?;
            Ok::<_, Failure>(config.database.url.clone())
        })
    });

    match outcome {
        Ok(url) => CommandResult::success(COMMAND, format!("applied pending migrations to {url}")),
        Err(failure) => CommandResult::from_failure(COMMAND, failure),
    }
}
