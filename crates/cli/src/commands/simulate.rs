use std::path::Path;

use edgesec_core::analysis::RuleSimulator;
use edgesec_core::domain::candidate::RuleCandidate;
use edgesec_core::domain::traffic::LogRecord;

use crate::commands::{read_json, CommandResult, Failure, EXIT_VALIDATION};

const COMMAND: &str = "simulate";

/// With `text`, the output is the rendered report rather than the JSON payload.
pub fn run(log_file: &Path, rule_file: &Path, text: bool) -> CommandResult {
    let outcome = (|| -> Result<_, Failure> {
        let candidate: RuleCandidate = read_json(rule_file)?;
        candidate
            .validate()
            .map_err(|error| ("validation", error.to_string(), EXIT_VALIDATION))?;
        let batch: Vec<LogRecord> = read_json(log_file)?;
        Ok(RuleSimulator.simulate(&candidate, &batch))
    })();

    match outcome {
        Ok(report) if text => CommandResult { exit_code: 0, output: report.render_report() },
        Ok(report) => {
            let message = if report.exceeds_false_positive_warning() {
                format!(
                    "estimated false positive rate {}% is high",
                    report.false_positive_rate_estimate_pct
                )
            } else {
                format!("matched {} of {} requests", report.matched, report.total_requests)
            };
            CommandResult::success_with_data(COMMAND, message, &report)
        }
        Err(failure) => CommandResult::from_failure(COMMAND, failure),
    }
}
