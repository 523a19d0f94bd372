use std::path::Path;

use edgesec_core::analysis::AnomalyClassifier;
use edgesec_core::config::AppConfig;
use edgesec_core::domain::traffic::LogRecord;

use crate::commands::{read_json, CommandResult};

const COMMAND: &str = "classify";

pub fn run(config: &AppConfig, log_file: &Path) -> CommandResult {
    let outcome = read_json::<Vec<LogRecord>>(log_file).map(|batch| {
        AnomalyClassifier::new(config.analysis.classifier_thresholds()).classify(&batch)
    });

    match outcome {
        Ok(report) => {
            tracing::info!(
                event_name = "cli.classify.completed",
                record_count = report.record_count,
                anomaly_count = report.anomalies.len(),
                severity = report.aggregate_severity.as_str(),
                "classified traffic batch"
            );
            let message = format!(
                "{} anomalies in {} records, aggregate severity {}",
                report.anomalies.len(),
                report.record_count,
                report.aggregate_severity.as_str()
            );
            CommandResult::success_with_data(COMMAND, message, &report)
        }
        Err(failure) => CommandResult::from_failure(COMMAND, failure),
    }
}
