use std::path::Path;

use edgesec_core::analysis::{RiskAssessment, RiskAssessor};
use edgesec_core::domain::candidate::RuleCandidate;
use serde::Serialize;

use crate::commands::{read_json, CommandResult, Failure, EXIT_VALIDATION};

const COMMAND: &str = "assess";

#[derive(Debug, Serialize)]
struct AssessmentPayload {
    rule_id: String,
    fingerprint: String,
    assessment: RiskAssessment,
}

pub fn run(rule_file: &Path) -> CommandResult {
    let outcome = read_json::<RuleCandidate>(rule_file).and_then(|candidate| {
        candidate
            .validate()
            .map_err(|error| -> Failure { ("validation", error.to_string(), EXIT_VALIDATION) })?;
        Ok(AssessmentPayload {
            rule_id: candidate.rule_id.0.clone(),
            fingerprint: candidate.fingerprint(),
            assessment: RiskAssessor.assess(&candidate),
        })
    });

    match outcome {
        Ok(payload) => {
            let message = format!(
                "risk tier {}, expected false positive risk {}",
                payload.assessment.tier.as_str(),
                payload.assessment.expected_false_positive_risk.as_str()
            );
            CommandResult::success_with_data(COMMAND, message, &payload)
        }
        Err(failure) => CommandResult::from_failure(COMMAND, failure),
    }
}
