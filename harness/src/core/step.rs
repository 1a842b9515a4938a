//! Validation steps and their result-file conventions.

use std::fmt;

/// Step selecting the remote endpoint the document calls and the artifact
/// files expected in the task directory afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Step {
    ComputeComplexity,
    TaskVerification,
    RunTask,
    Evaluate,
    /// Step names without a result-file convention. Still injected verbatim.
    Other(String),
}

impl Step {
    pub fn parse(name: &str) -> Self {
        match name {
            "compute_complexity" => Step::ComputeComplexity,
            "task_verification" => Step::TaskVerification,
            "run_task" => Step::RunTask,
            "evaluate" => Step::Evaluate,
            other => Step::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Step::ComputeComplexity => "compute_complexity",
            Step::TaskVerification => "task_verification",
            Step::RunTask => "run_task",
            Step::Evaluate => "evaluate",
            Step::Other(name) => name,
        }
    }

    /// Lookup rule for the step's artifact, if the step has one.
    pub fn artifact_rule(&self) -> Option<ArtifactRule> {
        match self {
            Step::RunTask => Some(ArtifactRule {
                candidates: vec!["result.json".to_string()],
                data_key: "result_data",
                file_key: "result_file",
                error_key: "result_file_error",
            }),
            Step::ComputeComplexity | Step::TaskVerification => Some(ArtifactRule {
                candidates: vec![format!("{}_response.json", self.as_str())],
                data_key: "response_data",
                file_key: "response_file",
                error_key: "response_file_error",
            }),
            Step::Evaluate => Some(ArtifactRule {
                candidates: vec![
                    "evaluate_response.json".to_string(),
                    "evaluation_result.json".to_string(),
                ],
                data_key: "evaluation_data",
                file_key: "evaluation_file",
                error_key: "evaluation_file_error",
            }),
            Step::Other(_) => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a step's artifact lives and which outcome keys it fills.
///
/// `candidates` are file names relative to the task directory, in preference
/// order; the first one that loads wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRule {
    pub candidates: Vec<String>,
    pub data_key: &'static str,
    pub file_key: &'static str,
    pub error_key: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_round_trip() {
        for name in [
            "compute_complexity",
            "task_verification",
            "run_task",
            "evaluate",
        ] {
            let step = Step::parse(name);
            assert!(!matches!(step, Step::Other(_)), "{name} should be known");
            assert_eq!(step.as_str(), name);
        }
    }

    #[test]
    fn unknown_step_has_no_artifacts() {
        let step = Step::parse("warmup");
        assert_eq!(step, Step::Other("warmup".to_string()));
        assert_eq!(step.to_string(), "warmup");
        assert!(step.artifact_rule().is_none());
    }

    #[test]
    fn response_file_is_named_after_step() {
        let rule = Step::TaskVerification.artifact_rule().expect("rule");
        assert_eq!(rule.candidates, vec!["task_verification_response.json"]);
        assert_eq!(rule.data_key, "response_data");
    }

    #[test]
    fn evaluate_prefers_response_file() {
        let rule = Step::Evaluate.artifact_rule().expect("rule");
        assert_eq!(
            rule.candidates,
            vec!["evaluate_response.json", "evaluation_result.json"]
        );
    }
}
