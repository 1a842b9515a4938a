//! Outcome types returned by the harness.
//!
//! These are the stable contract with callers: the JSON rendering of
//! [`ExecutionOutcome`] is what `--json-output` prints.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// Named step result data: parsed artifacts, their paths, or companion
/// `*_error` strings.
pub type StepArtifacts = BTreeMap<String, Value>;

/// Lifecycle of one execution session.
///
/// There is no aborted state: block failures only steer the session into
/// `CompletedWithErrors`. Infrastructure faults leave the state machine
/// entirely and surface as a [`FatalOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    NotStarted,
    Running,
    Completed,
    CompletedWithErrors,
}

impl SessionStatus {
    /// Advance one transition. Terminal states stay put.
    pub fn advance(self, failed_blocks: usize) -> Self {
        match self {
            SessionStatus::NotStarted => SessionStatus::Running,
            SessionStatus::Running if failed_blocks == 0 => SessionStatus::Completed,
            SessionStatus::Running => SessionStatus::CompletedWithErrors,
            terminal => terminal,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::CompletedWithErrors
        )
    }
}

/// One fault raised by a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub block_index: usize,
    pub name: String,
    pub message: String,
    pub trace: Vec<String>,
}

/// Result of a run that got through execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// True iff `errors` is empty.
    pub success: bool,
    pub step: String,
    pub task_path: String,
    pub executed_document: Option<String>,
    pub outputs: Vec<String>,
    pub errors: Vec<ErrorRecord>,
    pub step_artifacts: StepArtifacts,
    /// Final session state as reported by the executor; informational only.
    pub session_status: SessionStatus,
}

/// A precondition or infrastructure fault that ended the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FatalOutcome {
    success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_path: Option<String>,
}

/// The harness's return value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExecutionOutcome {
    Ran(RunReport),
    Fatal(FatalOutcome),
}

impl ExecutionOutcome {
    /// Precondition failure: nothing was loaded or executed.
    pub fn precondition(error: impl Into<String>) -> Self {
        ExecutionOutcome::Fatal(FatalOutcome {
            success: false,
            error: error.into(),
            step: None,
            task_path: None,
        })
    }

    /// Infrastructure failure after preconditions passed.
    pub fn infrastructure(cause: &anyhow::Error, step: &str, task_path: &str) -> Self {
        ExecutionOutcome::Fatal(FatalOutcome {
            success: false,
            error: format!("Failed to execute: {cause:#}"),
            step: Some(step.to_string()),
            task_path: Some(task_path.to_string()),
        })
    }

    pub fn success(&self) -> bool {
        match self {
            ExecutionOutcome::Ran(report) => report.success,
            ExecutionOutcome::Fatal(_) => false,
        }
    }

    pub fn fatal_error(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Ran(_) => None,
            ExecutionOutcome::Fatal(fatal) => Some(&fatal.error),
        }
    }

    pub fn report(&self) -> Option<&RunReport> {
        match self {
            ExecutionOutcome::Ran(report) => Some(report),
            ExecutionOutcome::Fatal(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    #[test]
    fn session_walks_to_completed() {
        let status = SessionStatus::NotStarted.advance(0);
        assert_eq!(status, SessionStatus::Running);
        assert!(!status.is_terminal());
        let status = status.advance(0);
        assert_eq!(status, SessionStatus::Completed);
        assert_eq!(status.advance(5), SessionStatus::Completed);
    }

    #[test]
    fn session_with_failures_completes_with_errors() {
        let status = SessionStatus::Running.advance(2);
        assert_eq!(status, SessionStatus::CompletedWithErrors);
        assert!(status.is_terminal());
    }

    #[test]
    fn precondition_outcome_serializes_minimal_shape() {
        let outcome = ExecutionOutcome::precondition("Notebook not found: nb.ipynb");
        assert!(!outcome.success());
        assert_eq!(
            serde_json::to_value(&outcome).expect("serialize"),
            json!({"success": false, "error": "Notebook not found: nb.ipynb"})
        );
    }

    #[test]
    fn infrastructure_outcome_carries_cause_chain() {
        let cause = anyhow!("spawn failed").context("start execution session");
        let outcome = ExecutionOutcome::infrastructure(&cause, "run_task", "t/task.json");
        assert_eq!(
            outcome.fatal_error(),
            Some("Failed to execute: start execution session: spawn failed")
        );
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(value["step"], "run_task");
        assert_eq!(value["task_path"], "t/task.json");
    }
}
