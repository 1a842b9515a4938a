//! Human-readable outcome report printed by the CLI.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::outcome::{ErrorRecord, ExecutionOutcome};

const REPORT_TEMPLATE: &str = include_str!("templates/report.txt");

/// Render the banner, block errors and output log for `outcome`.
///
/// `step` is the step name as given by the caller; fatal outcomes from
/// precondition checks do not carry one.
pub fn render_report(outcome: &ExecutionOutcome, step: &str) -> Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("report", REPORT_TEMPLATE)?;
    let template = env.get_template("report")?;

    let report = outcome.report();
    let errors: &[ErrorRecord] = report.map(|r| r.errors.as_slice()).unwrap_or_default();
    let outputs: &[String] = report.map(|r| r.outputs.as_slice()).unwrap_or_default();
    let artifacts: Vec<&str> = report
        .map(|r| r.step_artifacts.keys().map(String::as_str).collect())
        .unwrap_or_default();

    let rendered = template.render(context! {
        success => outcome.success(),
        step => step,
        error => outcome.fatal_error(),
        errors => errors,
        outputs => outputs,
        artifacts => artifacts,
        executed_document => report.and_then(|r| r.executed_document.as_deref()),
    })?;
    Ok(rendered)
}
