//! Step result extraction from the task directory.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::outcome::StepArtifacts;
use crate::core::step::Step;

/// Load the step's artifact files from `task_dir`.
///
/// Absent files are skipped. A file that exists but does not parse records
/// its error under the rule's `*_error` key and the next candidate is tried;
/// the first candidate that parses ends the search. Never fails and never
/// writes, so repeated calls on an unchanged directory agree.
pub fn extract_artifacts(step: &Step, task_dir: &Path) -> StepArtifacts {
    let mut artifacts = StepArtifacts::new();
    let Some(rule) = step.artifact_rule() else {
        debug!(step = %step, "step has no artifact convention");
        return artifacts;
    };

    for candidate in &rule.candidates {
        let path = task_dir.join(candidate);
        if !path.exists() {
            continue;
        }
        artifacts.insert(
            rule.file_key.to_string(),
            Value::String(path.display().to_string()),
        );
        match load_json(&path) {
            Ok(data) => {
                debug!(path = %path.display(), key = rule.data_key, "artifact loaded");
                artifacts.insert(rule.data_key.to_string(), data);
                break;
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(path = %path.display(), err = %message, "artifact unreadable");
                artifacts.insert(rule.error_key.to_string(), Value::String(message));
            }
        }
    }
    artifacts
}

fn load_json(path: &Path) -> Result<Value> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(value)
}
