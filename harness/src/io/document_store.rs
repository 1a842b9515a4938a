//! Script document load/save with structural schema validation.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::Validator;
use serde_json::Value;

use crate::core::document::ScriptDocument;

const DOCUMENT_SCHEMA: &str = include_str!("../../schemas/script_document.schema.json");

static DOCUMENT_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(DOCUMENT_SCHEMA).map_err(|err| err.to_string())?;
    jsonschema::validator_for(&schema).map_err(|err| err.to_string())
});

/// Read, schema-check and parse a script document.
pub fn load_document(path: &Path) -> Result<ScriptDocument> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read document {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse document {}", path.display()))?;
    validate_document(&value).with_context(|| format!("validate document {}", path.display()))?;
    let document: ScriptDocument = serde_json::from_value(value)
        .with_context(|| format!("deserialize document {}", path.display()))?;
    Ok(document)
}

/// Write the document as pretty JSON, creating parent directories.
pub fn write_document(path: &Path, document: &ScriptDocument) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(document).context("serialize document")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write document {}", path.display()))
}

fn validate_document(value: &Value) -> Result<()> {
    let validator = DOCUMENT_VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("invalid document schema: {err}"))?;
    let messages: Vec<String> = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "document schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
