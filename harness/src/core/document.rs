//! Script document model.
//!
//! A script document is an ordered list of blocks stored in notebook format
//! (`cells`, `cell_type`, `source`, `outputs`). Fields the harness does not
//! interpret are carried through `extra` so a load/save cycle keeps them.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

/// Ordered sequence of blocks plus untouched document-level metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDocument {
    #[serde(rename = "cells")]
    pub blocks: Vec<Block>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ScriptDocument {
    pub fn new(blocks: Vec<Block>) -> Self {
        let mut extra = Map::new();
        extra.insert("metadata".to_string(), json!({}));
        extra.insert("nbformat".to_string(), json!(4));
        extra.insert("nbformat_minor".to_string(), json!(5));
        Self { blocks, extra }
    }

    pub fn code_block_count(&self) -> usize {
        self.blocks.iter().filter(|block| block.kind.is_code()).count()
    }
}

/// Block type. Anything other than `code` is carried but never executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BlockKind {
    Code,
    Markdown,
    Raw,
    Other(String),
}

impl BlockKind {
    pub fn is_code(&self) -> bool {
        matches!(self, BlockKind::Code)
    }

    pub fn as_str(&self) -> &str {
        match self {
            BlockKind::Code => "code",
            BlockKind::Markdown => "markdown",
            BlockKind::Raw => "raw",
            BlockKind::Other(name) => name,
        }
    }
}

impl From<String> for BlockKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "code" => BlockKind::Code,
            "markdown" => BlockKind::Markdown,
            "raw" => BlockKind::Raw,
            _ => BlockKind::Other(value),
        }
    }
}

impl From<BlockKind> for String {
    fn from(kind: BlockKind) -> Self {
        kind.as_str().to_string()
    }
}

/// One unit of a script document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "cell_type")]
    pub kind: BlockKind,
    #[serde(deserialize_with = "joined_text")]
    pub source: String,
    /// `None` for blocks that never carried an output list (non-code blocks).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outputs: Option<Vec<Output>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Block {
    pub fn code(source: impl Into<String>) -> Self {
        let mut extra = Map::new();
        extra.insert("metadata".to_string(), json!({}));
        extra.insert("execution_count".to_string(), Value::Null);
        Self {
            kind: BlockKind::Code,
            source: source.into(),
            outputs: Some(Vec::new()),
            extra,
        }
    }

    pub fn markdown(source: impl Into<String>) -> Self {
        let mut extra = Map::new();
        extra.insert("metadata".to_string(), json!({}));
        Self {
            kind: BlockKind::Markdown,
            source: source.into(),
            outputs: None,
            extra,
        }
    }

    pub fn outputs(&self) -> &[Output] {
        self.outputs.as_deref().unwrap_or_default()
    }

    /// Reset the block for a fresh run: previous outputs are dropped and the
    /// execution counter is stamped.
    pub fn begin_execution(&mut self, execution_count: u64) {
        self.outputs = Some(Vec::new());
        self.extra
            .insert("execution_count".to_string(), json!(execution_count));
    }

    /// Append an output. Outputs already recorded are never rewritten.
    pub fn push_output(&mut self, output: Output) {
        self.outputs.get_or_insert_with(Vec::new).push(output);
    }
}

/// Something a code block produced while running.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Textual stream; `name` is `stdout` or `stderr`.
    Stream { name: String, text: String },
    /// A fault raised by the block.
    Error {
        name: String,
        message: String,
        trace: Vec<String>,
    },
    /// Rich output kinds (display data, execute results) kept as-is.
    Other(Value),
}

pub const STDOUT: &str = "stdout";
pub const STDERR: &str = "stderr";

impl Output {
    pub fn stdout(text: impl Into<String>) -> Self {
        Output::Stream {
            name: STDOUT.to_string(),
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Output::Stream {
            name: STDERR.to_string(),
            text: text.into(),
        }
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>, trace: Vec<String>) -> Self {
        Output::Error {
            name: name.into(),
            message: message.into(),
            trace,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Output::Error { .. })
    }
}

#[derive(Deserialize)]
struct StreamRepr {
    name: String,
    #[serde(deserialize_with = "joined_text")]
    text: String,
}

#[derive(Deserialize)]
struct ErrorRepr {
    ename: String,
    evalue: String,
    #[serde(default)]
    traceback: Vec<String>,
}

impl Output {
    fn from_value(value: Value) -> serde_json::Result<Self> {
        match value.get("output_type").and_then(Value::as_str) {
            Some("stream") => {
                let repr: StreamRepr = serde_json::from_value(value)?;
                Ok(Output::Stream {
                    name: repr.name,
                    text: repr.text,
                })
            }
            Some("error") => {
                let repr: ErrorRepr = serde_json::from_value(value)?;
                Ok(Output::Error {
                    name: repr.ename,
                    message: repr.evalue,
                    trace: repr.traceback,
                })
            }
            _ => Ok(Output::Other(value)),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Output::Stream { name, text } => json!({
                "output_type": "stream",
                "name": name,
                "text": text,
            }),
            Output::Error {
                name,
                message,
                trace,
            } => json!({
                "output_type": "error",
                "ename": name,
                "evalue": message,
                "traceback": trace,
            }),
            Output::Other(value) => value.clone(),
        }
    }
}

impl Serialize for Output {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Output {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Output::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Notebook text fields are either one string or a list of line fragments.
fn joined_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Text {
        Whole(String),
        Lines(Vec<String>),
    }

    Ok(match Text::deserialize(deserializer)? {
        Text::Whole(text) => text,
        Text::Lines(lines) => lines.concat(),
    })
}
