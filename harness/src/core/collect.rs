//! Flatten executed block outputs into the outcome's log and error list.

use crate::core::document::{Output, STDOUT, ScriptDocument};
use crate::core::outcome::ErrorRecord;

/// Flattened view of everything the code blocks produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collected {
    /// stdout text in block order; block boundaries are not kept.
    pub outputs: Vec<String>,
    pub errors: Vec<ErrorRecord>,
}

impl Collected {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn collect_outputs(document: &ScriptDocument) -> Collected {
    let mut collected = Collected::default();
    for (block_index, block) in document.blocks.iter().enumerate() {
        if !block.kind.is_code() {
            continue;
        }
        for output in block.outputs() {
            match output {
                Output::Stream { name, text } if name == STDOUT => {
                    collected.outputs.push(text.clone());
                }
                Output::Error {
                    name,
                    message,
                    trace,
                } => collected.errors.push(ErrorRecord {
                    block_index,
                    name: name.clone(),
                    message: message.clone(),
                    trace: trace.clone(),
                }),
                Output::Stream { .. } | Output::Other(_) => {}
            }
        }
    }
    collected
}
