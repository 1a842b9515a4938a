//! Parameter injection into the first block of a script document.
//!
//! Pure text substitution: lines whose trimmed form starts with one of the two
//! assignment prefixes are replaced wholesale, everything else is kept byte for
//! byte. Only the first block is eligible and only when it is a code block.

use std::path::MAIN_SEPARATOR;

use crate::core::document::ScriptDocument;

pub const TASK_PATH_PREFIX: &str = "task_path =";
pub const ENDPOINT_PREFIX: &str = "selected_endpoint =";

/// Rewrite the parameter assignments in the first block.
///
/// Returns the number of lines replaced; zero when the document is empty, the
/// first block is not code, or no line matched.
pub fn inject_parameters(document: &mut ScriptDocument, task_path: &str, step: &str) -> usize {
    let Some(first) = document.blocks.first_mut() else {
        return 0;
    };
    if !first.kind.is_code() {
        return 0;
    }
    let (source, replaced) = rewrite_source(&first.source, task_path, step);
    if replaced > 0 {
        first.source = source;
    }
    replaced
}

/// Line-by-line substitution over one block's source.
pub fn rewrite_source(source: &str, task_path: &str, step: &str) -> (String, usize) {
    let task_line = format!(
        "task_path = \"{}\"",
        quote_literal(&normalize_separators(task_path))
    );
    let step_line = format!("selected_endpoint = \"{}\"", quote_literal(step));

    let mut replaced = 0usize;
    let lines: Vec<String> = source
        .split('\n')
        .map(|line| {
            let (body, terminator) = match line.strip_suffix('\r') {
                Some(body) => (body, "\r"),
                None => (line, ""),
            };
            let trimmed = body.trim();
            if trimmed.starts_with(TASK_PATH_PREFIX) {
                replaced += 1;
                format!("{task_line}{terminator}")
            } else if trimmed.starts_with(ENDPOINT_PREFIX) {
                replaced += 1;
                format!("{step_line}{terminator}")
            } else {
                line.to_string()
            }
        })
        .collect();
    (lines.join("\n"), replaced)
}

fn normalize_separators(path: &str) -> String {
    replace_separator(path, MAIN_SEPARATOR)
}

/// Task paths are always written with `/` so the literal reads the same on
/// every platform.
fn replace_separator(path: &str, separator: char) -> String {
    path.replace(separator, "/")
}

fn quote_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
