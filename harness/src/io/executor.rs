//! Sequential, fault-tolerant execution of a script document.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::document::{Output, ScriptDocument};
use crate::core::outcome::SessionStatus;
use crate::io::kernel::{ExecutionContext, Kernel, Session};

/// What the executor observed while running a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub status: SessionStatus,
    pub executed_blocks: usize,
    pub failed_blocks: usize,
}

/// Run every code block of `document` in order, recording outputs on the
/// blocks themselves.
///
/// A block that raises is recorded and execution moves on to the next block.
/// Only session-level faults (the kernel cannot start, a block cannot be
/// launched, the ceiling is exceeded) return `Err`.
#[instrument(skip_all, fields(blocks = document.blocks.len()))]
pub fn execute_document<K: Kernel>(
    kernel: &K,
    document: &mut ScriptDocument,
    context: &mut ExecutionContext,
) -> Result<ExecutionSummary> {
    let mut status = SessionStatus::NotStarted;
    let mut session = kernel
        .start(context)
        .context("start execution session")?;
    status = status.advance(0);
    debug!(?status, "session running");

    let mut executed_blocks = 0usize;
    let mut failed_blocks = 0usize;
    for (index, block) in document.blocks.iter_mut().enumerate() {
        if !block.kind.is_code() {
            continue;
        }
        executed_blocks += 1;
        block.begin_execution(executed_blocks as u64);

        let outputs = session.run_block(context, index, &block.source)?;
        if let Some(Output::Error { name, message, .. }) =
            outputs.iter().find(|output| output.is_error())
        {
            failed_blocks += 1;
            warn!(index, name = %name, message = %message, "block raised, continuing");
        } else {
            debug!(index, outputs = outputs.len(), "block finished");
        }
        for output in outputs {
            block.push_output(output);
        }
    }

    status = status.advance(failed_blocks);
    debug_assert!(status.is_terminal());
    info!(?status, executed_blocks, failed_blocks, "document executed");
    Ok(ExecutionSummary {
        status,
        executed_blocks,
        failed_blocks,
    })
}
