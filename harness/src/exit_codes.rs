//! Stable exit codes for the harness CLI.

use crate::core::outcome::ExecutionOutcome;

/// Every block ran without raising.
pub const OK: i32 = 0;
/// A block raised, a precondition or infrastructure fault occurred, or the
/// CLI itself could not start (bad arguments or config).
pub const FAILED: i32 = 1;

pub fn for_outcome(outcome: &ExecutionOutcome) -> i32 {
    if outcome.success() { OK } else { FAILED }
}
