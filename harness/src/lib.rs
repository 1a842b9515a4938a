//! Parameterized step-execution harness.
//!
//! Runs a script document (notebook-format JSON) against one task: the first
//! block's `task_path` / `selected_endpoint` assignments are rewritten, every
//! code block runs in order under a single time ceiling, failures are recorded
//! per block without stopping the run, and the step's result files are loaded
//! from the task directory.
//!
//! - **[`core`]**: Pure logic (document model, injection, collection, step rules).
//! - **[`io`]**: Side effects (config, processes, kernels, document and artifact files).
//!
//! [`harness`] composes both into the single `execute` entry point used by the CLI.

pub mod core;
pub mod exit_codes;
pub mod harness;
pub mod io;
pub mod logging;
pub mod report;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
