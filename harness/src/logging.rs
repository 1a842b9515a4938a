//! Development-time tracing for debugging the harness.
//!
//! Diagnostics go to stderr and are controlled by `RUST_LOG`. The outcome
//! report (or `--json-output` document) goes to stdout and is unaffected.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn` if unset. Compact format on stderr.
///
/// # Example
/// ```bash
/// RUST_LOG=step_harness=debug step-harness notebook.ipynb tasks/t1/task.json run_task
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
