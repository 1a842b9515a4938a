//! Step harness CLI.
//!
//! Executes a script document for one task and step, then prints either a
//! human-readable report or the outcome as JSON. Exit status mirrors
//! `success`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use step_harness::core::step::Step;
use step_harness::exit_codes;
use step_harness::harness::{ExecuteRequest, Harness, default_executed_path};
use step_harness::io::config::{DEFAULT_CONFIG_PATH, load_config};
use step_harness::io::kernel::ProcessKernel;
use step_harness::logging;
use step_harness::report::render_report;

#[derive(Parser, Debug)]
#[command(
    name = "step-harness",
    version,
    about = "Execute a parameterized script document for a task and extract step results"
)]
struct Cli {
    /// Path to the script document (notebook JSON).
    document: PathBuf,
    /// Path to the task description file; its directory receives artifacts.
    task: PathBuf,
    /// Validation step (compute_complexity, task_verification, run_task, evaluate).
    step: String,
    /// Save the executed document to this path.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Save the executed document next to the task when --output is not given.
    #[arg(long)]
    save_executed: bool,
    /// Print the outcome as JSON instead of a report.
    #[arg(long)]
    json_output: bool,
    /// Harness configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).context("load harness config")?;
    let step = Step::parse(&cli.step);
    let output_path = resolve_output_path(&cli, &step);

    let harness = Harness::new(ProcessKernel::from_config(&config), config);
    let outcome = harness.execute(&ExecuteRequest {
        document_path: cli.document.clone(),
        task_path: cli.task.clone(),
        step,
        output_path,
    });

    if cli.json_output {
        let payload = serde_json::to_string_pretty(&outcome).context("serialize outcome")?;
        println!("{payload}");
    } else {
        print!("{}", render_report(&outcome, &cli.step)?);
    }
    Ok(exit_codes::for_outcome(&outcome))
}

fn resolve_output_path(cli: &Cli, step: &Step) -> Option<PathBuf> {
    match (&cli.output, cli.save_executed) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => Some(default_executed_path(&cli.task, step)),
        (None, false) => None,
    }
}
