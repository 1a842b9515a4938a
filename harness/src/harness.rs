//! Orchestration for one validation call.
//!
//! `validate preconditions → load → inject → execute → persist → collect →
//! extract`. Precondition and infrastructure faults end the call with a
//! fatal outcome; everything else is reported as data on the [`RunReport`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, instrument};

use crate::core::collect::collect_outputs;
use crate::core::inject::inject_parameters;
use crate::core::outcome::{ExecutionOutcome, RunReport};
use crate::core::step::Step;
use crate::io::artifacts::extract_artifacts;
use crate::io::config::HarnessConfig;
use crate::io::document_store::{load_document, write_document};
use crate::io::executor::execute_document;
use crate::io::kernel::{ExecutionContext, Kernel};

/// Inputs of one validation call.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub document_path: PathBuf,
    pub task_path: PathBuf,
    pub step: Step,
    /// Where to persist the executed document, if anywhere.
    pub output_path: Option<PathBuf>,
}

/// Validation entry point. Holds only immutable configuration, so one
/// instance can serve any number of calls.
pub struct Harness<K: Kernel> {
    kernel: K,
    config: HarnessConfig,
}

impl<K: Kernel> Harness<K> {
    pub fn new(kernel: K, config: HarnessConfig) -> Self {
        Self { kernel, config }
    }

    #[instrument(skip_all, fields(step = %request.step, task = %request.task_path.display()))]
    pub fn execute(&self, request: &ExecuteRequest) -> ExecutionOutcome {
        if !request.document_path.exists() {
            return ExecutionOutcome::precondition(format!(
                "Notebook not found: {}",
                request.document_path.display()
            ));
        }
        if !request.task_path.exists() {
            return ExecutionOutcome::precondition(format!(
                "Task file not found: {}",
                request.task_path.display()
            ));
        }

        match self.run(request) {
            Ok(report) => ExecutionOutcome::Ran(report),
            Err(err) => {
                let message = format!("{err:#}");
                error!(err = %message, "execution failed");
                ExecutionOutcome::infrastructure(
                    &err,
                    request.step.as_str(),
                    &request.task_path.display().to_string(),
                )
            }
        }
    }

    fn run(&self, request: &ExecuteRequest) -> Result<RunReport> {
        let task_path = request.task_path.display().to_string();
        let task_dir = task_dir(&request.task_path);

        let mut document = load_document(&request.document_path)?;
        let replaced = inject_parameters(&mut document, &task_path, request.step.as_str());
        info!(
            step = %request.step,
            replaced,
            code_blocks = document.code_block_count(),
            "executing document for step"
        );

        let mut context = ExecutionContext::new(
            task_dir.clone(),
            Duration::from_secs(self.config.timeout_secs),
        );
        self.seed_bindings(&mut context, request, &task_dir);
        let summary = execute_document(&self.kernel, &mut document, &mut context)?;

        if let Some(output_path) = &request.output_path {
            write_document(output_path, &document)?;
            info!(path = %output_path.display(), "executed document saved");
        }

        let collected = collect_outputs(&document);
        let step_artifacts = extract_artifacts(&request.step, &task_dir);
        Ok(RunReport {
            success: collected.success(),
            step: request.step.as_str().to_string(),
            task_path,
            executed_document: request
                .output_path
                .as_ref()
                .map(|path| path.display().to_string()),
            outputs: collected.outputs,
            errors: collected.errors,
            step_artifacts,
            session_status: summary.status,
        })
    }

    fn seed_bindings(&self, context: &mut ExecutionContext, request: &ExecuteRequest, task_dir: &Path) {
        for (name, value) in &self.config.env {
            context.bind(name.clone(), value.clone());
        }
        context.bind("TASK_PATH", request.task_path.display().to_string());
        context.bind("TASK_DIR", task_dir.display().to_string());
        context.bind("SELECTED_ENDPOINT", request.step.as_str());
        context.bind("BENCH_BASE_URL", self.config.service.base_url.clone());
    }
}

/// Directory holding the task file; artifacts are looked up here.
pub fn task_dir(task_path: &Path) -> PathBuf {
    match task_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Conventional location for an executed document when the caller asks to
/// keep one without naming a path.
pub fn default_executed_path(task_path: &Path, step: &Step) -> PathBuf {
    task_dir(task_path).join(format!("{}_executed_notebook.ipynb", step.as_str()))
}
