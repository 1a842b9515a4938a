//! Block runtime: the execution context shared by blocks and the kernels
//! that run them.
//!
//! A [`Kernel`] opens one [`Session`] per document run. The session executes
//! blocks one at a time against a mutable [`ExecutionContext`]. Tests
//! substitute a scripted kernel; production uses [`ProcessKernel`].

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use tempfile::TempDir;
use tracing::{debug, instrument};

use crate::core::document::Output;
use crate::io::config::{HarnessConfig, KernelMode};
use crate::io::interpreter::InterpreterSession;
use crate::io::process::{ProcessOutput, run_with_timeout};

/// Variable naming the file a block appends `NAME=value` lines to in order
/// to export bindings to the blocks after it.
pub const EXPORT_FILE_VAR: &str = "HARNESS_ENV";

/// State threaded through every block of one run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Directory blocks run in (the task directory).
    pub workdir: PathBuf,
    ceiling: Duration,
    deadline: Instant,
    bindings: BTreeMap<String, String>,
}

impl ExecutionContext {
    /// Start the session clock: `ceiling` bounds the whole run, not one block.
    pub fn new(workdir: impl Into<PathBuf>, ceiling: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            ceiling,
            deadline: Instant::now() + ceiling,
            bindings: BTreeMap::new(),
        }
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Time left before the ceiling, or `None` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
    }

    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.bindings.insert(name.into(), value.into());
    }

    pub fn binding(&self, name: &str) -> Option<&str> {
        self.bindings.get(name).map(String::as_str)
    }

    pub fn bindings(&self) -> &BTreeMap<String, String> {
        &self.bindings
    }
}

/// Factory for execution sessions.
///
/// `start` failing means the execution environment itself is unusable.
pub trait Kernel {
    type Session: Session;

    fn start(&self, context: &ExecutionContext) -> Result<Self::Session>;
}

/// A live session that runs blocks in order.
pub trait Session {
    /// Run one block's source.
    ///
    /// Faults raised by the block are returned as [`Output::Error`] entries.
    /// `Err` is reserved for infrastructure faults (cannot launch the block,
    /// session ceiling exceeded) and ends the run.
    fn run_block(
        &mut self,
        context: &mut ExecutionContext,
        index: usize,
        source: &str,
    ) -> Result<Vec<Output>>;
}

/// Kernel backed by an external interpreter process.
///
/// In [`KernelMode::Persistent`] one Python process serves the whole run;
/// in [`KernelMode::PerBlock`] every block is a fresh script invocation and
/// only bindings and files carry over.
#[derive(Debug, Clone)]
pub struct ProcessKernel {
    interpreter: Vec<String>,
    mode: KernelMode,
    output_limit_bytes: usize,
}

impl ProcessKernel {
    pub fn new(interpreter: Vec<String>, mode: KernelMode, output_limit_bytes: usize) -> Self {
        Self {
            interpreter,
            mode,
            output_limit_bytes,
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(
            config.interpreter.clone(),
            config.kernel,
            config.output_limit_bytes,
        )
    }
}

impl Kernel for ProcessKernel {
    type Session = ProcessSession;

    fn start(&self, context: &ExecutionContext) -> Result<ProcessSession> {
        let Some((program, args)) = self.interpreter.split_first() else {
            bail!("no interpreter configured");
        };
        if !context.workdir.is_dir() {
            bail!(
                "working directory {} is not a directory",
                context.workdir.display()
            );
        }
        let scratch = tempfile::Builder::new()
            .prefix("harness-session-")
            .tempdir()
            .context("create session scratch directory")?;
        debug!(
            scratch = %scratch.path().display(),
            program = %program,
            mode = ?self.mode,
            "session started"
        );
        Ok(match self.mode {
            KernelMode::Persistent => ProcessSession::Persistent(InterpreterSession::spawn(
                program,
                args,
                context,
                self.output_limit_bytes,
                scratch,
            )?),
            KernelMode::PerBlock => ProcessSession::PerBlock(ScriptSession {
                program: program.clone(),
                args: args.to_vec(),
                output_limit_bytes: self.output_limit_bytes,
                scratch,
            }),
        })
    }
}

pub enum ProcessSession {
    Persistent(InterpreterSession),
    PerBlock(ScriptSession),
}

impl Session for ProcessSession {
    fn run_block(
        &mut self,
        context: &mut ExecutionContext,
        index: usize,
        source: &str,
    ) -> Result<Vec<Output>> {
        match self {
            ProcessSession::Persistent(session) => session.run_block(context, index, source),
            ProcessSession::PerBlock(session) => session.run_block(context, index, source),
        }
    }
}

/// One run's worth of scratch space for block scripts and export files.
/// Removed when the session is dropped.
pub struct ScriptSession {
    program: String,
    args: Vec<String>,
    output_limit_bytes: usize,
    scratch: TempDir,
}

impl Session for ScriptSession {
    #[instrument(skip_all, fields(index = index))]
    fn run_block(
        &mut self,
        context: &mut ExecutionContext,
        index: usize,
        source: &str,
    ) -> Result<Vec<Output>> {
        let ceiling_secs = context.ceiling().as_secs();
        let remaining = context.remaining().ok_or_else(|| {
            anyhow!("execution exceeded {ceiling_secs}s ceiling before block {index}")
        })?;

        let script_path = self.scratch.path().join(format!("block_{index:04}.src"));
        fs::write(&script_path, source)
            .with_context(|| format!("write block script {}", script_path.display()))?;
        let export_path = self.scratch.path().join(format!("block_{index:04}.env"));
        fs::write(&export_path, "")
            .with_context(|| format!("create export file {}", export_path.display()))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&script_path)
            .current_dir(&context.workdir)
            .envs(context.bindings())
            .env(EXPORT_FILE_VAR, &export_path);

        let output = run_with_timeout(cmd, remaining, self.output_limit_bytes)
            .with_context(|| format!("run block {index}"))?;
        if output.timed_out {
            bail!("execution exceeded {ceiling_secs}s ceiling during block {index}");
        }

        let exports = fs::read_to_string(&export_path)
            .with_context(|| format!("read export file {}", export_path.display()))?;
        for (name, value) in parse_exports(&exports) {
            debug!(name = %name, "block exported binding");
            context.bind(name, value);
        }

        Ok(block_outputs(&output))
    }
}

fn block_outputs(output: &ProcessOutput) -> Vec<Output> {
    let mut outputs = Vec::new();
    let stdout = output.stdout_text();
    if !stdout.is_empty() {
        outputs.push(Output::stdout(stdout));
    }
    let stderr = output.stderr_text();
    if output.succeeded() {
        if !stderr.is_empty() {
            outputs.push(Output::stderr(stderr));
        }
    } else {
        outputs.push(classify_failure(output.status.code(), &stderr));
    }
    outputs
}

/// Turn a failed block's exit into an error output.
///
/// The fault is the `SomeError: message` header that follows the last
/// `Traceback` frame list, or failing that the last such line in stderr.
/// Lines after the header belong to the message. Without a header the exit
/// status is reported.
pub fn classify_failure(exit_code: Option<i32>, stderr: &str) -> Output {
    static FAULT_LINE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_.]*(?:Error|Exception|Exit|Interrupt))(?::\s?(.*))?$")
            .unwrap()
    });

    let trace: Vec<String> = stderr.lines().map(str::to_string).collect();
    let is_header = |line: &&str| {
        !line.starts_with(char::is_whitespace) && FAULT_LINE.is_match(line.trim_end())
    };
    let lines: Vec<&str> = stderr.lines().collect();
    let header = match lines.iter().rposition(|line| line.starts_with("Traceback ")) {
        Some(traceback) => lines[traceback + 1..]
            .iter()
            .position(is_header)
            .map(|offset| traceback + 1 + offset),
        None => lines.iter().rposition(is_header),
    };

    if let Some(at) = header
        && let Some(caps) = FAULT_LINE.captures(lines[at].trim_end())
    {
        let mut message = caps.get(2).map(|m| m.as_str()).unwrap_or_default().to_string();
        let rest = &lines[at + 1..];
        let rest_len = rest
            .iter()
            .rposition(|line| !line.trim().is_empty())
            .map_or(0, |last| last + 1);
        for line in &rest[..rest_len] {
            message.push('\n');
            message.push_str(line);
        }
        return Output::error(&caps[1], message, trace);
    }

    let message = match exit_code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    };
    Output::error("BlockFailed", message, trace)
}

/// Parse `NAME=value` lines from a block's export file.
///
/// Blank lines, `#` comments and lines without a valid name are skipped.
pub fn parse_exports(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(name, value)| (name.trim(), value))
        .filter(|(name, _)| is_variable_name(name))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_style_fault_line_is_parsed() {
        let stderr = "Traceback (most recent call last):\n  File \"block\", line 2, in <module>\nValueError: bad input\n";
        let output = classify_failure(Some(1), stderr);
        match output {
            Output::Error {
                name,
                message,
                trace,
            } => {
                assert_eq!(name, "ValueError");
                assert_eq!(message, "bad input");
                assert_eq!(trace.len(), 3);
            }
            other => panic!("expected error output, got {other:?}"),
        }
    }

    #[test]
    fn qualified_fault_without_message() {
        let output = classify_failure(Some(1), "requests.exceptions.ConnectionError\n\n");
        assert_eq!(
            output,
            Output::error(
                "requests.exceptions.ConnectionError",
                "",
                vec!["requests.exceptions.ConnectionError".to_string(), String::new()],
            )
        );
    }

    #[test]
    fn multiline_fault_message_is_kept_whole() {
        let stderr = "Traceback (most recent call last):\n  File \"block\", line 1, in <module>\nValueError: first\nsecond\n";
        match classify_failure(Some(1), stderr) {
            Output::Error { name, message, .. } => {
                assert_eq!(name, "ValueError");
                assert_eq!(message, "first\nsecond");
            }
            other => panic!("expected error output, got {other:?}"),
        }
    }

    #[test]
    fn chained_traceback_reports_the_last_fault() {
        let stderr = "Traceback (most recent call last):\n  File \"a\", line 1\nKeyError: 'x'\n\nDuring handling of the above exception, another exception occurred:\n\nTraceback (most recent call last):\n  File \"a\", line 3\nRuntimeError: lookup failed\n";
        match classify_failure(Some(1), stderr) {
            Output::Error { name, message, .. } => {
                assert_eq!(name, "RuntimeError");
                assert_eq!(message, "lookup failed");
            }
            other => panic!("expected error output, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_stderr_reports_exit_status() {
        let output = classify_failure(Some(127), "sh: foo: not found\n");
        assert_eq!(
            output,
            Output::error(
                "BlockFailed",
                "exit status 127",
                vec!["sh: foo: not found".to_string()],
            )
        );
    }

    #[test]
    fn exports_skip_comments_and_invalid_names() {
        let parsed = parse_exports("# note\nTOKEN=abc=def\r\n\n1BAD=x\nno_equals\n SPACED =v\n");
        assert_eq!(
            parsed,
            vec![
                ("TOKEN".to_string(), "abc=def".to_string()),
                ("SPACED".to_string(), "v".to_string()),
            ]
        );
    }

    #[test]
    fn context_tracks_bindings_and_deadline() {
        let mut context = ExecutionContext::new("/tmp", Duration::from_secs(60));
        context.bind("A", "1");
        context.bind("A", "2");
        assert_eq!(context.binding("A"), Some("2"));
        assert!(context.remaining().is_some());

        let expired = ExecutionContext::new("/tmp", Duration::ZERO);
        assert!(expired.remaining().is_none());
    }

    #[test]
    fn start_rejects_missing_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let kernel = ProcessKernel::new(vec!["sh".to_string()], KernelMode::PerBlock, 1024);
        let context = ExecutionContext::new(temp.path().join("missing"), Duration::from_secs(5));
        let err = kernel.start(&context).err().expect("start should fail");
        assert!(err.to_string().contains("is not a directory"));
    }

    #[cfg(unix)]
    #[test]
    fn sh_blocks_share_exported_bindings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let kernel = ProcessKernel::new(vec!["sh".to_string()], KernelMode::PerBlock, 4096);
        let mut context = ExecutionContext::new(temp.path(), Duration::from_secs(30));
        context.bind("GREETING", "hello");
        let mut session = kernel.start(&context).expect("start");

        let first = session
            .run_block(
                &mut context,
                0,
                "echo \"$GREETING\"\necho COUNT=3 >> \"$HARNESS_ENV\"\n",
            )
            .expect("block 0");
        assert_eq!(first, vec![Output::stdout("hello\n")]);
        assert_eq!(context.binding("COUNT"), Some("3"));

        let second = session
            .run_block(&mut context, 1, "echo \"count=$COUNT\" > out.txt\necho done\n")
            .expect("block 1");
        assert_eq!(second, vec![Output::stdout("done\n")]);
        assert_eq!(
            fs::read_to_string(temp.path().join("out.txt")).expect("read"),
            "count=3\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn failing_sh_block_yields_error_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let kernel = ProcessKernel::new(vec!["sh".to_string()], KernelMode::PerBlock, 4096);
        let mut context = ExecutionContext::new(temp.path(), Duration::from_secs(30));
        let mut session = kernel.start(&context).expect("start");

        let outputs = session
            .run_block(
                &mut context,
                0,
                "echo partial\necho 'ValueError: bad input' >&2\nexit 1\n",
            )
            .expect("block runs");
        assert_eq!(
            outputs,
            vec![
                Output::stdout("partial\n"),
                Output::error(
                    "ValueError",
                    "bad input",
                    vec!["ValueError: bad input".to_string()]
                ),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn block_running_past_ceiling_is_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let kernel = ProcessKernel::new(vec!["sh".to_string()], KernelMode::PerBlock, 1024);
        let mut context = ExecutionContext::new(temp.path(), Duration::from_millis(200));
        let mut session = kernel.start(&context).expect("start");
        let err = session
            .run_block(&mut context, 0, "sleep 2\n")
            .expect_err("should exceed ceiling");
        assert!(err.to_string().contains("ceiling"));
    }

    #[test]
    fn missing_interpreter_fails_at_first_block() {
        let temp = tempfile::tempdir().expect("tempdir");
        let kernel = ProcessKernel::new(
            vec!["definitely-not-a-real-interpreter-xyz".to_string()],
            KernelMode::PerBlock,
            64,
        );
        let mut context = ExecutionContext::new(temp.path(), Duration::from_secs(5));
        let mut session = kernel.start(&context).expect("start");
        let err = session
            .run_block(&mut context, 0, "print(1)")
            .expect_err("spawn should fail");
        assert!(format!("{err:#}").contains("run block 0"));
    }

    #[test]
    fn persistent_kernel_fails_to_start_without_interpreter() {
        let temp = tempfile::tempdir().expect("tempdir");
        let kernel = ProcessKernel::new(
            vec!["definitely-not-a-real-interpreter-xyz".to_string()],
            KernelMode::Persistent,
            64,
        );
        let context = ExecutionContext::new(temp.path(), Duration::from_secs(5));
        let err = kernel.start(&context).err().expect("start should fail");
        assert!(format!("{err:#}").contains("spawn interpreter"), "{err:#}");
    }

    #[cfg(unix)]
    #[test]
    fn persistent_kernel_shares_variables() {
        let temp = tempfile::tempdir().expect("tempdir");
        let kernel = ProcessKernel::new(vec!["python3".to_string()], KernelMode::Persistent, 4096);
        let mut context = ExecutionContext::new(temp.path(), Duration::from_secs(30));
        let mut session = kernel.start(&context).expect("start");

        session
            .run_block(&mut context, 0, "count = 3\n")
            .expect("block 0");
        let outputs = session
            .run_block(&mut context, 1, "print(count * 2)\n")
            .expect("block 1");
        assert_eq!(outputs, vec![Output::stdout("6\n")]);
    }
}
