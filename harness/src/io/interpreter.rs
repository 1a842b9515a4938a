//! Persistent interpreter session.
//!
//! One Python process runs every block of a document in a shared namespace,
//! so a variable assigned in one block is visible in the next. Blocks are
//! sent to an embedded driver script as JSON request lines on its stdin; the
//! driver answers each with one JSON line after redirecting the block's own
//! stdout and stderr into per-block capture files.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::document::Output;
use crate::io::kernel::{EXPORT_FILE_VAR, ExecutionContext, Session, parse_exports};
use crate::io::process::{read_limited, with_notice};

const DRIVER_SOURCE: &str = include_str!("../../drivers/block_driver.py");
const DRIVER_FILE: &str = "block_driver.py";
const DRIVER_LOG: &str = "driver.log";
/// Grace period for the driver to exit after its input is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const LOG_TAIL_LINES: usize = 20;

#[derive(Serialize)]
struct BlockRequest<'a> {
    index: usize,
    source_path: &'a Path,
    stdout_path: &'a Path,
    stderr_path: &'a Path,
    env: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct BlockReply {
    index: usize,
    #[serde(default)]
    error: Option<RaisedFault>,
}

#[derive(Debug, Deserialize)]
struct RaisedFault {
    ename: String,
    evalue: String,
    #[serde(default)]
    traceback: Vec<String>,
}

/// Capture files for one block, all inside the session scratch directory.
struct BlockFiles {
    source: PathBuf,
    stdout: PathBuf,
    stderr: PathBuf,
    exports: PathBuf,
}

impl BlockFiles {
    fn create(scratch: &Path, index: usize, source: &str) -> Result<Self> {
        let files = Self {
            source: scratch.join(format!("block_{index:04}.src")),
            stdout: scratch.join(format!("block_{index:04}.out")),
            stderr: scratch.join(format!("block_{index:04}.err")),
            exports: scratch.join(format!("block_{index:04}.env")),
        };
        fs::write(&files.source, source)
            .with_context(|| format!("write block source {}", files.source.display()))?;
        fs::write(&files.exports, "")
            .with_context(|| format!("create export file {}", files.exports.display()))?;
        Ok(files)
    }
}

/// A running driver process. Killed when dropped if it does not exit on its own.
pub struct InterpreterSession {
    child: Child,
    requests: Option<ChildStdin>,
    replies: Receiver<String>,
    output_limit_bytes: usize,
    scratch: TempDir,
}

impl InterpreterSession {
    /// Write the driver into `scratch` and start it under `program args...`
    /// in the context's working directory.
    pub fn spawn(
        program: &str,
        args: &[String],
        context: &ExecutionContext,
        output_limit_bytes: usize,
        scratch: TempDir,
    ) -> Result<Self> {
        let driver_path = scratch.path().join(DRIVER_FILE);
        fs::write(&driver_path, DRIVER_SOURCE)
            .with_context(|| format!("write driver {}", driver_path.display()))?;
        let log_path = scratch.path().join(DRIVER_LOG);
        let log = File::create(&log_path)
            .with_context(|| format!("create driver log {}", log_path.display()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&driver_path)
            .current_dir(&context.workdir)
            .envs(context.bindings())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log));
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn interpreter {program}"))?;

        let requests = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let (sender, replies) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if sender.send(line).is_err() {
                    break;
                }
            }
        });

        debug!(pid = child.id(), program = %program, "interpreter started");
        Ok(Self {
            child,
            requests: Some(requests),
            replies,
            output_limit_bytes,
            scratch,
        })
    }

    fn send(&mut self, index: usize, line: &str) -> Result<()> {
        let requests = self
            .requests
            .as_mut()
            .ok_or_else(|| anyhow!("interpreter input already closed"))?;
        let sent = requests
            .write_all(line.as_bytes())
            .and_then(|()| requests.flush());
        if let Err(err) = sent {
            let cause = self.exited(index);
            return Err(cause.context(format!("send block {index} to interpreter: {err}")));
        }
        Ok(())
    }

    /// Error for a driver that went away while running block `index`.
    fn exited(&mut self, index: usize) -> anyhow::Error {
        let status = match self.child.try_wait() {
            Ok(Some(status)) => status.to_string(),
            _ => "status unknown".to_string(),
        };
        let log = self.log_tail();
        if log.is_empty() {
            anyhow!("interpreter exited during block {index} ({status})")
        } else {
            anyhow!("interpreter exited during block {index} ({status}): {log}")
        }
    }

    fn log_tail(&self) -> String {
        let contents = fs::read_to_string(self.scratch.path().join(DRIVER_LOG)).unwrap_or_default();
        let lines: Vec<&str> = contents.lines().collect();
        lines[lines.len().saturating_sub(LOG_TAIL_LINES)..].join("\n")
    }

    fn read_capture(&self, path: &Path, label: &str) -> Result<String> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let (bytes, truncated) = read_limited(file, self.output_limit_bytes)?;
        if truncated > 0 {
            warn!(label, truncated, "block output truncated");
        }
        Ok(with_notice(&bytes, truncated, label))
    }

    fn kill(&mut self) {
        if let Err(err) = self.child.kill() {
            debug!(err = %err, "interpreter already gone");
        }
        let _ = self.child.wait();
    }
}

impl Session for InterpreterSession {
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

        let files = BlockFiles::create(self.scratch.path(), index, source)?;
        let mut env = context.bindings().clone();
        env.insert(
            EXPORT_FILE_VAR.to_string(),
            files.exports.display().to_string(),
        );
        let mut line = serde_json::to_string(&BlockRequest {
            index,
            source_path: &files.source,
            stdout_path: &files.stdout,
            stderr_path: &files.stderr,
            env: &env,
        })
        .context("encode block request")?;
        line.push('\n');
        self.send(index, &line)?;

        let reply = match self.replies.recv_timeout(remaining) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                warn!(ceiling_secs, "block exceeded session ceiling, killing interpreter");
                self.kill();
                bail!("execution exceeded {ceiling_secs}s ceiling during block {index}");
            }
            Err(RecvTimeoutError::Disconnected) => return Err(self.exited(index)),
        };
        let reply: BlockReply = serde_json::from_str(&reply)
            .with_context(|| format!("decode interpreter reply for block {index}"))?;
        if reply.index != index {
            bail!(
                "interpreter answered block {} while block {index} was running",
                reply.index
            );
        }

        let exports = fs::read_to_string(&files.exports)
            .with_context(|| format!("read export file {}", files.exports.display()))?;
        for (name, value) in parse_exports(&exports) {
            debug!(name = %name, "block exported binding");
            context.bind(name, value);
        }

        let mut outputs = Vec::new();
        let stdout = self.read_capture(&files.stdout, "stdout")?;
        if !stdout.is_empty() {
            outputs.push(Output::stdout(stdout));
        }
        let stderr = self.read_capture(&files.stderr, "stderr")?;
        if !stderr.is_empty() {
            outputs.push(Output::stderr(stderr));
        }
        if let Some(fault) = reply.error {
            outputs.push(Output::error(fault.ename, fault.evalue, fault.traceback));
        }
        Ok(outputs)
    }
}

impl Drop for InterpreterSession {
    fn drop(&mut self) {
        // Closing stdin ends the driver's request loop.
        drop(self.requests.take());
        match self.child.wait_timeout(SHUTDOWN_GRACE) {
            Ok(Some(status)) => debug!(%status, "interpreter exited"),
            _ => self.kill(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn session(temp: &TempDir, ceiling: Duration) -> (InterpreterSession, ExecutionContext) {
        let context = ExecutionContext::new(temp.path(), ceiling);
        let scratch = tempfile::tempdir().expect("scratch");
        let session = InterpreterSession::spawn("python3", &[], &context, 64 * 1024, scratch)
            .expect("spawn python3");
        (session, context)
    }

    fn fault(outputs: &[Output]) -> (&str, &str) {
        match outputs.iter().find(|output| output.is_error()) {
            Some(Output::Error { name, message, .. }) => (name.as_str(), message.as_str()),
            other => panic!("expected an error output, got {other:?}"),
        }
    }

    #[test]
    fn variables_carry_over_between_blocks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut session, mut context) = session(&temp, Duration::from_secs(30));

        let first = session
            .run_block(
                &mut context,
                0,
                "task_path = \"placeholder\"\nselected_endpoint = \"run_task\"\n",
            )
            .expect("block 0");
        assert!(first.is_empty());

        let second = session
            .run_block(&mut context, 1, "print(task_path, selected_endpoint)\n")
            .expect("block 1");
        assert_eq!(second, vec![Output::stdout("placeholder run_task\n")]);
    }

    #[test]
    fn raised_fault_keeps_name_and_multiline_message() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut session, mut context) = session(&temp, Duration::from_secs(30));

        session
            .run_block(&mut context, 0, "x = 41\n")
            .expect("block 0");
        let raised = session
            .run_block(&mut context, 1, "print('before')\nraise ValueError('first\\nsecond')\n")
            .expect("block 1");
        assert_eq!(raised[0], Output::stdout("before\n"));
        assert_eq!(fault(&raised), ("ValueError", "first\nsecond"));
        match &raised[1] {
            Output::Error { trace, .. } => {
                assert!(trace[0].starts_with("Traceback"));
                assert_eq!(trace.last().map(String::as_str), Some("second"));
            }
            other => panic!("expected error output, got {other:?}"),
        }

        let after = session
            .run_block(&mut context, 2, "print(x + 1)\n")
            .expect("block 2");
        assert_eq!(after, vec![Output::stdout("42\n")]);
    }

    #[test]
    fn child_process_output_and_stderr_are_captured() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut session, mut context) = session(&temp, Duration::from_secs(30));

        let outputs = session
            .run_block(
                &mut context,
                0,
                "import os, sys\nos.system('echo from-child')\nprint('warned', file=sys.stderr)\n",
            )
            .expect("block 0");
        assert_eq!(
            outputs,
            vec![Output::stdout("from-child\n"), Output::stderr("warned\n")]
        );
    }

    #[test]
    fn bindings_and_exports_reach_the_environment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut session, mut context) = session(&temp, Duration::from_secs(30));
        context.bind("SELECTED_ENDPOINT", "evaluate");

        session
            .run_block(
                &mut context,
                0,
                "import os\nwith open(os.environ['HARNESS_ENV'], 'a') as f:\n    f.write('RUN_ID=abc\\n')\n",
            )
            .expect("block 0");
        assert_eq!(context.binding("RUN_ID"), Some("abc"));

        let outputs = session
            .run_block(
                &mut context,
                1,
                "import os\nprint(os.environ['SELECTED_ENDPOINT'], os.environ['RUN_ID'])\n",
            )
            .expect("block 1");
        assert_eq!(outputs, vec![Output::stdout("evaluate abc\n")]);
    }

    #[test]
    fn blocks_cannot_read_the_request_stream() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut session, mut context) = session(&temp, Duration::from_secs(30));

        let outputs = session
            .run_block(&mut context, 0, "import sys\nprint(repr(sys.stdin.read()))\n")
            .expect("block 0");
        assert_eq!(outputs, vec![Output::stdout("''\n")]);
    }

    #[test]
    fn block_running_past_ceiling_is_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut session, mut context) = session(&temp, Duration::from_millis(500));

        let err = session
            .run_block(&mut context, 0, "import time\ntime.sleep(5)\n")
            .expect_err("should exceed ceiling");
        assert!(err.to_string().contains("ceiling"), "{err:#}");
    }

    #[test]
    fn interpreter_exit_is_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut session, mut context) = session(&temp, Duration::from_secs(30));

        let err = session
            .run_block(&mut context, 0, "import os\nos._exit(3)\n")
            .expect_err("driver is gone");
        assert!(
            format!("{err:#}").contains("interpreter exited during block 0"),
            "{err:#}"
        );
    }
}
