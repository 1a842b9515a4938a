//! Test-only kernel and fixtures.
//!
//! [`ScriptedKernel`] plays back one [`ScriptedBlock`] per executed code
//! block instead of launching an interpreter, and records what it was asked
//! to run.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::document::{Block, Output, ScriptDocument};
use crate::io::document_store::write_document;
use crate::io::kernel::{ExecutionContext, Kernel, Session};

/// Scripted behavior for one code block.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBlock {
    pub outputs: Vec<Output>,
    /// Files written relative to the session's working directory.
    pub writes: Vec<(String, String)>,
    pub exports: Vec<(String, String)>,
    /// Return `Err` from `run_block` instead of running.
    pub fault: Option<String>,
}

impl ScriptedBlock {
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn prints(text: &str) -> Self {
        Self {
            outputs: vec![Output::stdout(text)],
            ..Self::default()
        }
    }

    pub fn raises(name: &str, message: &str) -> Self {
        Self {
            outputs: vec![Output::error(
                name,
                message,
                vec![format!("{name}: {message}")],
            )],
            ..Self::default()
        }
    }

    pub fn infrastructure_fault(message: &str) -> Self {
        Self {
            fault: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn writing(mut self, file: &str, contents: &str) -> Self {
        self.writes.push((file.to_string(), contents.to_string()));
        self
    }

    pub fn exporting(mut self, name: &str, value: &str) -> Self {
        self.exports.push((name.to_string(), value.to_string()));
        self
    }
}

/// What a scripted session was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenBlock {
    pub index: usize,
    pub source: String,
    pub bindings: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct ScriptState {
    queue: VecDeque<ScriptedBlock>,
    seen: Vec<SeenBlock>,
}

/// Kernel that replays scripted block results in order.
///
/// Blocks beyond the script produce no output.
#[derive(Debug, Clone)]
pub struct ScriptedKernel {
    state: Rc<RefCell<ScriptState>>,
    start_error: Option<String>,
}

impl ScriptedKernel {
    pub fn new(blocks: Vec<ScriptedBlock>) -> Self {
        Self {
            state: Rc::new(RefCell::new(ScriptState {
                queue: blocks.into(),
                seen: Vec::new(),
            })),
            start_error: None,
        }
    }

    pub fn failing_start(message: &str) -> Self {
        Self {
            start_error: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    pub fn seen(&self) -> Vec<SeenBlock> {
        self.state.borrow().seen.clone()
    }

    pub fn seen_indices(&self) -> Vec<usize> {
        self.state.borrow().seen.iter().map(|seen| seen.index).collect()
    }
}

impl Kernel for ScriptedKernel {
    type Session = ScriptedSession;

    fn start(&self, _context: &ExecutionContext) -> Result<ScriptedSession> {
        if let Some(message) = &self.start_error {
            return Err(anyhow!("{message}"));
        }
        Ok(ScriptedSession {
            state: Rc::clone(&self.state),
        })
    }
}

pub struct ScriptedSession {
    state: Rc<RefCell<ScriptState>>,
}

impl Session for ScriptedSession {
    fn run_block(
        &mut self,
        context: &mut ExecutionContext,
        index: usize,
        source: &str,
    ) -> Result<Vec<Output>> {
        let mut state = self.state.borrow_mut();
        state.seen.push(SeenBlock {
            index,
            source: source.to_string(),
            bindings: context.bindings().clone(),
        });
        let block = state.queue.pop_front().unwrap_or_default();
        drop(state);

        if let Some(message) = block.fault {
            return Err(anyhow!("{message}"));
        }
        for (file, contents) in &block.writes {
            let path = context.workdir.join(file);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        }
        for (name, value) in block.exports {
            context.bind(name, value);
        }
        Ok(block.outputs)
    }
}

/// A temporary task directory with a task file and a script document.
pub struct TaskFixture {
    temp: TempDir,
    pub task_path: PathBuf,
    pub document_path: PathBuf,
}

impl TaskFixture {
    /// Create `tasks/t1/task.json` and `notebooks/validate.ipynb` holding `blocks`.
    pub fn new(blocks: Vec<Block>) -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let task_dir = temp.path().join("tasks").join("t1");
        fs::create_dir_all(&task_dir).context("create task dir")?;
        let task_path = task_dir.join("task.json");
        fs::write(&task_path, "{\"task\": {\"id\": \"t1\"}}\n").context("write task")?;

        let document_path = temp.path().join("notebooks").join("validate.ipynb");
        write_document(&document_path, &ScriptDocument::new(blocks))?;

        Ok(Self {
            temp,
            task_path,
            document_path,
        })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn task_dir(&self) -> PathBuf {
        self.task_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root().to_path_buf())
    }

    pub fn write_task_file(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.task_dir().join(name);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Names of the entries in the task directory, sorted.
    pub fn task_dir_entries(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.task_dir()).context("read task dir")? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

/// The parameter block most documents start with.
pub fn parameter_block() -> Block {
    Block::code("import json\ntask_path = \"placeholder.json\"\nselected_endpoint = \"compute_complexity\"\n")
}
