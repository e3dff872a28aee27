//! In-memory stand-ins used by tests across the workspace

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Result;
use crate::exec::{CommandOutput, CommandRequest, Executor};

struct Response {
    prefix: String,
    output: CommandOutput,
    remaining: Option<usize>,
}

/// Executor that records every request and answers from a script
///
/// Responses are matched by command-line prefix; the most recently added
/// matching response wins. Unmatched commands succeed with no output.
#[derive(Default)]
pub struct ScriptedExecutor {
    requests: Mutex<Vec<CommandRequest>>,
    responses: Mutex<Vec<Response>>,
    files: Mutex<BTreeMap<PathBuf, String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with these stdout lines
    pub fn respond(&self, prefix: &str, stdout: &[&str]) -> &Self {
        self.push(prefix, CommandOutput::lines(stdout), None)
    }

    /// Like [`respond`](Self::respond) but only for the next `times` matches
    pub fn respond_times(&self, prefix: &str, times: usize, stdout: &[&str]) -> &Self {
        self.push(prefix, CommandOutput::lines(stdout), Some(times))
    }

    fn push(&self, prefix: &str, output: CommandOutput, remaining: Option<usize>) -> &Self {
        self.responses.lock().push(Response {
            prefix: prefix.to_string(),
            output,
            remaining,
        });
        self
    }

    /// Make commands starting with `prefix` exit with `code`
    pub fn fail(&self, prefix: &str, code: i32, stderr: &str) -> &Self {
        self.push(
            prefix,
            CommandOutput {
                code,
                stdout: Vec::new(),
                stderr: vec![stderr.to_string()],
            },
            None,
        )
    }

    /// Every command line run so far
    pub fn calls(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|r| r.command_line())
            .collect()
    }

    /// Every request run so far
    pub fn requests(&self) -> Vec<CommandRequest> {
        self.requests.lock().clone()
    }

    /// Number of recorded command lines starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Current contents of an in-memory file
    pub fn file(&self, path: &Path) -> Option<String> {
        self.files.lock().get(path).cloned()
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, request: &CommandRequest) -> Result<CommandOutput> {
        self.requests.lock().push(request.clone());
        let line = request.command_line();
        let mut responses = self.responses.lock();
        let hit = responses.iter_mut().rev().find(|r| {
            r.remaining != Some(0) && line.starts_with(r.prefix.as_str())
        });
        Ok(match hit {
            Some(r) => {
                if let Some(n) = r.remaining.as_mut() {
                    *n -= 1;
                }
                r.output.clone()
            }
            None => CommandOutput::default(),
        })
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.files.lock().get(path).cloned())
    }

    fn write_file(&self, path: &Path, contents: &str, _mode: Option<u32>) -> Result<()> {
        self.files
            .lock()
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.files.lock().remove(path);
        Ok(())
    }
}
