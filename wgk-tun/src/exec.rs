//! Command execution, optionally across a privilege boundary
//!
//! Everything that touches the OS goes through an [`Executor`]. A command is a
//! plain [`CommandRequest`] value (program, arguments, environment and optional
//! standard input) and the answer is a [`CommandOutput`] (exit code and captured
//! lines). Because both sides are plain serializable data, the same request can
//! be run in-process by [`LocalExecutor`] or shipped to an elevated helper by
//! [`crate::elevate::ElevatedClient`].
//!
//! [`SystemCommands`] is the front end the rest of the workspace uses. It keeps
//! two executors (the caller's own and the elevated one) and a couple of
//! switches: `privileged()` routes the next calls to the elevated executor and
//! `logged()` raises the log level used for them.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single external command to run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Program name or path
    pub program: String,
    /// Arguments, not including the program
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Text written to the command's standard input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

impl CommandRequest {
    /// Create a request for a program with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Build a request from a full argument vector, program first
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| Error::Config("empty command line".into()))?;
        Ok(Self::new(program.as_ref()).args(rest))
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    /// Set one environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Merge a set of environment variables; existing keys are kept
    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        for (k, v) in env {
            self.env.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }

    /// Feed `input` to the command's standard input
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Human readable command line, used in logs and errors
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for CommandRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command_line())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (`-1` when killed by a signal)
    pub code: i32,
    /// Standard output, one entry per line
    #[serde(default)]
    pub stdout: Vec<String>,
    /// Standard error, one entry per line
    #[serde(default)]
    pub stderr: Vec<String>,
}

impl CommandOutput {
    /// Successful output with the given lines
    pub fn lines<S: AsRef<str>>(stdout: &[S]) -> Self {
        Self {
            code: 0,
            stdout: stdout.iter().map(|s| s.as_ref().to_string()).collect(),
            stderr: Vec::new(),
        }
    }

    /// Whether the command exited with status zero
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Turn a non-zero exit into [`Error::CommandFailed`]
    pub fn into_result(self, request: &CommandRequest) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(Error::CommandFailed {
            command: request.command_line(),
            code: self.code,
            message: self.failure_message(),
        })
    }

    fn failure_message(&self) -> String {
        let pick = |lines: &[String]| {
            lines
                .iter()
                .map(|l| l.trim())
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join("; ")
        };
        let msg = pick(&self.stderr);
        if msg.is_empty() {
            pick(&self.stdout)
        } else {
            msg
        }
    }
}

/// Something that can run commands and touch files on our behalf
pub trait Executor: Send + Sync {
    /// Run a command to completion and capture its output
    fn execute(&self, request: &CommandRequest) -> Result<CommandOutput>;

    /// Read a text file, `None` if it does not exist
    fn read_file(&self, path: &Path) -> Result<Option<String>>;

    /// Replace a text file, optionally setting Unix permission bits
    fn write_file(&self, path: &Path, contents: &str, mode: Option<u32>) -> Result<()>;

    /// Remove a file; a missing file is not an error
    fn remove_file(&self, path: &Path) -> Result<()>;
}

/// Runs commands in the current process with the current privileges
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(|l| l.to_string())
        .collect()
}

impl Executor for LocalExecutor {
    fn execute(&self, request: &CommandRequest) -> Result<CommandOutput> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .envs(&request.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ProgramNotFound(request.program.clone())
            } else {
                Error::Io(e)
            }
        })?;

        if let Some(ref input) = request.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes())?;
            }
        }

        let output = child.wait_with_output()?;
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: split_lines(&output.stdout),
            stderr: split_lines(&output.stderr),
        })
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>> {
        match std::fs::read_to_string(path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_file(&self, path: &Path, contents: &str, mode: Option<u32>) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Write next to the target then rename, so readers never see half a file
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(contents.as_bytes())?;

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Front end for running system commands
///
/// Cheap to clone; the switch methods return adjusted copies.
#[derive(Clone)]
pub struct SystemCommands {
    user: Arc<dyn Executor>,
    elevated: Arc<dyn Executor>,
    env: BTreeMap<String, String>,
    privileged: bool,
    logged: bool,
}

impl std::fmt::Debug for SystemCommands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemCommands")
            .field("env", &self.env)
            .field("privileged", &self.privileged)
            .field("logged", &self.logged)
            .finish()
    }
}

impl SystemCommands {
    /// Use one executor for both normal and privileged calls
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            user: executor.clone(),
            elevated: executor,
            env: BTreeMap::new(),
            privileged: false,
            logged: false,
        }
    }

    /// Everything runs in this process
    pub fn local() -> Self {
        Self::new(Arc::new(LocalExecutor))
    }

    /// Send privileged calls to a different executor (usually an elevated helper)
    pub fn with_elevated(mut self, elevated: Arc<dyn Executor>) -> Self {
        self.elevated = elevated;
        self
    }

    /// Copy of this runner whose calls cross the privilege boundary
    pub fn privileged(&self) -> Self {
        Self {
            privileged: true,
            ..self.clone()
        }
    }

    /// Copy of this runner that logs its commands at info level
    pub fn logged(&self) -> Self {
        Self {
            logged: true,
            ..self.clone()
        }
    }

    /// Copy of this runner that adds `env` to every command
    pub fn with_env(&self, env: BTreeMap<String, String>) -> Self {
        let mut merged = self.env.clone();
        merged.extend(env);
        Self {
            env: merged,
            ..self.clone()
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn executor(&self) -> &dyn Executor {
        if self.privileged {
            self.elevated.as_ref()
        } else {
            self.user.as_ref()
        }
    }

    /// Run a prepared request, returning its output whatever the exit code
    pub fn execute(&self, request: CommandRequest) -> Result<CommandOutput> {
        let request = request.envs(&self.env);
        if self.logged {
            log::info!(
                "Running{} `{}`",
                if self.privileged { " (privileged)" } else { "" },
                request
            );
        } else {
            log::debug!("Running `{}`", request);
        }
        let output = self.executor().execute(&request)?;
        if !output.success() {
            log::debug!("`{}` exited with {}", request, output.code);
        }
        Ok(output)
    }

    /// Run and fail on a non-zero exit
    pub fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<()> {
        let request = CommandRequest::from_args(args)?;
        self.execute(request.clone())?.into_result(&request)?;
        Ok(())
    }

    /// Run and return the exit code; a non-zero exit is not an error
    pub fn result<S: AsRef<str>>(&self, args: &[S]) -> Result<i32> {
        let request = CommandRequest::from_args(args)?;
        Ok(self.execute(request)?.code)
    }

    /// Run and return standard output lines, failing on a non-zero exit
    pub fn output<S: AsRef<str>>(&self, args: &[S]) -> Result<Vec<String>> {
        let request = CommandRequest::from_args(args)?;
        Ok(self.execute(request.clone())?.into_result(&request)?.stdout)
    }

    /// Like [`output`](Self::output) but any failure yields no lines
    pub fn silent_output<S: AsRef<str>>(&self, args: &[S]) -> Vec<String> {
        match self.output(args) {
            Ok(lines) => lines,
            Err(e) => {
                log::debug!("Ignoring command failure: {}", e);
                Vec::new()
            }
        }
    }

    /// Run with `input` on standard input, failing on a non-zero exit
    pub fn pipe_to<S: AsRef<str>>(&self, input: &str, args: &[S]) -> Result<()> {
        let request = CommandRequest::from_args(args)?.stdin(input);
        self.execute(request.clone())?.into_result(&request)?;
        Ok(())
    }

    /// Run and hand every output line to `consumer`, returning the exit code
    pub fn consume<S, F>(&self, args: &[S], mut consumer: F) -> Result<i32>
    where
        S: AsRef<str>,
        F: FnMut(&str),
    {
        let request = CommandRequest::from_args(args)?;
        let output = self.execute(request)?;
        for line in output.stdout.iter().chain(output.stderr.iter()) {
            consumer(line);
        }
        Ok(output.code)
    }

    /// Whether a program can be found on the search path
    pub fn command_exists(&self, program: &str) -> bool {
        #[cfg(windows)]
        let probe = CommandRequest::new("where").arg(program);
        #[cfg(not(windows))]
        let probe = CommandRequest::new("sh")
            .arg("-c")
            .arg(format!("command -v {}", program));

        matches!(self.user.execute(&probe), Ok(o) if o.success())
    }

    /// Read a file through the current executor
    pub fn read_file(&self, path: &Path) -> Result<Option<String>> {
        self.executor().read_file(path)
    }

    /// Write a file through the current executor
    pub fn write_file(&self, path: &Path, contents: &str, mode: Option<u32>) -> Result<()> {
        if self.logged {
            log::info!("Writing {}", path.display());
        }
        self.executor().write_file(path, contents, mode)
    }

    /// Remove a file through the current executor
    pub fn remove_file(&self, path: &Path) -> Result<()> {
        self.executor().remove_file(path)
    }
}
