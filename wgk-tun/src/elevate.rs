//! Elevated helper channel
//!
//! A small privileged helper process owns a Unix domain socket (a named pipe
//! on Windows) and executes [`ElevatedRequest`]s on behalf of an unprivileged
//! caller. Messages are line-delimited JSON. Only plain data crosses the
//! boundary: a request carries the command, arguments, environment and input,
//! and the response carries the captured output or a typed failure.
//!
//! The client side ([`ElevatedClient`]) is blocking and keeps one persistent
//! session. Calls from several threads are serialized on that session, so at
//! most one request is ever in flight.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader as AsyncBufReader};

use crate::error::{Error, Result};
use crate::exec::{CommandOutput, CommandRequest, Executor};

/// Default helper socket path
#[cfg(unix)]
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/wgkeeper.sock";

#[cfg(windows)]
pub const DEFAULT_SOCKET_PATH: &str = r"\\.\pipe\wgkeeper";

/// Unit of work sent to the helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ElevatedRequest {
    /// Run a command and capture its output
    #[serde(rename = "execute")]
    Execute(CommandRequest),

    /// Read a text file
    #[serde(rename = "read_file")]
    ReadFile { path: PathBuf },

    /// Replace a text file
    #[serde(rename = "write_file")]
    WriteFile {
        path: PathBuf,
        contents: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },

    /// Remove a file
    #[serde(rename = "remove_file")]
    RemoveFile { path: PathBuf },

    /// Liveness check
    #[serde(rename = "ping")]
    Ping,
}

/// Helper's answer to a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ElevatedResponse {
    /// Output of an executed command (any exit code)
    #[serde(rename = "output")]
    Output(CommandOutput),

    /// Contents of a read file
    #[serde(rename = "file")]
    File { contents: Option<String> },

    /// Success acknowledgment
    #[serde(rename = "ok")]
    Ok,

    /// The request could not be carried out
    #[serde(rename = "error")]
    Error { kind: FailureKind, message: String },
}

/// Category of a helper-side failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    ProgramNotFound,
    PermissionDenied,
    Io,
    Other,
}

impl ElevatedResponse {
    fn from_error(e: &Error) -> Self {
        let kind = match e {
            Error::Io(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                FailureKind::PermissionDenied
            }
            Error::ProgramNotFound(_) => FailureKind::ProgramNotFound,
            _ if e.is_not_found() => FailureKind::NotFound,
            Error::Io(_) => FailureKind::Io,
            _ => FailureKind::Other,
        };
        let message = match e {
            Error::ProgramNotFound(program) => program.clone(),
            _ => e.to_string(),
        };
        ElevatedResponse::Error { kind, message }
    }

    fn into_error(kind: FailureKind, message: String) -> Error {
        match kind {
            FailureKind::NotFound => Error::DeviceNotFound(message),
            FailureKind::ProgramNotFound => Error::ProgramNotFound(message),
            FailureKind::PermissionDenied => Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                message,
            )),
            FailureKind::Io => Error::Io(std::io::Error::other(message)),
            FailureKind::Other => Error::Elevation(message),
        }
    }
}

/// Carry out one request with `executor`
pub fn handle_request(executor: &dyn Executor, request: ElevatedRequest) -> ElevatedResponse {
    let result = match request {
        ElevatedRequest::Execute(cmd) => executor.execute(&cmd).map(ElevatedResponse::Output),
        ElevatedRequest::ReadFile { path } => executor
            .read_file(&path)
            .map(|contents| ElevatedResponse::File { contents }),
        ElevatedRequest::WriteFile {
            path,
            contents,
            mode,
        } => executor
            .write_file(&path, &contents, mode)
            .map(|_| ElevatedResponse::Ok),
        ElevatedRequest::RemoveFile { path } => {
            executor.remove_file(&path).map(|_| ElevatedResponse::Ok)
        }
        ElevatedRequest::Ping => Ok(ElevatedResponse::Ok),
    };
    result.unwrap_or_else(|e| {
        log::warn!("Elevated request failed: {}", e);
        ElevatedResponse::from_error(&e)
    })
}

/// Socket permissions when none are given: the owner (root) only
pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

/// Group id for a group name or number
#[cfg(unix)]
pub fn group_id(group: &str) -> Result<u32> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }
    let name = std::ffi::CString::new(group)
        .map_err(|_| Error::Config(format!("invalid group name {:?}", group)))?;
    // SAFETY: getgrnam returns null or a pointer to a static entry, read before any other lookup
    let entry = unsafe { libc::getgrnam(name.as_ptr()) };
    if entry.is_null() {
        return Err(Error::Config(format!("no such group: {}", group)));
    }
    Ok(unsafe { (*entry).gr_gid })
}

/// Privileged side of the channel
pub struct ElevatedServer {
    socket_path: PathBuf,
    executor: Arc<dyn Executor>,
    #[cfg_attr(windows, allow(dead_code))]
    mode: u32,
    #[cfg_attr(windows, allow(dead_code))]
    group: Option<u32>,
}

impl ElevatedServer {
    /// Create a server that runs requests with `executor`
    pub fn new(socket_path: impl AsRef<Path>, executor: Arc<dyn Executor>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            executor,
            mode: DEFAULT_SOCKET_MODE,
            group: None,
        }
    }

    /// Permission bits applied to the socket file (Unix only)
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Group owning the socket file (Unix only)
    pub fn with_group(mut self, gid: u32) -> Self {
        self.group = Some(gid);
        self
    }

    /// Bind the socket and give it the configured mode and group
    #[cfg(unix)]
    fn listen(&self) -> Result<tokio::net::UnixListener> {
        use std::os::unix::fs::PermissionsExt;

        // A socket left behind by an earlier run
        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = tokio::net::UnixListener::bind(&self.socket_path).map_err(|e| {
            Error::Elevation(format!(
                "failed to bind helper socket {:?}: {}",
                self.socket_path, e
            ))
        })?;

        if let Some(gid) = self.group {
            std::os::unix::fs::chown(&self.socket_path, None, Some(gid)).map_err(|e| {
                Error::Elevation(format!(
                    "failed to give {:?} to group {}: {}",
                    self.socket_path, gid, e
                ))
            })?;
        }
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(self.mode))
            .map_err(|e| {
                Error::Elevation(format!(
                    "failed to set mode {:o} on {:?}: {}",
                    self.mode, self.socket_path, e
                ))
            })?;
        Ok(listener)
    }

    /// Accept connections until the task is dropped
    #[cfg(unix)]
    pub async fn run(&self) -> Result<()> {
        let listener = self.listen()?;
        log::info!(
            "Elevated helper listening on {:?} (mode {:o})",
            self.socket_path,
            self.mode
        );

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let executor = self.executor.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, executor).await {
                            log::debug!("Helper connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("Helper socket accept error: {}", e);
                }
            }
        }
    }

    /// Accept connections until the task is dropped
    #[cfg(windows)]
    pub async fn run(&self) -> Result<()> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let pipe_name = self.socket_path.to_string_lossy().to_string();
        log::info!("Elevated helper listening on {}", pipe_name);

        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&pipe_name)
            .map_err(|e| Error::Elevation(format!("failed to create named pipe: {}", e)))?;

        loop {
            if let Err(e) = server.connect().await {
                log::warn!("Failed to accept pipe connection: {}", e);
                continue;
            }

            let next = match ServerOptions::new().create(&pipe_name) {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("Failed to create next pipe instance: {}", e);
                    continue;
                }
            };
            let connected = std::mem::replace(&mut server, next);
            let executor = self.executor.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(connected, executor).await {
                    log::debug!("Helper connection error: {}", e);
                }
            });
        }
    }

    #[cfg(unix)]
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }

    #[cfg(windows)]
    pub fn cleanup(&self) {}
}

impl Drop for ElevatedServer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

async fn serve_connection<S>(stream: S, executor: Arc<dyn Executor>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = AsyncBufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| Error::Elevation(format!("failed to read request: {}", e)))?;
        if n == 0 {
            return Ok(());
        }

        let response = match serde_json::from_str::<ElevatedRequest>(line.trim()) {
            Ok(request) => {
                let executor = executor.clone();
                tokio::task::spawn_blocking(move || handle_request(executor.as_ref(), request))
                    .await
                    .unwrap_or_else(|e| ElevatedResponse::Error {
                        kind: FailureKind::Other,
                        message: format!("request task failed: {}", e),
                    })
            }
            Err(e) => ElevatedResponse::Error {
                kind: FailureKind::Other,
                message: format!("invalid request: {}", e),
            },
        };

        let mut json = serde_json::to_string(&response)
            .map_err(|e| Error::Elevation(format!("failed to serialize response: {}", e)))?;
        json.push('\n');
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| Error::Elevation(format!("failed to write response: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Elevation(format!("failed to flush: {}", e)))?;
    }
}

#[cfg(unix)]
type Stream = std::os::unix::net::UnixStream;

#[cfg(windows)]
type Stream = std::fs::File;

struct Session {
    reader: BufReader<Stream>,
    writer: Stream,
}

impl Session {
    fn exchange(&mut self, request: &ElevatedRequest) -> Result<ElevatedResponse> {
        let mut json = serde_json::to_string(request)
            .map_err(|e| Error::Elevation(format!("failed to serialize request: {}", e)))?;
        json.push('\n');
        self.writer
            .write_all(json.as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(|e| Error::Elevation(format!("failed to send request: {}", e)))?;

        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| Error::Elevation(format!("failed to read response: {}", e)))?;
        if n == 0 {
            return Err(Error::Elevation("helper closed the connection".into()));
        }
        serde_json::from_str(line.trim())
            .map_err(|e| Error::Elevation(format!("invalid response: {}", e)))
    }
}

/// Unprivileged side of the channel
pub struct ElevatedClient {
    socket_path: PathBuf,
    session: Mutex<Option<Session>>,
}

impl ElevatedClient {
    /// Create a client; nothing is connected until the first call
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            session: Mutex::new(None),
        }
    }

    fn connect(&self) -> Result<Session> {
        #[cfg(unix)]
        let stream = Stream::connect(&self.socket_path);
        #[cfg(windows)]
        let stream = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.socket_path);

        let stream = stream.map_err(|e| {
            Error::Elevation(format!(
                "failed to connect to helper at {:?}: {}. Is the helper running?",
                self.socket_path, e
            ))
        })?;
        let reader = stream
            .try_clone()
            .map_err(|e| Error::Elevation(format!("failed to clone helper stream: {}", e)))?;
        Ok(Session {
            reader: BufReader::new(reader),
            writer: stream,
        })
    }

    /// Send one request; a broken session is dropped and reopened next time
    pub fn call(&self, request: &ElevatedRequest) -> Result<ElevatedResponse> {
        let mut guard = self.session.lock();
        let mut session = match guard.take() {
            Some(s) => s,
            None => self.connect()?,
        };
        let response = session.exchange(request)?;
        *guard = Some(session);
        Ok(response)
    }

    /// Check that the helper answers
    pub fn ping(&self) -> Result<()> {
        match self.call(&ElevatedRequest::Ping)? {
            ElevatedResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: ElevatedResponse) -> Error {
    match response {
        ElevatedResponse::Error { kind, message } => ElevatedResponse::into_error(kind, message),
        other => Error::Elevation(format!("unexpected response: {:?}", other)),
    }
}

impl Executor for ElevatedClient {
    fn execute(&self, request: &CommandRequest) -> Result<CommandOutput> {
        match self.call(&ElevatedRequest::Execute(request.clone()))? {
            ElevatedResponse::Output(output) => Ok(output),
            other => Err(unexpected(other)),
        }
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>> {
        match self.call(&ElevatedRequest::ReadFile {
            path: path.to_path_buf(),
        })? {
            ElevatedResponse::File { contents } => Ok(contents),
            other => Err(unexpected(other)),
        }
    }

    fn write_file(&self, path: &Path, contents: &str, mode: Option<u32>) -> Result<()> {
        match self.call(&ElevatedRequest::WriteFile {
            path: path.to_path_buf(),
            contents: contents.to_string(),
            mode,
        })? {
            ElevatedResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match self.call(&ElevatedRequest::RemoveFile {
            path: path.to_path_buf(),
        })? {
            ElevatedResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedExecutor;

    #[test]
    fn test_request_wire_shape() {
        let req = ElevatedRequest::Execute(CommandRequest::new("wg").args(["show", "wg0"]));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "execute");
        assert_eq!(json["program"], "wg");
        assert_eq!(json["args"][1], "wg0");
        assert!(json.get("stdin").is_none());

        let back: ElevatedRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_handle_request_reports_command_exit_not_error() {
        let exec = ScriptedExecutor::new();
        exec.fail("ip link add", 2, "RTNETLINK answers: File exists");

        let resp = handle_request(
            &exec,
            ElevatedRequest::Execute(CommandRequest::new("ip").args(["link", "add", "wg0"])),
        );
        match resp {
            ElevatedResponse::Output(out) => {
                assert_eq!(out.code, 2);
                assert_eq!(out.stderr, vec!["RTNETLINK answers: File exists"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_kinds_round_trip() {
        let err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "nope",
        ));
        let resp = ElevatedResponse::from_error(&err);
        let back = unexpected(resp);
        assert!(back.is_permission_denied());

        let resp = ElevatedResponse::from_error(&Error::DeviceNotFound("wg9".into()));
        assert!(unexpected(resp).is_not_found());

        let resp = ElevatedResponse::from_error(&Error::ProgramNotFound("wg".into()));
        let back = unexpected(resp);
        assert!(back.is_program_missing());
        assert_eq!(back.to_string(), "program not found: wg");
    }

    #[test]
    fn test_client_without_helper_is_elevation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let client = ElevatedClient::new(dir.path().join("missing.sock"));
        let err = client.ping().unwrap_err();
        assert!(err.is_elevation_failure());
    }

    #[cfg(unix)]
    #[cfg(unix)]
    #[tokio::test]
    async fn test_socket_mode_and_group_applied() {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("run").join("helper.sock");
        let gid = std::fs::metadata(dir.path()).unwrap().gid();

        let server = ElevatedServer::new(&socket, Arc::new(crate::exec::LocalExecutor))
            .with_mode(0o660)
            .with_group(gid);
        let _listener = server.listen().unwrap();

        let meta = std::fs::metadata(&socket).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o660);
        assert_eq!(meta.gid(), gid);

        let plain = dir.path().join("default.sock");
        let default = ElevatedServer::new(&plain, Arc::new(crate::exec::LocalExecutor));
        let _listener = default.listen().unwrap();
        let meta = std::fs::metadata(&plain).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, DEFAULT_SOCKET_MODE);
    }

    #[cfg(unix)]
    #[test]
    fn test_group_id() {
        assert_eq!(group_id("1234").unwrap(), 1234);
        #[cfg(target_os = "linux")]
        assert_eq!(group_id("root").unwrap(), 0);
        assert!(group_id("wgk-no-such-group").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_helper_round_trip() {
        use crate::exec::LocalExecutor;

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("helper.sock");
        let file = dir.path().join("state.json");

        let server = ElevatedServer::new(&socket, Arc::new(LocalExecutor));
        let task = tokio::spawn(async move { server.run().await });

        for _ in 0..200 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let client_socket = socket.clone();
        let client_file = file.clone();
        let (out, read) = tokio::task::spawn_blocking(move || {
            let client = ElevatedClient::new(&client_socket);
            client.ping().unwrap();
            let out = client
                .execute(&CommandRequest::new("sh").args(["-c", "echo $GREETING"]).env("GREETING", "hello"))
                .unwrap();
            client.write_file(&client_file, "{\"a\":1}", Some(0o600)).unwrap();
            let read = client.read_file(&client_file).unwrap();
            client.remove_file(&client_file).unwrap();
            (out, read)
        })
        .await
        .unwrap();

        assert_eq!(out.stdout, vec!["hello"]);
        assert_eq!(read.as_deref(), Some("{\"a\":1}"));
        assert!(!file.exists());

        task.abort();
    }
}
