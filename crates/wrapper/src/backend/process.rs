//! Process backends.
//!
//! `per_call` spawns `command args... <tool args...>` for every call and reads its stdout.
//! `persistent` keeps one child alive for the session and exchanges one JSON line per call.
//! Requests may overlap; responses are matched back to their caller by `id`:
//!
//! ```text
//! -> {"id": 7, "tool": "greet", "args": ["--name", "ada"], "arguments": {"name": "ada"}}
//! <- {"id": 7, "output": "hello ada"}        or        {"id": 7, "error": "no such user"}
//! ```

use super::{OutputFormat, parse_output, truncate};
use crate::error::{BackendError, Result, WrapperError};
use crate::template::{JsonObject, Template};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;

const STDERR_TAIL_LINES: usize = 50;
const MAX_DIAGNOSTIC_BYTES: usize = 4096;
const EXIT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    /// A fresh process per call.
    #[default]
    PerCall,
    /// One long-lived process speaking the JSON line protocol.
    Persistent,
}

/// `backend.config` for process backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessBackendConfig {
    pub command: String,
    /// Fixed leading arguments, before any tool arguments.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mode: ProcessMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputFormat>,
    /// Per-call timeout override (seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl ProcessBackendConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(WrapperError::Config(
                "Process backend 'command' must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn output_format(&self) -> OutputFormat {
        self.output.unwrap_or(OutputFormat::Text)
    }

    fn command(&self, extra: &[String]) -> Command {
        spawn_command(&self.command, &self.args, self.cwd.as_deref(), &self.env, extra)
    }
}

pub(crate) fn spawn_command(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    env: &BTreeMap<String, String>,
    extra: &[String],
) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args).args(extra).envs(env).kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd
}

/// A process tool: one template per positional argument.
#[derive(Debug, Clone)]
pub struct ProcessInvocation {
    args: Vec<Template>,
}

impl ProcessInvocation {
    pub(crate) fn parse(args: &[String]) -> std::result::Result<Self, String> {
        let args = args
            .iter()
            .map(|a| Template::parse(a))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { args })
    }

    pub(crate) fn placeholders(&self) -> BTreeSet<String> {
        self.args
            .iter()
            .flat_map(Template::placeholders)
            .map(str::to_string)
            .collect()
    }

    /// Rendered tool arguments in declared order.
    #[must_use]
    pub fn render(&self, arguments: &JsonObject) -> Vec<String> {
        self.args
            .iter()
            .flat_map(|t| t.render_argv(arguments))
            .collect()
    }
}

/// Bounded tail of a child's stderr, shared with its drain task.
#[derive(Debug, Clone, Default)]
pub(crate) struct StderrTail(Arc<SyncMutex<VecDeque<String>>>);

impl StderrTail {
    fn push(&self, line: String) {
        let mut tail = self.0.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    pub(crate) fn text(&self) -> String {
        let tail = self.0.lock();
        let joined = tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
        truncate(&joined, MAX_DIAGNOSTIC_BYTES)
    }
}

/// Forward a child's output stream to debug logs, keeping a tail for diagnostics.
pub(crate) fn spawn_line_drain<R>(backend: String, stream: R, tail: StderrTail)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(backend = %backend, line = %line, "backend stderr");
            tail.push(line);
        }
    });
}

/// Kill `child` unless it already exited, waiting at most `grace` for it to be reaped.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> std::result::Result<(), String> {
    match child.try_wait() {
        Ok(Some(_)) => return Ok(()),
        Ok(None) => {}
        Err(e) => return Err(format!("Failed to query process state: {e}")),
    }
    child
        .start_kill()
        .map_err(|e| format!("Failed to kill process: {e}"))?;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(format!("Failed to wait for process: {e}")),
        Err(_) => Err(format!(
            "Process did not exit within {}ms after kill",
            grace.as_millis()
        )),
    }
}

fn exit_detail(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("Process exited with status {code}"),
        None => "Process terminated by signal".to_string(),
    }
}

/// What the response router hands a waiting call: the response object, or why the stream ended.
type Routed = std::result::Result<serde_json::Map<String, Value>, String>;

/// Calls awaiting a response line, keyed by request id.
#[derive(Debug, Default)]
struct PendingCalls {
    waiters: HashMap<u64, oneshot::Sender<Routed>>,
    /// Set once the child's stdout has ended; no further responses will arrive.
    closed: Option<String>,
}

type SharedPending = Arc<SyncMutex<PendingCalls>>;

#[derive(Debug)]
struct LiveChild {
    child: Child,
    stdin: ChildStdin,
    pending: SharedPending,
    /// Cleared when a request write fails or times out part way.
    healthy: bool,
}

impl LiveChild {
    fn usable(&mut self) -> bool {
        self.healthy
            && self.pending.lock().closed.is_none()
            && !matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

#[derive(Debug)]
struct Persistent {
    /// Held only while a request line is written, never while its response is awaited.
    live: Mutex<Option<LiveChild>>,
    next_id: AtomicU64,
    restarts: AtomicU64,
    stderr_tail: StderrTail,
}

/// Runtime session of a process backend.
#[derive(Debug)]
pub struct ProcessSession {
    name: String,
    config: Arc<ProcessBackendConfig>,
    stop_timeout: Duration,
    persistent: Option<Persistent>,
}

impl ProcessSession {
    pub(crate) async fn open(
        name: &str,
        config: Arc<ProcessBackendConfig>,
        stop_timeout: Duration,
    ) -> Result<Self> {
        if let Some(cwd) = &config.cwd
            && !cwd.is_dir()
        {
            return Err(WrapperError::Startup(format!(
                "Working directory '{}' for backend '{}' does not exist",
                cwd.display(),
                name
            )));
        }

        let persistent = match config.mode {
            ProcessMode::PerCall => None,
            ProcessMode::Persistent => {
                let stderr_tail = StderrTail::default();
                let live = spawn_persistent(name, &config, &stderr_tail).map_err(|e| {
                    WrapperError::Startup(format!(
                        "Failed to spawn '{}' for backend '{}': {}",
                        config.command, name, e
                    ))
                })?;
                tracing::info!(backend = %name, pid = ?live.child.id(), "Spawned persistent backend process");
                Some(Persistent {
                    live: Mutex::new(Some(live)),
                    next_id: AtomicU64::new(1),
                    restarts: AtomicU64::new(0),
                    stderr_tail,
                })
            }
        };

        Ok(Self {
            name: name.to_string(),
            config,
            stop_timeout,
            persistent,
        })
    }

    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.persistent
            .as_ref()
            .map_or(0, |p| p.restarts.load(Ordering::Relaxed))
    }

    pub(crate) async fn invoke(
        &self,
        tool: &str,
        invocation: &ProcessInvocation,
        arguments: &JsonObject,
        timeout: Duration,
    ) -> std::result::Result<Value, BackendError> {
        let argv = invocation.render(arguments);
        match &self.persistent {
            None => self.invoke_per_call(tool, &argv, timeout).await,
            Some(p) => {
                self.invoke_persistent(p, tool, argv, arguments, timeout)
                    .await
            }
        }
    }

    async fn invoke_per_call(
        &self,
        tool: &str,
        argv: &[String],
        timeout: Duration,
    ) -> std::result::Result<Value, BackendError> {
        let mut cmd = self.config.command(argv);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| {
            BackendError::process_failure(format!(
                "Failed to spawn '{}': {}",
                self.config.command, e
            ))
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(BackendError::connection_failure(format!(
                    "Failed to read output of '{}': {}",
                    self.config.command, e
                )));
            }
            Err(_) => {
                return Err(BackendError::timeout(format!(
                    "Tool '{}' timed out after {}ms",
                    tool,
                    timeout.as_millis()
                )));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(BackendError::process_failure(exit_detail(output.status))
                .with_exit_status(output.status.code())
                .with_stderr(truncate(&stderr, MAX_DIAGNOSTIC_BYTES)));
        }

        let stdout = String::from_utf8(output.stdout).map_err(|_| {
            BackendError::malformed_output("Process output is not valid UTF-8")
                .with_stderr(truncate(&stderr, MAX_DIAGNOSTIC_BYTES))
        })?;
        parse_output(&stdout, self.config.output_format())
    }

    async fn invoke_persistent(
        &self,
        p: &Persistent,
        tool: &str,
        argv: Vec<String>,
        arguments: &JsonObject,
        timeout: Duration,
    ) -> std::result::Result<Value, BackendError> {
        let deadline = Instant::now() + timeout;
        let timed_out = || {
            BackendError::timeout(format!(
                "Tool '{}' timed out after {}ms",
                tool,
                timeout.as_millis()
            ))
        };

        let id = p.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "id": id,
            "tool": tool,
            "args": argv,
            "arguments": arguments,
        });
        let mut line = request.to_string();
        line.push('\n');

        let (pending, response) = {
            let mut guard = tokio::time::timeout_at(deadline, p.live.lock())
                .await
                .map_err(|_| timed_out())?;

            // An exited child is replaced before anything is written to it.
            if !guard.as_mut().is_some_and(LiveChild::usable) {
                self.respawn(p, &mut guard).await?;
            }
            let Some(live) = guard.as_mut() else {
                return Err(BackendError::connection_failure(format!(
                    "Backend '{}' has no running process",
                    self.name
                )));
            };

            let (tx, rx) = oneshot::channel();
            {
                let mut pending = live.pending.lock();
                if let Some(reason) = &pending.closed {
                    return Err(BackendError::connection_failure(format!(
                        "Backend '{}' {}",
                        self.name, reason
                    ))
                    .with_stderr(p.stderr_tail.text()));
                }
                pending.waiters.insert(id, tx);
            }
            let pending = Arc::clone(&live.pending);

            live.healthy = false;
            let stdin = &mut live.stdin;
            let written = tokio::time::timeout_at(deadline, async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            })
            .await;
            match written {
                Ok(Ok(())) => live.healthy = true,
                Ok(Err(e)) => {
                    pending.lock().waiters.remove(&id);
                    return Err(BackendError::connection_failure(format!(
                        "Failed to write request to backend '{}': {}",
                        self.name, e
                    ))
                    .with_exit_status(exited_code(&mut live.child))
                    .with_stderr(p.stderr_tail.text()));
                }
                Err(_) => {
                    pending.lock().waiters.remove(&id);
                    return Err(timed_out());
                }
            }
            (pending, rx)
        };

        match tokio::time::timeout_at(deadline, response).await {
            Err(_) => {
                // A late answer for this id is skipped by the router.
                pending.lock().waiters.remove(&id);
                Err(timed_out())
            }
            Ok(Err(_)) => Err(BackendError::connection_failure(format!(
                "Backend '{}' stopped before answering",
                self.name
            ))),
            Ok(Ok(Err(reason))) => Err(BackendError::connection_failure(format!(
                "Backend '{}' {}",
                self.name, reason
            ))
            .with_exit_status(self.exit_code_after_close(p, &pending).await)
            .with_stderr(p.stderr_tail.text())),
            Ok(Ok(Ok(response))) => {
                response_result(response, id).and_then(|v| self.shape_output(v))
            }
        }
    }

    /// Exit code of the child whose output ended, if it is still the live one and exits promptly.
    async fn exit_code_after_close(&self, p: &Persistent, pending: &SharedPending) -> Option<i32> {
        let mut guard = p.live.lock().await;
        let live = guard
            .as_mut()
            .filter(|live| Arc::ptr_eq(&live.pending, pending))?;
        let status = tokio::time::timeout(EXIT_GRACE, live.child.wait())
            .await
            .ok()?
            .ok()?;
        status.code()
    }

    fn shape_output(&self, value: Value) -> std::result::Result<Value, BackendError> {
        match (self.config.output_format(), value) {
            (OutputFormat::Json, Value::String(s)) => parse_output(&s, OutputFormat::Json),
            (_, v) => Ok(v),
        }
    }

    async fn respawn(
        &self,
        p: &Persistent,
        slot: &mut Option<LiveChild>,
    ) -> std::result::Result<(), BackendError> {
        if let Some(mut old) = slot.take() {
            if let Err(e) = terminate(&mut old.child, self.stop_timeout).await {
                tracing::warn!(backend = %self.name, error = %e, "Failed to terminate unhealthy backend process");
            }
        }
        let live = spawn_persistent(&self.name, &self.config, &p.stderr_tail).map_err(|e| {
            BackendError::process_failure(format!(
                "Failed to respawn '{}': {}",
                self.config.command, e
            ))
        })?;
        let restarts = p.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(backend = %self.name, restarts, pid = ?live.child.id(), "Respawned persistent backend process");
        *slot = Some(live);
        Ok(())
    }

    pub(crate) async fn close(&self) -> Vec<String> {
        let Some(p) = &self.persistent else {
            return Vec::new();
        };
        let mut errors = Vec::new();
        if let Some(mut live) = p.live.lock().await.take() {
            drop(live.stdin);
            if let Err(e) = terminate(&mut live.child, self.stop_timeout).await {
                errors.push(format!("backend '{}': {}", self.name, e));
            }
        }
        errors
    }
}

fn spawn_persistent(
    name: &str,
    config: &ProcessBackendConfig,
    stderr_tail: &StderrTail,
) -> std::io::Result<LiveChild> {
    let mut cmd = config.command(&[]);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("child stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
    if let Some(stderr) = child.stderr.take() {
        spawn_line_drain(name.to_string(), stderr, stderr_tail.clone());
    }

    let pending = SharedPending::default();
    spawn_response_router(name.to_string(), stdout, Arc::clone(&pending));

    Ok(LiveChild {
        child,
        stdin,
        pending,
        healthy: true,
    })
}

/// Own a persistent child's stdout and hand each response line to the call waiting on its id.
///
/// When the stream ends every waiting call is failed and the pending set is marked closed.
fn spawn_response_router(backend: String, stdout: ChildStdout, pending: SharedPending) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let reason = loop {
            match lines.next_line().await {
                Ok(Some(line)) => route_response(&backend, &pending, &line),
                Ok(None) => break "closed its output".to_string(),
                Err(e) => break format!("output could not be read: {e}"),
            }
        };
        tracing::debug!(backend = %backend, reason = %reason, "Backend output ended");

        let waiters = {
            let mut pending = pending.lock();
            pending.closed = Some(reason.clone());
            std::mem::take(&mut pending.waiters)
        };
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(reason.clone()));
        }
    });
}

fn route_response(backend: &str, pending: &SharedPending, line: &str) {
    let waiter = match serde_json::from_str::<Value>(line.trim()) {
        Ok(Value::Object(response)) => response
            .get("id")
            .and_then(Value::as_u64)
            .and_then(|id| pending.lock().waiters.remove(&id))
            .map(|waiter| (waiter, response)),
        _ => None,
    };
    match waiter {
        Some((waiter, response)) => {
            let _ = waiter.send(Ok(response));
        }
        None => {
            tracing::debug!(backend = %backend, line = %line, "Skipping unrelated backend output");
        }
    }
}

fn exited_code(child: &mut Child) -> Option<i32> {
    child.try_wait().ok().flatten().and_then(|s| s.code())
}

/// Turn the response routed to request `id` into the call's result.
fn response_result(
    mut response: serde_json::Map<String, Value>,
    id: u64,
) -> std::result::Result<Value, BackendError> {
    if let Some(err) = response.remove("error")
        && !err.is_null()
    {
        let detail = err.as_str().map_or_else(|| err.to_string(), str::to_string);
        return Err(BackendError::process_failure(detail));
    }
    response.remove("output").ok_or_else(|| {
        BackendError::malformed_output(format!(
            "Response {id} carries neither 'output' nor 'error'"
        ))
    })
}
