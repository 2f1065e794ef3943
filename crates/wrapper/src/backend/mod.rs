//! Backend adapters.
//!
//! A backend is selected once, from the artifact's `backend.type` tag, and is one of a closed set
//! of kinds. Each kind provides:
//! - a per-tool invocation compiled from the tool's `args` templates
//! - a runtime session opened by the lifecycle manager
//! - `invoke`, which runs one call against that session and folds every failure into a
//!   [`BackendError`]

pub mod http;
pub mod process;

use crate::config::{BackendSpec, ToolSpec};
use crate::error::{BackendError, Result, WrapperError};
use crate::template::JsonObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use http::{HttpBackendConfig, HttpInvocation, HttpSession};
pub use process::{ProcessBackendConfig, ProcessInvocation, ProcessMode, ProcessSession};

/// Whether calls to a backend may overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concurrency {
    /// At most one call in flight; the server holds a per-backend gate around each call.
    Serializable,
    /// Calls may run concurrently.
    ParallelSafe,
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Concurrency::Serializable => write!(f, "serializable"),
            Concurrency::ParallelSafe => write!(f, "parallel_safe"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Process,
    Http,
}

impl BackendKind {
    /// Map an artifact `backend.type` tag to a backend kind.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "commandline" | "process" | "cli" => Some(Self::Process),
            "http" | "fastapi" | "flask" => Some(Self::Http),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Process => "process",
            BackendKind::Http => "http",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a backend's successful output is turned into a result value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Raw text.
    Text,
    /// Parsed JSON; parse failures are `MalformedOutput`.
    Json,
}

/// One compiled tool invocation, matching the backend kind it was compiled for.
#[derive(Debug, Clone)]
pub enum Invocation {
    Process(ProcessInvocation),
    Http(HttpInvocation),
}

impl Invocation {
    /// Every placeholder referenced by the tool's templates.
    #[must_use]
    pub fn placeholders(&self) -> BTreeSet<String> {
        match self {
            Invocation::Process(p) => p.placeholders(),
            Invocation::Http(h) => h.placeholders(),
        }
    }

    /// Placeholders that must have a value at call time, even when the parameter is optional.
    #[must_use]
    pub fn mandatory_placeholders(&self) -> BTreeSet<String> {
        match self {
            Invocation::Process(_) => BTreeSet::new(),
            Invocation::Http(h) => h.path_placeholders(),
        }
    }
}

/// A single call handed to an adapter.
#[derive(Debug, Clone, Copy)]
pub struct ToolCall<'a> {
    pub tool: &'a str,
    pub invocation: &'a Invocation,
    /// Validated and coerced arguments.
    pub arguments: &'a JsonObject,
}

/// The backend selected by the artifact: a closed set of kinds, resolved once at build time.
#[derive(Debug, Clone)]
pub enum BackendAdapter {
    Process(Arc<ProcessBackendConfig>),
    Http(Arc<HttpBackendConfig>),
}

impl BackendAdapter {
    /// Resolve `backend.type` and deserialize the kind-specific `backend.config`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown tag or a config that does not fit the kind.
    pub fn resolve(spec: &BackendSpec) -> Result<Self> {
        let kind = BackendKind::from_tag(&spec.kind).ok_or_else(|| {
            WrapperError::Config(format!(
                "Unknown backend type '{}' (expected one of: commandline, process, cli, http, fastapi, flask)",
                spec.kind
            ))
        })?;
        let raw = match &spec.config {
            Value::Null => Value::Object(JsonObject::new()),
            other => other.clone(),
        };
        match kind {
            BackendKind::Process => {
                let cfg: ProcessBackendConfig = serde_json::from_value(raw).map_err(|e| {
                    WrapperError::Config(format!("Invalid process backend config: {e}"))
                })?;
                cfg.validate()?;
                Ok(Self::Process(Arc::new(cfg)))
            }
            BackendKind::Http => {
                let cfg: HttpBackendConfig = serde_json::from_value(raw).map_err(|e| {
                    WrapperError::Config(format!("Invalid http backend config: {e}"))
                })?;
                cfg.validate()?;
                Ok(Self::Http(Arc::new(cfg)))
            }
        }
    }

    #[must_use]
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendAdapter::Process(_) => BackendKind::Process,
            BackendAdapter::Http(_) => BackendKind::Http,
        }
    }

    /// Effective concurrency: the declared value, else the kind's default.
    #[must_use]
    pub fn concurrency(&self, declared: Option<Concurrency>) -> Concurrency {
        if let Some(c) = declared {
            return c;
        }
        match self {
            BackendAdapter::Process(cfg) if cfg.mode == ProcessMode::Persistent => {
                Concurrency::Serializable
            }
            BackendAdapter::Process(_) | BackendAdapter::Http(_) => Concurrency::ParallelSafe,
        }
    }

    /// Backend-level per-call timeout override.
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        let secs = match self {
            BackendAdapter::Process(cfg) => cfg.timeout,
            BackendAdapter::Http(cfg) => cfg.timeout,
        };
        secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    /// Compile a tool's `args` templates for this backend kind.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed template.
    pub fn compile(&self, tool: &ToolSpec) -> std::result::Result<Invocation, String> {
        match self {
            BackendAdapter::Process(_) => ProcessInvocation::parse(&tool.args).map(Invocation::Process),
            BackendAdapter::Http(_) => HttpInvocation::parse(&tool.args).map(Invocation::Http),
        }
    }

    /// Establish the runtime session (spawn the persistent process, launch/probe the HTTP app).
    ///
    /// # Errors
    ///
    /// Returns a startup error when the backend cannot be brought up.
    pub async fn open_session(&self, name: &str, stop_timeout: Duration) -> Result<RuntimeSession> {
        match self {
            BackendAdapter::Process(cfg) => {
                ProcessSession::open(name, Arc::clone(cfg), stop_timeout)
                    .await
                    .map(RuntimeSession::Process)
            }
            BackendAdapter::Http(cfg) => HttpSession::open(name, Arc::clone(cfg), stop_timeout)
                .await
                .map(RuntimeSession::Http),
        }
    }

    /// Run one call against `session`, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Every failure is returned as a [`BackendError`]; nothing escapes as a panic or a
    /// [`WrapperError`].
    pub async fn invoke(
        &self,
        session: &RuntimeSession,
        call: ToolCall<'_>,
        timeout: Duration,
    ) -> std::result::Result<Value, BackendError> {
        match (session, call.invocation) {
            (RuntimeSession::Process(s), Invocation::Process(inv)) => {
                s.invoke(call.tool, inv, call.arguments, timeout).await
            }
            (RuntimeSession::Http(s), Invocation::Http(inv)) => {
                s.invoke(call.tool, inv, call.arguments, timeout).await
            }
            _ => Err(BackendError::connection_failure(format!(
                "Session kind '{}' does not match the invocation for tool '{}'",
                session.kind(),
                call.tool
            ))),
        }
    }
}

/// The live backend resource owned by the lifecycle manager.
#[derive(Debug)]
pub enum RuntimeSession {
    Process(ProcessSession),
    Http(HttpSession),
}

impl RuntimeSession {
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        match self {
            RuntimeSession::Process(_) => BackendKind::Process,
            RuntimeSession::Http(_) => BackendKind::Http,
        }
    }

    /// Number of times the session re-established its resource after it became unhealthy.
    #[must_use]
    pub fn restarts(&self) -> u64 {
        match self {
            RuntimeSession::Process(s) => s.restarts(),
            RuntimeSession::Http(_) => 0,
        }
    }

    /// Release the session's resources. Returns teardown failures instead of raising them.
    pub async fn close(&self) -> Vec<String> {
        match self {
            RuntimeSession::Process(s) => s.close().await,
            RuntimeSession::Http(s) => s.close().await,
        }
    }
}

/// Parse successful text output according to `format`.
pub(crate) fn parse_output(text: &str, format: OutputFormat) -> std::result::Result<Value, BackendError> {
    match format {
        OutputFormat::Text => Ok(Value::String(text.trim_end_matches(['\n', '\r']).to_string())),
        OutputFormat::Json => {
            let trimmed = text.trim();
            serde_json::from_str(trimmed).map_err(|e| {
                BackendError::malformed_output(format!("Backend output is not valid JSON: {e}"))
                    .with_stderr(truncate(trimmed, 2048))
            })
        }
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
