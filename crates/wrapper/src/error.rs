//! Error types for the wrapper.

use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

/// Main error type for the wrapper.
#[derive(Error, Debug)]
pub enum WrapperError {
    /// Configuration errors (duplicate tool, unknown backend type, bad template, bad param type)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Startup errors (backend failed to start, endpoint unreachable)
    #[error("Startup error: {0}")]
    Startup(String),

    /// Runtime errors (serving loop failed, backend not started)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Tool lookup failed
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Caller-supplied arguments do not match the tool's declared parameters
    #[error("Invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for wrapper operations.
pub type Result<T> = std::result::Result<T, WrapperError>;

/// Category of a failed backend invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// The call did not finish within its timeout
    Timeout,
    /// The backend process could not be spawned, exited non-zero, or reported an error
    ProcessFailure,
    /// The backend could not be reached (broken pipe, refused connection, closed stream)
    ConnectionFailure,
    /// The backend answered, but the answer could not be parsed
    MalformedOutput,
    /// An HTTP backend answered with a non-2xx status
    HttpStatus,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendErrorKind::Timeout => write!(f, "timeout"),
            BackendErrorKind::ProcessFailure => write!(f, "process_failure"),
            BackendErrorKind::ConnectionFailure => write!(f, "connection_failure"),
            BackendErrorKind::MalformedOutput => write!(f, "malformed_output"),
            BackendErrorKind::HttpStatus => write!(f, "http_status"),
        }
    }
}

/// Error returned by a backend adapter for a single invocation.
///
/// Adapters never raise past their boundary: every failure is folded into one of these and the
/// server turns it into a protocol-level tool error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {detail}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub detail: String,
    /// Process exit status, or HTTP status code for `HttpStatus`.
    pub exit_status: Option<i32>,
    /// Captured diagnostic output (stderr tail or response body).
    pub stderr: Option<String>,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            exit_status: None,
            stderr: None,
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Timeout, detail)
    }

    pub fn process_failure(detail: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::ProcessFailure, detail)
    }

    pub fn connection_failure(detail: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::ConnectionFailure, detail)
    }

    pub fn malformed_output(detail: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::MalformedOutput, detail)
    }

    #[must_use]
    pub fn with_exit_status(mut self, status: Option<i32>) -> Self {
        self.exit_status = status;
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        let s = stderr.into();
        self.stderr = (!s.trim().is_empty()).then_some(s);
        self
    }

    /// Structured form placed in `structuredContent.error` of a failed tool result.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut v = json!({
            "kind": self.kind,
            "detail": self.detail,
        });
        if let Some(status) = self.exit_status {
            v["exitStatus"] = json!(status);
        }
        if let Some(stderr) = &self.stderr {
            v["stderr"] = json!(stderr);
        }
        v
    }
}
