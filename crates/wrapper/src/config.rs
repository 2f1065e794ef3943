//! Configuration parsing.
//!
//! Two inputs feed a wrapper run:
//! - the JSON artifact describing the backend and its tools (`ServerConfig`)
//! - host settings from CLI flags / env (`WrapperSettings`)

use crate::backend::Concurrency;
use crate::error::{Result, WrapperError};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// CLI Arguments
// ============================================================================

/// CLI arguments for the `mcpify` host binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcpify")]
#[command(
    version,
    about = "Serve a JSON-described backend and tool list as an MCP server"
)]
pub struct CliArgs {
    /// Log level. Supports tracing filter syntax.
    #[arg(short = 'l', long = "log-level", env = "MCPIFY_LOG", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the MCP server for a configuration file.
    Serve(ServeArgs),
    /// Print a configuration file's backend and tools and check that it builds.
    View(ViewArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Path to the JSON configuration file.
    pub config: PathBuf,

    /// Transport to serve on.
    #[arg(long, value_enum, default_value_t = Mode::Stdio, env = "MCPIFY_MODE")]
    pub mode: Mode,

    /// Host for streamable-http mode.
    #[arg(long, default_value = "localhost", env = "MCPIFY_HOST")]
    pub host: String,

    /// Port for streamable-http mode.
    #[arg(long, default_value_t = 8080, env = "MCPIFY_PORT")]
    pub port: u16,

    /// Timeout for individual tool calls (seconds)
    #[arg(long, env = "MCPIFY_CALL_TIMEOUT", value_parser = clap::value_parser!(u64).range(1..))]
    pub call_timeout: Option<u64>,

    /// Upper bound for a client-requested `_meta.mcpify.timeoutMs` budget (seconds)
    #[arg(long, env = "MCPIFY_CALL_TIMEOUT_MAX", value_parser = clap::value_parser!(u64).range(1..))]
    pub call_timeout_max: Option<u64>,

    /// Max time to wait for the backend to come up (seconds)
    #[arg(long, env = "MCPIFY_STARTUP_TIMEOUT", value_parser = clap::value_parser!(u64).range(1..))]
    pub startup_timeout: Option<u64>,

    /// Max time to wait for a killed backend process to exit (seconds)
    #[arg(long, env = "MCPIFY_STOP_TIMEOUT", value_parser = clap::value_parser!(u64).range(1..))]
    pub stop_timeout: Option<u64>,

    /// Optional static bearer token required for all non-health HTTP endpoints (including `/mcp`).
    ///
    /// If set, requests must include: `Authorization: Bearer <token>`.
    #[arg(long = "mcp-bearer-token", env = "MCPIFY_MCP_BEARER_TOKEN")]
    pub mcp_bearer_token: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ViewArgs {
    /// Path to the JSON configuration file.
    pub config: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    #[value(name = "stdio")]
    Stdio,
    #[value(name = "streamable-http")]
    StreamableHttp,
}

const DEFAULT_LOG_LEVEL: &str = "info";

/// Resolve the log filter.
///
/// Precedence: `--log-level` / `MCPIFY_LOG` (via clap) > `RUST_LOG` > default.
#[must_use]
pub fn effective_log_level(cli: &CliArgs) -> String {
    if let Some(level) = &cli.log_level {
        return level.clone();
    }
    std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
}

// ============================================================================
// Host Settings
// ============================================================================

const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;

/// Effective wrapper settings (after merging defaults + env + CLI).
#[derive(Debug, Clone)]
pub struct WrapperSettings {
    /// Default per-call timeout.
    pub call_timeout: Duration,
    /// Upper bound for client-requested call budgets.
    pub call_timeout_max: Duration,
    /// Time allowed for `start()` to establish the backend session.
    pub startup_timeout: Duration,
    /// Bounded wait for killed child processes during `stop()`.
    pub stop_timeout: Duration,
    /// Optional static bearer token required for non-health HTTP endpoints.
    pub mcp_bearer_token: Option<String>,
}

impl Default for WrapperSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            call_timeout_max: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            startup_timeout: Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS),
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
            mcp_bearer_token: None,
        }
    }
}

impl WrapperSettings {
    /// Apply `serve` flags on top of the defaults.
    ///
    /// The maximum call budget never drops below the default call timeout.
    #[must_use]
    pub fn from_serve_args(args: &ServeArgs) -> Self {
        let mut settings = Self::default();
        if let Some(v) = args.call_timeout {
            settings.call_timeout = Duration::from_secs(v);
        }
        if let Some(v) = args.call_timeout_max {
            settings.call_timeout_max = Duration::from_secs(v);
        }
        settings.call_timeout_max = settings.call_timeout_max.max(settings.call_timeout);
        if let Some(v) = args.startup_timeout {
            settings.startup_timeout = Duration::from_secs(v);
        }
        if let Some(v) = args.stop_timeout {
            settings.stop_timeout = Duration::from_secs(v);
        }
        if let Some(t) = &args.mcp_bearer_token {
            let t = t.trim().to_string();
            settings.mcp_bearer_token = (!t.is_empty()).then_some(t);
        }
        settings
    }
}

// ============================================================================
// Server Config (JSON artifact)
// ============================================================================

/// The declarative backend + tool list served by the wrapper.
///
/// Created once at startup and never mutated afterwards.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub backend: BackendSpec,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

/// Backend selector plus its kind-specific connection fields.
///
/// `config` stays untyped until the registry resolves `type`, so shape errors are reported as
/// configuration errors for the selected backend kind.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<Concurrency>,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Positional argument templates, rendered in declared order.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParameterSpec {
    pub name: String,
    /// One of `string`, `integer`, `number`, `boolean`, `array`, `object` (checked at build).
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    /// Defaults to `true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ServerConfig {
    /// Load a configuration file and expand `${VAR}` references in the backend section.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read, is not valid JSON for this
    /// shape, or references a missing environment variable.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WrapperError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
            .map_err(|e| WrapperError::Config(format!("{}: {}", path.display(), strip_prefix(&e))))
    }

    /// Parse a configuration document held in memory.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid JSON or a missing environment variable.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let mut config: ServerConfig = serde_json::from_str(content)
            .map_err(|e| WrapperError::Config(format!("Failed to parse config: {e}")))?;
        expand_env_value(&mut config.backend.config)?;
        Ok(config)
    }
}

fn strip_prefix(e: &WrapperError) -> String {
    match e {
        WrapperError::Config(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expand `${VAR}` in every string of a JSON value.
fn expand_env_value(v: &mut Value) -> Result<()> {
    match v {
        Value::String(s) => {
            if s.contains("${") {
                *s = expand_env_string(s)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                expand_env_value(item)?;
            }
        }
        Value::Object(map) => {
            for (_k, item) in map.iter_mut() {
                expand_env_value(item)?;
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Expand `${VAR}` occurrences in a string using environment variables.
///
/// # Errors
///
/// Returns a configuration error when a referenced environment variable is not set.
pub fn expand_env_string(s: &str) -> Result<String> {
    let mut result = s.to_string();
    let mut start = 0usize;

    while let Some(dollar_pos) = result[start..].find("${") {
        let abs_pos = start + dollar_pos;
        if let Some(end_pos) = result[abs_pos..].find('}') {
            let var_name = &result[abs_pos + 2..abs_pos + end_pos];
            let var_value = std::env::var(var_name).map_err(|_| {
                WrapperError::Config(format!(
                    "Environment variable '{var_name}' not found (referenced in config)"
                ))
            })?;
            result = format!(
                "{}{}{}",
                &result[..abs_pos],
                var_value,
                &result[abs_pos + end_pos + 1..]
            );
            start = abs_pos + var_value.len();
        } else {
            start = abs_pos + 2;
        }
    }

    Ok(result)
}

// ============================================================================
// Tests
// ============================================================================
