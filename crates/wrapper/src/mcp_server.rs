//! MCP server implementation using rmcp.
//!
//! `WrapperMcpServer` answers `tools/list` from the registry and routes `tools/call` through the
//! [`Dispatcher`], which owns the per-request algorithm shared by both transports.

use crate::backend::{Concurrency, ToolCall};
use crate::config::WrapperSettings;
use crate::error::{BackendError, WrapperError};
use crate::lifecycle::LifecycleManager;
use crate::registry::ToolRegistry;
use crate::template::JsonObject;
use rmcp::{
    ErrorData as McpError, ServerHandler,
    model::{
        CallToolRequestParams, CallToolResult, Content, Implementation, ListToolsResult,
        PaginatedRequestParams, ProtocolVersion, ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

fn timeout_budget_from_meta(meta: &rmcp::model::Meta, max: Duration) -> Option<Duration> {
    let mcpify = meta.get("mcpify").and_then(Value::as_object)?;
    let timeout_ms = mcpify.get("timeoutMs").and_then(Value::as_u64)?;
    if timeout_ms == 0 {
        return None;
    }
    Some(Duration::from_millis(timeout_ms).min(max))
}

/// Tool-call counters reported by `/status`.
#[derive(Debug, Default)]
pub struct CallStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallStatsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    /// Calls that reached the backend and came back as a tool error.
    pub failed: u64,
    /// Calls refused before reaching the backend (unknown tool, bad arguments, backend down).
    pub rejected: u64,
    pub in_flight: u64,
}

impl CallStats {
    #[must_use]
    pub fn snapshot(&self) -> CallStatsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        CallStatsSnapshot {
            total,
            succeeded,
            failed,
            rejected,
            in_flight: total.saturating_sub(succeeded + failed + rejected),
        }
    }
}

/// Validates, gates, and runs tool calls against the backend.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    lifecycle: Arc<LifecycleManager>,
    call_timeout: Duration,
    call_timeout_max: Duration,
    /// Held around each invocation when the backend is serializable.
    backend_gate: Option<Arc<Mutex<()>>>,
    /// Held for the whole call; makes calls strictly sequential in arrival order.
    sequential: Option<Arc<Mutex<()>>>,
    stats: Arc<CallStats>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<ToolRegistry>,
        lifecycle: Arc<LifecycleManager>,
        settings: &WrapperSettings,
    ) -> Self {
        let call_timeout = registry
            .adapter()
            .call_timeout()
            .unwrap_or(settings.call_timeout);
        let backend_gate = (registry.concurrency() == Concurrency::Serializable)
            .then(|| Arc::new(Mutex::new(())));
        Self {
            registry,
            lifecycle,
            call_timeout,
            call_timeout_max: settings.call_timeout_max.max(call_timeout),
            backend_gate,
            sequential: None,
            stats: Arc::new(CallStats::default()),
        }
    }

    /// A dispatcher sharing this one's backend gate and counters that also runs calls one at a time.
    #[must_use]
    pub fn sequential(&self) -> Self {
        Self {
            sequential: Some(Arc::new(Mutex::new(()))),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<CallStats> {
        &self.stats
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    #[must_use]
    pub fn call_timeout_max(&self) -> Duration {
        self.call_timeout_max
    }

    /// Run one `tools/call`.
    ///
    /// Backend failures come back as a successful response carrying an error result; only
    /// request-level problems are returned as `Err`.
    ///
    /// # Errors
    ///
    /// Returns an invalid-params error for an unknown tool or invalid arguments, and an internal
    /// error when the backend is not running.
    pub async fn dispatch(
        &self,
        tool: &str,
        arguments: Option<JsonObject>,
        budget: Option<Duration>,
    ) -> Result<CallToolResult, McpError> {
        let _sequential = match &self.sequential {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };
        let start = Instant::now();
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        let prepared = self.prepare(tool, arguments);
        let (handler, arguments, session) = match prepared {
            Ok(v) => v,
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(tool = %tool, error = %e.message, elapsed = ?start.elapsed(), "tools/call rejected");
                return Err(e);
            }
        };

        let timeout = budget.unwrap_or(self.call_timeout);
        let deadline = tokio::time::Instant::now() + timeout;
        let adapter = self.registry.adapter();

        let outcome = async {
            let _gate = match &self.backend_gate {
                Some(gate) => Some(
                    tokio::time::timeout_at(deadline, gate.lock())
                        .await
                        .map_err(|_| {
                            BackendError::timeout(format!(
                                "Tool '{}' timed out after {}ms waiting for the backend",
                                tool,
                                timeout.as_millis()
                            ))
                        })?,
                ),
                None => None,
            };
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let call = ToolCall {
                tool,
                invocation: handler.invocation(),
                arguments: &arguments,
            };
            adapter.invoke(&session, call, remaining).await
        }
        .await;

        match outcome {
            Ok(value) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    tool = %tool,
                    backend = %self.lifecycle.name(),
                    elapsed = ?start.elapsed(),
                    "tools/call ok"
                );
                Ok(value_to_result(value))
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    tool = %tool,
                    backend = %self.lifecycle.name(),
                    kind = %err.kind,
                    error = %err.detail,
                    elapsed = ?start.elapsed(),
                    "tools/call failed"
                );
                Ok(backend_error_to_result(&err))
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn prepare(
        &self,
        tool: &str,
        arguments: Option<JsonObject>,
    ) -> Result<
        (
            Arc<crate::registry::ToolHandler>,
            JsonObject,
            Arc<crate::backend::RuntimeSession>,
        ),
        McpError,
    > {
        let handler = self.registry.lookup(tool).map_err(to_mcp_error)?;
        let arguments = handler.coerce_arguments(arguments).map_err(to_mcp_error)?;
        let session = self.lifecycle.session().ok_or_else(|| {
            McpError::internal_error(
                format!("Backend '{}' is not running", self.lifecycle.name()),
                None,
            )
        })?;
        Ok((handler, arguments, session))
    }
}

fn to_mcp_error(e: WrapperError) -> McpError {
    match e {
        WrapperError::ToolNotFound(_) | WrapperError::InvalidArguments { .. } => {
            McpError::invalid_params(e.to_string(), None)
        }
        other => McpError::internal_error(other.to_string(), None),
    }
}

/// Successful backend value as a tool result.
#[must_use]
pub fn value_to_result(value: Value) -> CallToolResult {
    match value {
        Value::String(s) => CallToolResult::success(vec![Content::text(s)]),
        Value::Object(_) => {
            let text = serde_json::to_string(&value).unwrap_or_else(|_| value.to_string());
            CallToolResult {
                content: vec![Content::text(text)],
                structured_content: Some(value),
                is_error: Some(false),
                meta: None,
            }
        }
        other => CallToolResult::success(vec![Content::text(other.to_string())]),
    }
}

/// Backend failure as a tool result with `isError: true`.
#[must_use]
pub fn backend_error_to_result(err: &BackendError) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(format!(
            "Error [{}]: {}",
            err.kind, err.detail
        ))],
        structured_content: Some(json!({ "error": err.to_json() })),
        is_error: Some(true),
        meta: None,
    }
}

/// MCP server exposing the registry's tools.
#[derive(Clone)]
pub struct WrapperMcpServer {
    name: String,
    instructions: Option<String>,
    dispatcher: Dispatcher,
}

impl WrapperMcpServer {
    #[must_use]
    pub fn new(name: impl Into<String>, description: &str, dispatcher: Dispatcher) -> Self {
        let description = description.trim();
        Self {
            name: name.into(),
            instructions: (!description.is_empty()).then(|| description.to_string()),
            dispatcher,
        }
    }
}

impl ServerHandler for WrapperMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: self.name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Implementation::from_build_env()
            },
            instructions: self.instructions.clone(),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = self.dispatcher.registry().tools();
        tracing::debug!(request_id = %context.id, tool_count = tools.len(), "tools/list");
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let budget = timeout_budget_from_meta(&context.meta, self.dispatcher.call_timeout_max());
        tracing::debug!(request_id = %context.id, tool = %request.name, budget = ?budget, "tools/call");
        self.dispatcher
            .dispatch(&request.name, request.arguments, budget)
            .await
    }
}
