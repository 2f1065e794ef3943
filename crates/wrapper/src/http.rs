//! Auxiliary HTTP endpoints served next to `/mcp`.

use crate::lifecycle::{LifecycleManager, LifecycleState};
use crate::mcp_server::{CallStats, CallStatsSnapshot};
use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Instant;

/// Shared application state.
pub struct AppState {
    pub name: String,
    pub lifecycle: Arc<LifecycleManager>,
    pub calls: Arc<CallStats>,
    pub tool_count: usize,
    pub start_time: Instant,
    pub version: &'static str,
    /// Optional static bearer token required for non-health HTTP endpoints (including `/mcp`).
    pub mcp_bearer_token: Option<String>,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl AppState {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        lifecycle: Arc<LifecycleManager>,
        calls: Arc<CallStats>,
        tool_count: usize,
        mcp_bearer_token: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            lifecycle,
            calls,
            tool_count,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
            mcp_bearer_token,
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        }
    }
}

/// Create the HTTP router with the auxiliary endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .with_state(state)
}

fn is_probe_path(path: &str) -> bool {
    path == "/health" || path == "/ready"
}

/// Attach request counting middleware (total + failed).
pub fn with_request_counting(router: Router, state: Arc<AppState>) -> Router {
    use axum::{
        body::Body,
        http::Request,
        middleware::{Next, from_fn_with_state},
        response::Response,
    };

    async fn count_requests(
        State(state): State<Arc<AppState>>,
        request: Request<Body>,
        next: Next,
    ) -> Response {
        let should_count = !is_probe_path(request.uri().path());

        if should_count {
            state.total_requests.fetch_add(1, Ordering::Relaxed);
        }
        let response = next.run(request).await;
        if should_count && !response.status().is_success() {
            state.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        response
    }

    router.layer(from_fn_with_state(state, count_requests))
}

/// Optional bearer-token auth for HTTP endpoints.
///
/// If `state.mcp_bearer_token` is set, all requests except `/health` and `/ready` must include:
/// `Authorization: Bearer <token>`.
pub fn with_optional_bearer_auth(router: Router, state: Arc<AppState>) -> Router {
    use axum::{
        body::Body,
        http::Request,
        middleware::{Next, from_fn_with_state},
        response::Response,
    };

    async fn require_bearer(
        State(state): State<Arc<AppState>>,
        request: Request<Body>,
        next: Next,
    ) -> Response {
        if is_probe_path(request.uri().path()) {
            return next.run(request).await;
        }

        let expected = state.mcp_bearer_token.as_deref().unwrap_or_default().trim();
        if expected.is_empty() {
            return next.run(request).await;
        }

        let got = request
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer ").map(str::trim));

        if got == Some(expected) {
            return next.run(request).await;
        }

        (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
    }

    if state
        .mcp_bearer_token
        .as_deref()
        .is_none_or(|t| t.trim().is_empty())
    {
        return router;
    }

    router.layer(from_fn_with_state(state, require_bearer))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// GET /health - Always 200 while the process is serving.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    backend: LifecycleState,
}

/// GET /ready - 200 when the backend session is running, 503 otherwise.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let backend = state.lifecycle.state();
    let running = backend == LifecycleState::Running;
    let response = ReadyResponse {
        status: if running { "ready" } else { "not_ready" },
        backend,
    };
    if running {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

#[derive(Serialize)]
struct StatusResponse {
    name: String,
    version: &'static str,
    uptime_seconds: u64,
    backend: BackendStatusInfo,
    tool_count: usize,
    stats: StatsInfo,
}

#[derive(Serialize)]
struct BackendStatusInfo {
    #[serde(rename = "type")]
    backend_type: String,
    state: String,
    restarts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct StatsInfo {
    total_requests: u64,
    failed_requests: u64,
    tool_calls: CallStatsSnapshot,
}

/// GET /status - Detailed status information.
async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let backend = state.lifecycle.status();
    Json(StatusResponse {
        name: state.name.clone(),
        version: state.version,
        uptime_seconds: state.start_time.elapsed().as_secs(),
        backend: BackendStatusInfo {
            backend_type: backend.kind.to_string(),
            state: backend.state.to_string(),
            restarts: backend.restart_count,
            started_at: backend.started_at,
        },
        tool_count: state.tool_count,
        stats: StatsInfo {
            total_requests: state.total_requests.load(Ordering::Relaxed),
            failed_requests: state.failed_requests.load(Ordering::Relaxed),
            tool_calls: state.calls.snapshot(),
        },
    })
}
