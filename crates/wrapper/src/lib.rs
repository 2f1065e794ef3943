//! mcpify wrapper
//!
//! Turns a JSON-described backend and tool list into a live MCP server, served over stdio or
//! streamable HTTP.

pub mod backend;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod mcp_server;
pub mod registry;
pub mod template;
pub mod transport;

pub use crate::config::{ServerConfig, WrapperSettings};
pub use crate::error::{BackendError, BackendErrorKind, Result, WrapperError};
pub use crate::transport::Transport;

use crate::http::AppState;
use crate::lifecycle::LifecycleManager;
use crate::mcp_server::{Dispatcher, WrapperMcpServer};
use crate::registry::ToolRegistry;
use futures::FutureExt as _;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Where a server run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Init,
    Ready,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Init => write!(f, "init"),
            ServerState::Ready => write!(f, "ready"),
            ServerState::ShuttingDown => write!(f, "shutting_down"),
            ServerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// How a run that got past startup ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
}

impl RunOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// Schedules `stop()` if a run future is dropped between `start()` and its own `stop()`.
struct StopOnDrop(Option<Arc<LifecycleManager>>);

impl StopOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        let Some(lifecycle) = self.0.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(backend = %lifecycle.name(), "Server run dropped, stopping backend");
                handle.spawn(async move { lifecycle.stop().await });
            }
            // Child processes are still killed when their handles drop.
            Err(_) => {
                tracing::warn!(backend = %lifecycle.name(), "Server run dropped outside a runtime");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "serving loop panicked".to_string()
    }
}

/// A configured server: registry, backend lifecycle and dispatcher, ready to run.
pub struct Wrapper {
    name: String,
    description: String,
    settings: WrapperSettings,
    registry: Arc<ToolRegistry>,
    lifecycle: Arc<LifecycleManager>,
    dispatcher: Dispatcher,
    state: RwLock<ServerState>,
}

impl Wrapper {
    /// Build the tool registry and backend lifecycle for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`WrapperError::Config`] if the backend or any tool is invalid.
    pub fn build(config: &ServerConfig, settings: WrapperSettings) -> Result<Self> {
        let registry = Arc::new(ToolRegistry::build(config)?);
        let lifecycle = Arc::new(LifecycleManager::new(
            config.name.clone(),
            registry.adapter().clone(),
            settings.startup_timeout,
            settings.stop_timeout,
        ));
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::clone(&lifecycle), &settings);

        tracing::info!(
            server = %config.name,
            backend = %registry.adapter().kind(),
            concurrency = %registry.concurrency(),
            tools = registry.len(),
            call_timeout = ?dispatcher.call_timeout(),
            "Built wrapper"
        );
        if registry.is_empty() {
            tracing::warn!(server = %config.name, "No tools configured");
        }

        Ok(Self {
            name: config.name.clone(),
            description: config.description.clone(),
            settings,
            registry,
            lifecycle,
            dispatcher,
            state: RwLock::new(ServerState::Init),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.state.read()
    }

    fn set_state(&self, state: ServerState) {
        *self.state.write() = state;
        tracing::info!(server = %self.name, state = %state, "Server state changed");
    }

    /// Bring the backend up. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`WrapperError::Startup`] if the backend cannot be started.
    pub async fn start_backend(&self) -> Result<()> {
        self.lifecycle.start().await.map(|_| ())
    }

    /// Release the backend. Idempotent and infallible.
    pub async fn stop_backend(&self) {
        self.lifecycle.stop().await;
    }

    /// Serve on `transport` until input closes or a termination signal arrives.
    ///
    /// # Errors
    ///
    /// Returns [`WrapperError::Startup`] if the backend cannot be started; nothing is served then.
    pub async fn run(&self, transport: Transport) -> Result<RunOutcome> {
        tracing::info!(server = %self.name, transport = %transport, "Running server");
        let ct = CancellationToken::new();
        let signals = crate::transport::spawn_shutdown_signal(ct.clone());

        let outcome = match transport {
            Transport::Stdio => {
                self.run_with_io_until(tokio::io::stdin(), tokio::io::stdout(), ct.clone())
                    .await
            }
            Transport::StreamableHttp { host, port } => {
                let ct = ct.clone();
                self.run_serving(|| async move {
                    let listener = crate::transport::bind(&host, port).await?;
                    self.serve_http(listener, ct).await
                })
                .await
            }
        };

        signals.abort();
        outcome
    }

    /// Serve the stdio transport over arbitrary streams until `reader` reaches end of input.
    ///
    /// # Errors
    ///
    /// Returns [`WrapperError::Startup`] if the backend cannot be started.
    pub async fn run_with_io<R, W>(&self, reader: R, writer: W) -> Result<RunOutcome>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.run_with_io_until(reader, writer, CancellationToken::new())
            .await
    }

    async fn run_with_io_until<R, W>(
        &self,
        reader: R,
        writer: W,
        ct: CancellationToken,
    ) -> Result<RunOutcome>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.run_serving(|| {
            let server = self.mcp_server(self.dispatcher.sequential());
            transport::serve_stdio(server, reader, writer, ct)
        })
        .await
    }

    /// Serve streamable HTTP on an already bound listener until `ct` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`WrapperError::Startup`] if the backend cannot be started.
    pub async fn run_with_listener(
        &self,
        listener: TcpListener,
        ct: CancellationToken,
    ) -> Result<RunOutcome> {
        self.run_serving(|| self.serve_http(listener, ct)).await
    }

    async fn serve_http(&self, listener: TcpListener, ct: CancellationToken) -> Result<()> {
        let state = Arc::new(AppState::new(
            self.name.clone(),
            Arc::clone(&self.lifecycle),
            Arc::clone(self.dispatcher.stats()),
            self.registry.len(),
            self.settings.mcp_bearer_token.clone(),
        ));
        let server = self.mcp_server(self.dispatcher.clone());
        transport::serve_streamable_http(server, state, listener, ct).await
    }

    fn mcp_server(&self, dispatcher: Dispatcher) -> WrapperMcpServer {
        WrapperMcpServer::new(self.name.clone(), &self.description, dispatcher)
    }

    /// One server run: start, serve, then stop on every exit path.
    async fn run_serving<F, Fut>(&self, serve: F) -> Result<RunOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.set_state(ServerState::Init);
        if let Err(e) = self.lifecycle.start().await {
            tracing::error!(server = %self.name, error = %e, "Backend failed to start");
            self.set_state(ServerState::Stopped);
            return Err(e);
        }
        self.set_state(ServerState::Ready);

        let guard = StopOnDrop(Some(Arc::clone(&self.lifecycle)));
        let served = AssertUnwindSafe(serve()).catch_unwind().await;

        self.set_state(ServerState::ShuttingDown);
        self.lifecycle.stop().await;
        guard.disarm();
        self.set_state(ServerState::Stopped);

        let outcome = match served {
            Ok(Ok(())) => RunOutcome::Completed,
            Ok(Err(e)) => {
                tracing::error!(server = %self.name, error = %e, "Serving loop failed");
                RunOutcome::Failed(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                tracing::error!(server = %self.name, error = %message, "Serving loop panicked");
                RunOutcome::Failed(message)
            }
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleState;
    use serde_json::json;
    use std::time::Duration;

    fn wrapper(backend: serde_json::Value) -> Wrapper {
        let config: ServerConfig = serde_json::from_value(json!({
            "name": "demo",
            "description": "Demo tools",
            "backend": backend,
            "tools": [
                { "name": "say", "description": "Echo a word", "args": ["{word}"],
                  "parameters": [ { "name": "word", "type": "string", "description": "Word" } ] }
            ]
        }))
        .expect("config");
        let settings = WrapperSettings {
            startup_timeout: Duration::from_millis(500),
            ..WrapperSettings::default()
        };
        Wrapper::build(&config, settings).expect("build")
    }

    fn persistent_sleep() -> serde_json::Value {
        json!({ "type": "process", "config": { "command": "sleep", "args": ["30"], "mode": "persistent" } })
    }

    #[tokio::test]
    async fn closed_input_completes_and_stops_backend() {
        let w = wrapper(persistent_sleep());
        let (client, server) = tokio::io::duplex(1024);
        drop(client);
        let (reader, writer) = tokio::io::split(server);

        let outcome = w.run_with_io(reader, writer).await.expect("run");

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(w.state(), ServerState::Stopped);
        assert_eq!(w.lifecycle().state(), LifecycleState::Stopped);
        assert_eq!(w.lifecycle().stop_count(), 1);
    }

    #[tokio::test]
    async fn start_failure_never_reaches_ready() {
        let w = wrapper(json!({
            "type": "process",
            "config": { "command": "/nonexistent/mcpify-backend", "args": [], "mode": "persistent" }
        }));
        let (_client, server) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(server);

        let err = w.run_with_io(reader, writer).await.unwrap_err();

        assert!(matches!(err, WrapperError::Startup(_)), "err={err}");
        assert_eq!(w.state(), ServerState::Stopped);
        assert_eq!(w.lifecycle().stop_count(), 0);
    }

    async fn explode() -> Result<()> {
        panic!("boom")
    }

    async fn listener_dies() -> Result<()> {
        Err(WrapperError::Runtime("listener died".to_string()))
    }

    #[tokio::test]
    async fn panic_in_serving_loop_still_stops_backend() {
        let w = wrapper(persistent_sleep());

        let outcome = w.run_serving(explode).await.expect("run");

        assert_eq!(outcome, RunOutcome::Failed("boom".to_string()));
        assert_eq!(w.lifecycle().stop_count(), 1);
        assert_eq!(w.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn serving_error_is_a_failed_outcome() {
        let w = wrapper(persistent_sleep());

        let outcome = w.run_serving(listener_dies).await.expect("run");

        assert!(matches!(outcome, RunOutcome::Failed(ref m) if m.contains("listener died")));
        assert_eq!(w.lifecycle().stop_count(), 1);
    }

    #[tokio::test]
    async fn dropped_run_schedules_stop() {
        let w = Arc::new(wrapper(persistent_sleep()));
        let (_client, server) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(server);

        let task = tokio::spawn({
            let w = Arc::clone(&w);
            async move { w.run_with_io(reader, writer).await }
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while w.state() != ServerState::Ready {
            assert!(std::time::Instant::now() < deadline, "never became ready");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        task.abort();
        let _ = task.await;

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while w.lifecycle().stop_count() == 0 {
            assert!(std::time::Instant::now() < deadline, "stop never ran");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(w.lifecycle().state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn http_run_ends_on_cancellation() {
        let w = wrapper(json!({ "type": "commandline", "config": { "command": "echo" } }));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let ct = CancellationToken::new();

        let run = w.run_with_listener(listener, ct.clone());
        let probe = async {
            let url = format!("http://{addr}/ready");
            let client = reqwest::Client::new();
            let mut status = None;
            for _ in 0..50 {
                if let Ok(resp) = client.get(&url).send().await {
                    status = Some(resp.status());
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            ct.cancel();
            status
        };

        let (outcome, status) = tokio::join!(run, probe);
        assert_eq!(outcome.expect("run"), RunOutcome::Completed);
        assert_eq!(status, Some(reqwest::StatusCode::OK));
        assert_eq!(w.state(), ServerState::Stopped);
    }
}
