//! The two transports: a framed stdio stream and a streamable-HTTP listener.
//!
//! Both serve the same [`WrapperMcpServer`]; they differ only in how requests arrive and how
//! responses leave.

use crate::error::{Result, WrapperError};
use crate::http::{AppState, create_router, with_optional_bearer_auth, with_request_counting};
use crate::mcp_server::WrapperMcpServer;
use rmcp::ServiceExt;
use rmcp::service::ServerInitializeError;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::{StreamableHttpServerConfig, StreamableHttpService};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Where the server accepts requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Newline-delimited JSON-RPC on stdin/stdout; one consumer, strictly sequential.
    Stdio,
    /// MCP streamable HTTP at `/mcp` plus auxiliary endpoints.
    StreamableHttp { host: String, port: u16 },
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Stdio => write!(f, "stdio"),
            Transport::StreamableHttp { host, port } => write!(f, "streamable-http://{host}:{port}"),
        }
    }
}

/// Serve MCP over a byte stream pair until the input closes or `ct` is cancelled.
pub(crate) async fn serve_stdio<R, W>(
    server: WrapperMcpServer,
    reader: R,
    writer: W,
    ct: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let running = match server.serve_with_ct((reader, writer), ct).await {
        Ok(running) => running,
        Err(ServerInitializeError::ConnectionClosed(context)) => {
            tracing::info!(context = %context, "stdio input closed before initialization");
            return Ok(());
        }
        Err(e) => {
            return Err(WrapperError::Runtime(format!(
                "MCP stdio initialization failed: {e}"
            )));
        }
    };
    tracing::info!("Serving MCP over stdio");

    let reason = running
        .waiting()
        .await
        .map_err(|e| WrapperError::Runtime(format!("MCP stdio service failed: {e}")))?;
    tracing::info!(reason = ?reason, "stdio session ended");
    Ok(())
}

fn build_streamable_http_service(
    server: WrapperMcpServer,
    ct: &CancellationToken,
) -> StreamableHttpService<WrapperMcpServer, LocalSessionManager> {
    StreamableHttpService::new(
        move || Ok(server.clone()),
        Arc::new(LocalSessionManager::default()),
        StreamableHttpServerConfig {
            stateful_mode: true,
            sse_keep_alive: Some(Duration::from_secs(15)),
            // First stream event stays a JSON data frame rather than a retry hint.
            sse_retry: None,
            cancellation_token: ct.child_token(),
        },
    )
}

/// Serve `/mcp` and the auxiliary endpoints on `listener` until `ct` is cancelled.
///
/// In-flight requests are allowed to finish before this returns.
pub(crate) async fn serve_streamable_http(
    server: WrapperMcpServer,
    state: Arc<AppState>,
    listener: TcpListener,
    ct: CancellationToken,
) -> Result<()> {
    let mcp = build_streamable_http_service(server, &ct);
    let app = with_request_counting(
        with_optional_bearer_auth(
            create_router(Arc::clone(&state)).nest_service("/mcp", mcp),
            Arc::clone(&state),
        ),
        state,
    );

    let addr = listener.local_addr()?;
    tracing::info!("Serving MCP over streamable HTTP on http://{}/mcp", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(ct.cancelled_owned())
        .await
        .map_err(|e| WrapperError::Runtime(format!("HTTP server failed: {e}")))
}

/// Bind the HTTP listener for `host:port`.
pub(crate) async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port))
        .await
        .map_err(|e| WrapperError::Runtime(format!("Failed to bind {host}:{port}: {e}")))
}

/// Cancel `ct` on SIGINT or SIGTERM.
pub(crate) fn spawn_shutdown_signal(ct: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            () = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
            () = ct.cancelled() => return,
        }
        ct.cancel();
    })
}
