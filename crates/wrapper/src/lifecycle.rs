//! Backend lifecycle: brackets the server run with `start()` / `stop()`.

use crate::backend::{BackendAdapter, BackendKind, RuntimeSession};
use crate::error::{Result, WrapperError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Never started, or the last start failed.
    Idle,
    Starting,
    Running,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "idle"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot of the backend for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub kind: BackendKind,
    pub state: LifecycleState,
    pub restart_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub stop_count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub teardown_errors: Vec<String>,
}

#[derive(Debug)]
struct Inner {
    state: LifecycleState,
    session: Option<Arc<RuntimeSession>>,
    started_at: Option<DateTime<Utc>>,
    stop_count: u64,
    teardown_errors: Vec<String>,
}

/// Owns the backend's [`RuntimeSession`].
#[derive(Debug)]
pub struct LifecycleManager {
    name: String,
    adapter: BackendAdapter,
    startup_timeout: Duration,
    stop_timeout: Duration,
    /// Serializes `start()` and `stop()` against each other.
    transition: Mutex<()>,
    inner: RwLock<Inner>,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        adapter: BackendAdapter,
        startup_timeout: Duration,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            adapter,
            startup_timeout,
            stop_timeout,
            transition: Mutex::new(()),
            inner: RwLock::new(Inner {
                state: LifecycleState::Idle,
                session: None,
                started_at: None,
                stop_count: 0,
                teardown_errors: Vec::new(),
            }),
        }
    }

    /// Establish the runtime session. A no-op returning the existing session when already running.
    ///
    /// # Errors
    ///
    /// Returns [`WrapperError::Startup`] if the backend cannot be brought up within the startup
    /// timeout.
    pub async fn start(&self) -> Result<Arc<RuntimeSession>> {
        let _transition = self.transition.lock().await;
        if let Some(session) = self.inner.read().session.clone() {
            return Ok(session);
        }

        self.inner.write().state = LifecycleState::Starting;
        tracing::info!(backend = %self.name, kind = %self.adapter.kind(), "Starting backend");

        let opened = tokio::time::timeout(
            self.startup_timeout,
            self.adapter.open_session(&self.name, self.stop_timeout),
        )
        .await;

        let session = match opened {
            Ok(Ok(session)) => Arc::new(session),
            Ok(Err(e)) => {
                self.inner.write().state = LifecycleState::Idle;
                return Err(match e {
                    WrapperError::Startup(_) => e,
                    other => WrapperError::Startup(other.to_string()),
                });
            }
            Err(_) => {
                self.inner.write().state = LifecycleState::Idle;
                return Err(WrapperError::Startup(format!(
                    "Backend '{}' did not start within {}s",
                    self.name,
                    self.startup_timeout.as_secs_f64()
                )));
            }
        };

        {
            let mut inner = self.inner.write();
            inner.session = Some(Arc::clone(&session));
            inner.state = LifecycleState::Running;
            inner.started_at = Some(Utc::now());
        }
        tracing::info!(backend = %self.name, "Backend running");
        Ok(session)
    }

    /// Release the runtime session.
    ///
    /// Idempotent, and never fails: teardown problems are logged and kept in
    /// [`LifecycleManager::teardown_errors`].
    pub async fn stop(&self) {
        let _transition = self.transition.lock().await;
        let Some(session) = self.inner.write().session.take() else {
            return;
        };

        tracing::info!(backend = %self.name, "Stopping backend");
        let errors = session.close().await;
        for e in &errors {
            tracing::warn!(backend = %self.name, error = %e, "Backend teardown failed");
        }

        let mut inner = self.inner.write();
        inner.state = LifecycleState::Stopped;
        inner.stop_count += 1;
        inner.teardown_errors.extend(errors);
    }

    /// The running session, if any.
    pub(crate) fn session(&self) -> Option<Arc<RuntimeSession>> {
        self.inner.read().session.clone()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.read().state
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Number of completed `stop()` calls that actually released a session.
    #[must_use]
    pub fn stop_count(&self) -> u64 {
        self.inner.read().stop_count
    }

    #[must_use]
    pub fn teardown_errors(&self) -> Vec<String> {
        self.inner.read().teardown_errors.clone()
    }

    #[must_use]
    pub fn status(&self) -> BackendStatus {
        let inner = self.inner.read();
        BackendStatus {
            name: self.name.clone(),
            kind: self.adapter.kind(),
            state: inner.state,
            restart_count: inner.session.as_ref().map_or(0, |s| s.restarts()),
            started_at: inner.started_at,
            stop_count: inner.stop_count,
            teardown_errors: inner.teardown_errors.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendSpec;
    use serde_json::{Value, json};

    fn adapter(kind: &str, config: Value) -> BackendAdapter {
        BackendAdapter::resolve(&BackendSpec {
            kind: kind.to_string(),
            concurrency: None,
            config,
        })
        .expect("resolve")
    }

    fn manager(adapter: BackendAdapter, startup: Duration) -> LifecycleManager {
        LifecycleManager::new("test", adapter, startup, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let lm = manager(
            adapter("process", json!({"command": "sleep", "args": ["30"], "mode": "persistent"})),
            Duration::from_secs(5),
        );
        let first = lm.start().await.expect("start");
        let second = lm.start().await.expect("start again");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(lm.is_running());
        assert!(lm.status().started_at.is_some());
        lm.stop().await;
    }

    #[tokio::test]
    async fn stop_twice_matches_stop_once() {
        let lm = manager(
            adapter("process", json!({"command": "sleep", "args": ["30"], "mode": "persistent"})),
            Duration::from_secs(5),
        );
        lm.start().await.expect("start");

        lm.stop().await;
        let after_first = (lm.state(), lm.stop_count(), lm.teardown_errors());
        lm.stop().await;
        let after_second = (lm.state(), lm.stop_count(), lm.teardown_errors());

        assert_eq!(after_first, after_second);
        assert_eq!(after_first.0, LifecycleState::Stopped);
        assert_eq!(after_first.1, 1);
        assert!(lm.session().is_none());
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let lm = manager(adapter("commandline", json!({"command": "echo"})), Duration::from_secs(1));
        lm.stop().await;
        assert_eq!(lm.state(), LifecycleState::Idle);
        assert_eq!(lm.stop_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_http_backend_fails_within_startup_timeout() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        drop(listener);

        let lm = manager(adapter("http", json!({"base_url": base})), Duration::from_millis(300));
        let started = std::time::Instant::now();
        let err = lm.start().await.unwrap_err();

        assert!(matches!(err, WrapperError::Startup(_)), "err={err}");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(lm.state(), LifecycleState::Idle);
        assert!(lm.session().is_none());
    }

    #[tokio::test]
    async fn spawn_failure_is_startup_error() {
        let lm = manager(
            adapter(
                "process",
                json!({"command": "/nonexistent/mcpify-backend", "mode": "persistent"}),
            ),
            Duration::from_secs(1),
        );
        let err = lm.start().await.unwrap_err();
        assert!(matches!(err, WrapperError::Startup(_)), "err={err}");
    }

    #[tokio::test]
    async fn concurrent_stops_release_once() {
        let lm = Arc::new(manager(
            adapter("process", json!({"command": "sleep", "args": ["30"], "mode": "persistent"})),
            Duration::from_secs(5),
        ));
        lm.start().await.expect("start");

        let a = tokio::spawn({
            let lm = Arc::clone(&lm);
            async move { lm.stop().await }
        });
        let b = tokio::spawn({
            let lm = Arc::clone(&lm);
            async move { lm.stop().await }
        });
        a.await.expect("join a");
        b.await.expect("join b");

        assert_eq!(lm.stop_count(), 1);
        assert!(lm.teardown_errors().is_empty());
    }
}
