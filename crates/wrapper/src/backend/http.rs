//! HTTP backends.
//!
//! A tool's first arg is its request line, e.g. `"POST /users/{id}?verbose={verbose}"`. Arguments
//! the request line does not consume are sent as a JSON body (`POST`/`PUT`/`PATCH`) or appended
//! as extra query pairs.

use super::process::{StderrTail, spawn_command, spawn_line_drain, terminate};
use super::{OutputFormat, truncate};
use crate::error::{BackendError, BackendErrorKind, Result, WrapperError};
use crate::template::{JsonObject, Template, value_to_string};
use base64::Engine;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use url::Url;

const PROBE_INTERVAL: Duration = Duration::from_millis(100);
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_ERROR_BODY_BYTES: usize = 4096;

/// `backend.config` for HTTP backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpBackendConfig {
    pub base_url: String,
    /// Per-call timeout override (seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Static headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Path probed by `start()`; defaults to `/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,
    #[serde(default = "default_true")]
    pub probe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputFormat>,
    /// Local web app launched for the session's lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ManagedServerConfig>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl HttpBackendConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            WrapperError::Config(format!("Invalid base_url '{}': {}", self.base_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(WrapperError::Config(format!(
                "base_url '{}' must use http or https",
                self.base_url
            )));
        }
        self.header_map()?;
        if let Some(server) = &self.server
            && server.command.trim().is_empty()
        {
            return Err(WrapperError::Config(
                "HTTP backend 'server.command' must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn output_format(&self) -> OutputFormat {
        self.output.unwrap_or(OutputFormat::Json)
    }

    fn header_map(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (k, v) in &self.headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| WrapperError::Config(format!("Invalid header name '{k}': {e}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| WrapperError::Config(format!("Invalid value for header '{k}': {e}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

/// An HTTP tool compiled from its request line.
#[derive(Debug, Clone)]
pub struct HttpInvocation {
    method: Method,
    path: Template,
    query: Vec<(String, Template)>,
    extra: Vec<Template>,
}

/// A fully rendered request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestParts {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpInvocation {
    pub(crate) fn parse(args: &[String]) -> std::result::Result<Self, String> {
        let Some(line) = args.first().map(|s| s.trim()).filter(|s| !s.is_empty()) else {
            return Err("HTTP tools need a request line such as 'GET /path' as args[0]".to_string());
        };

        let (method, target) = match line.split_once(char::is_whitespace) {
            Some((m, rest)) if !m.starts_with('/') => {
                let method = Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| format!("Invalid HTTP method '{m}' in '{line}'"))?;
                (method, rest.trim())
            }
            _ => (Method::GET, line),
        };

        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (target, None),
        };
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let path = Template::parse(&path)?;

        let mut pairs = Vec::new();
        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            pairs.push((k.to_string(), Template::parse(v)?));
        }

        let extra = args[1..]
            .iter()
            .map(|a| Template::parse(a))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            method,
            path,
            query: pairs,
            extra,
        })
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub(crate) fn placeholders(&self) -> BTreeSet<String> {
        self.path
            .placeholders()
            .chain(self.query.iter().flat_map(|(_, t)| t.placeholders()))
            .chain(self.extra.iter().flat_map(Template::placeholders))
            .map(str::to_string)
            .collect()
    }

    pub(crate) fn path_placeholders(&self) -> BTreeSet<String> {
        self.path.placeholders().map(str::to_string).collect()
    }

    /// Render the request for `arguments`.
    ///
    /// # Errors
    ///
    /// Returns the name of the first path placeholder without a value.
    pub fn render(&self, arguments: &JsonObject) -> std::result::Result<RequestParts, String> {
        let path = self
            .path
            .render_with(arguments, encode_component)
            .ok_or_else(|| {
                self.path
                    .placeholders()
                    .find(|p| arguments.get(*p).is_none_or(Value::is_null))
                    .unwrap_or_default()
                    .to_string()
            })?;

        let mut consumed: BTreeSet<&str> = self.path.placeholders().collect();
        let mut query = Vec::new();
        for (key, template) in &self.query {
            consumed.extend(template.placeholders());
            if let Some(v) = template.render(arguments) {
                query.push((key.clone(), v));
            }
        }

        let rest: JsonObject = arguments
            .iter()
            .filter(|(k, v)| !consumed.contains(k.as_str()) && !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let sends_body = [Method::POST, Method::PUT, Method::PATCH].contains(&self.method);
        let body = if sends_body {
            Some(Value::Object(rest))
        } else {
            query.extend(rest.iter().map(|(k, v)| (k.clone(), value_to_string(v))));
            None
        };

        Ok(RequestParts {
            method: self.method.clone(),
            path,
            query,
            body,
        })
    }
}

/// Runtime session of an HTTP backend: a pooled client and, optionally, the app process it serves.
#[derive(Debug)]
pub struct HttpSession {
    name: String,
    config: Arc<HttpBackendConfig>,
    client: reqwest::Client,
    server: Mutex<Option<Child>>,
    server_output: StderrTail,
    stop_timeout: Duration,
}

impl HttpSession {
    pub(crate) async fn open(
        name: &str,
        config: Arc<HttpBackendConfig>,
        stop_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .default_headers(config.header_map()?)
            .build()
            .map_err(|e| WrapperError::Startup(format!("Failed to build HTTP client: {e}")))?;

        let server_output = StderrTail::default();
        let mut server = match &config.server {
            Some(server) => Some(launch_server(name, server, &server_output)?),
            None => None,
        };

        if config.probe {
            let health_path = config.health_path.as_deref().unwrap_or("/");
            let url = build_url(&config.base_url, &normalize_path(health_path), &[])
                .map_err(WrapperError::Startup)?;
            wait_reachable(name, &client, &url, server.as_mut(), &server_output).await?;
            tracing::info!(backend = %name, url = %url, "HTTP backend is reachable");
        }

        Ok(Self {
            name: name.to_string(),
            config,
            client,
            server: Mutex::new(server),
            server_output,
            stop_timeout,
        })
    }

    pub(crate) async fn invoke(
        &self,
        tool: &str,
        invocation: &HttpInvocation,
        arguments: &JsonObject,
        timeout: Duration,
    ) -> std::result::Result<Value, BackendError> {
        let parts = invocation.render(arguments).map_err(|missing| {
            BackendError::connection_failure(format!(
                "Cannot build request for tool '{tool}': missing path parameter '{missing}'"
            ))
        })?;
        let url = build_url(&self.config.base_url, &parts.path, &parts.query)
            .map_err(BackendError::connection_failure)?;

        tracing::debug!(backend = %self.name, tool = %tool, method = %parts.method, url = %url, "HTTP backend request");

        let mut request = self.client.request(parts.method, url).timeout(timeout);
        if let Some(body) = &parts.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(tool, timeout, e))?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(tool, timeout, e))?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(BackendError::new(
                BackendErrorKind::HttpStatus,
                format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                ),
            )
            .with_exit_status(Some(i32::from(status.as_u16())))
            .with_stderr(truncate(&body, MAX_ERROR_BODY_BYTES)));
        }

        decode_body(&bytes, content_type.as_deref(), self.config.output_format())
    }

    pub(crate) async fn close(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(mut child) = self.server.lock().await.take() {
            if let Err(e) = terminate(&mut child, self.stop_timeout).await {
                errors.push(format!("backend '{}' server: {}", self.name, e));
            } else {
                tracing::info!(backend = %self.name, "Stopped HTTP backend server process");
            }
        }
        errors
    }
}

fn launch_server(name: &str, server: &ManagedServerConfig, output: &StderrTail) -> Result<Child> {
    let mut cmd = spawn_command(
        &server.command,
        &server.args,
        server.cwd.as_deref(),
        &server.env,
        &[],
    );
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| {
        WrapperError::Startup(format!(
            "Failed to launch server '{}' for backend '{}': {}",
            server.command, name, e
        ))
    })?;
    if let Some(stdout) = child.stdout.take() {
        spawn_line_drain(name.to_string(), stdout, output.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_drain(name.to_string(), stderr, output.clone());
    }
    tracing::info!(backend = %name, pid = ?child.id(), "Launched HTTP backend server process");
    Ok(child)
}

/// Poll `url` until any HTTP response arrives. The caller bounds the wait.
async fn wait_reachable(
    name: &str,
    client: &reqwest::Client,
    url: &Url,
    mut server: Option<&mut Child>,
    server_output: &StderrTail,
) -> Result<()> {
    loop {
        match client
            .get(url.clone())
            .timeout(PROBE_REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) => tracing::debug!(backend = %name, error = %e, "HTTP backend not reachable yet"),
        }
        if let Some(child) = server.as_deref_mut()
            && let Ok(Some(status)) = child.try_wait()
        {
            let tail = server_output.text();
            return Err(WrapperError::Startup(format!(
                "Server process for backend '{name}' exited early with {status}{}",
                if tail.is_empty() {
                    String::new()
                } else {
                    format!(": {tail}")
                }
            )));
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

fn map_reqwest_error(tool: &str, timeout: Duration, e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::timeout(format!(
            "Tool '{}' timed out after {}ms",
            tool,
            timeout.as_millis()
        ))
    } else {
        // Drop the URL from the message; it may carry credentials in the query string.
        BackendError::connection_failure(format!(
            "HTTP request failed: {}",
            e.without_url()
        ))
    }
}

fn decode_body(
    bytes: &[u8],
    content_type: Option<&str>,
    format: OutputFormat,
) -> std::result::Result<Value, BackendError> {
    let Ok(text) = std::str::from_utf8(bytes) else {
        let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        return Ok(json!({
            "encoding": "base64",
            "mimeType": content_type,
            "data": b64
        }));
    };

    let declared_json = content_type.is_some_and(is_json_content_type);
    if declared_json {
        return serde_json::from_str(text).map_err(|e| {
            BackendError::malformed_output(format!("Response declared JSON but did not parse: {e}"))
                .with_stderr(truncate(text, MAX_ERROR_BODY_BYTES))
        });
    }
    match format {
        OutputFormat::Json => {
            Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
        }
        OutputFormat::Text => Ok(Value::String(text.to_string())),
    }
}

fn is_json_content_type(ct: &str) -> bool {
    let essence = ct.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn build_url(
    base_url: &str,
    path: &str,
    query: &[(String, String)],
) -> std::result::Result<Url, String> {
    let joined = format!("{}{}", base_url.trim_end_matches('/'), path);
    let mut url = Url::parse(&joined).map_err(|e| format!("Invalid URL '{joined}': {e}"))?;
    if !query.is_empty() {
        let mut qs = url.query().map(str::to_string).unwrap_or_default();
        for (k, v) in query {
            if !qs.is_empty() {
                qs.push('&');
            }
            qs.push_str(&encode_component(k));
            qs.push('=');
            qs.push_str(&encode_component(v));
        }
        url.set_query(Some(&qs));
    }
    Ok(url)
}

fn encode_component(s: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
    out
}
