use anyhow::Context as _;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Kills (and reaps) the wrapped child when dropped, so a failing test never leaks a server.
pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// Pick an unused TCP port on localhost.
///
/// Note: this does not reserve the port; it's still possible for another process to bind it
/// before you do.
///
/// # Errors
///
/// Returns an error if binding an ephemeral localhost port fails or if the bound socket's
/// local address cannot be read.
pub fn pick_unused_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("bind ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

/// Write a wrapper configuration document to `dir/<name>.json`.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_config(dir: &Path, name: &str, config: &serde_json::Value) -> anyhow::Result<PathBuf> {
    let path = dir.join(format!("{name}.json"));
    std::fs::write(&path, serde_json::to_vec_pretty(config)?)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Launch `mcpify serve <config> --mode streamable-http` on `127.0.0.1:<port>`.
///
/// # Errors
///
/// Returns an error if the binary cannot be spawned.
pub fn spawn_http_server(bin: &str, config: &Path, port: u16) -> anyhow::Result<KillOnDrop> {
    let child = Command::new(bin)
        .arg("serve")
        .arg(config)
        .args(["--mode", "streamable-http", "--host", "127.0.0.1"])
        .args(["--port", &port.to_string()])
        .env("MCPIFY_LOG", "info")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("spawn {bin}"))?;
    Ok(KillOnDrop(child))
}

/// Poll an HTTP URL until it returns a success status (2xx/3xx).
///
/// # Errors
///
/// Returns an error if the timeout elapses before the endpoint returns a success status.
pub async fn wait_http_ok(url: &str, timeout_dur: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout_dur {
            anyhow::bail!("timed out waiting for {url}");
        }

        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
}
