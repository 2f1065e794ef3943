use anyhow::Context as _;
use mcpify_wrapper::{ServerConfig, Wrapper, WrapperSettings};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, DuplexStream, Lines};
use tokio::io::{ReadHalf, WriteHalf};

pub use mcpify_test_support::{KillOnDrop, pick_unused_port, wait_http_ok, write_config};

#[allow(dead_code)]
pub fn echo_backend_bin() -> &'static str {
    env!("CARGO_BIN_EXE_mcpify-echo-backend")
}

#[allow(dead_code)]
pub fn spawn_mcpify_http(config_path: &std::path::Path, port: u16) -> anyhow::Result<KillOnDrop> {
    mcpify_test_support::spawn_http_server(env!("CARGO_BIN_EXE_mcpify"), config_path, port)
}

#[allow(dead_code)]
pub fn build_wrapper(config: Value, settings: WrapperSettings) -> anyhow::Result<Arc<Wrapper>> {
    let config: ServerConfig = serde_json::from_value(config).context("parse config")?;
    Ok(Arc::new(Wrapper::build(&config, settings)?))
}

/// Newline-delimited JSON-RPC client for the wrapper's stdio transport.
pub struct StdioClient {
    writer: WriteHalf<DuplexStream>,
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
}

#[allow(dead_code)]
impl StdioClient {
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            writer,
            lines: BufReader::new(reader).lines(),
        }
    }

    pub async fn send(&mut self, msg: &Value) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn next_message(&mut self) -> anyhow::Result<Value> {
        let line = self
            .lines
            .next_line()
            .await?
            .context("stdio stream closed")?;
        serde_json::from_str(&line).context("parse response line")
    }

    /// Next message that carries `id`, skipping notifications and other responses.
    pub async fn recv(&mut self, id: u64, timeout_dur: Duration) -> anyhow::Result<Value> {
        let deadline = tokio::time::Instant::now() + timeout_dur;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.next_message())
                .await
                .context("timeout waiting for response")??;
            if msg.get("id") == Some(&json!(id)) {
                return Ok(msg);
            }
        }
    }

    /// Next response of any id, skipping notifications.
    pub async fn recv_any(&mut self, timeout_dur: Duration) -> anyhow::Result<Value> {
        let deadline = tokio::time::Instant::now() + timeout_dur;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.next_message())
                .await
                .context("timeout waiting for response")??;
            if msg.get("id").is_some() {
                return Ok(msg);
            }
        }
    }

    pub async fn request(
        &mut self,
        id: u64,
        method: &str,
        params: Value,
        timeout_dur: Duration,
    ) -> anyhow::Result<Value> {
        self.send(&json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .await?;
        self.recv(id, timeout_dur).await
    }

    pub async fn initialize(&mut self) -> anyhow::Result<Value> {
        let init = self
            .request(
                0,
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": { "name": "mcpify-integration-tests", "version": "0" }
                }),
                Duration::from_secs(10),
            )
            .await?;
        self.send(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await?;
        Ok(init)
    }

    pub async fn call_tool(
        &mut self,
        id: u64,
        name: &str,
        arguments: Value,
        timeout_dur: Duration,
    ) -> anyhow::Result<Value> {
        self.request(
            id,
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
            timeout_dur,
        )
        .await
    }

    /// Closes the client's write side, which ends the server's input.
    pub async fn close(mut self) -> anyhow::Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// First text block of a `tools/call` result.
#[allow(dead_code)]
pub fn tool_text(msg: &Value) -> anyhow::Result<String> {
    msg.pointer("/result/content/0/text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .with_context(|| format!("tools/call missing result.content[0].text: {msg}"))
}

#[allow(dead_code)]
pub fn is_tool_error(msg: &Value) -> bool {
    msg.pointer("/result/isError") == Some(&json!(true))
}
