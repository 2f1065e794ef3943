mod common;
mod common_mcp;

use anyhow::Context as _;
use common::{
    build_wrapper, echo_backend_bin, pick_unused_port, spawn_mcpify_http, tool_text, wait_http_ok,
    write_config,
};
use common_mcp::McpStreamableHttpSession;
use mcpify_wrapper::{RunOutcome, WrapperSettings};
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn echo_config(concurrency: &str, mode: &str) -> Value {
    let args = if mode == "persistent" {
        json!(["--persistent"])
    } else {
        json!([])
    };
    json!({
        "name": "echo-http",
        "description": "Echo backend over streamable HTTP",
        "backend": {
            "type": "process",
            "concurrency": concurrency,
            "config": { "command": echo_backend_bin(), "args": args, "mode": mode }
        },
        "tools": [
            { "name": "nap", "description": "Sleep, then answer", "args": ["sleep", "{ms}", "awake"],
              "parameters": [ { "name": "ms", "type": "integer", "description": "Milliseconds" } ] },
            { "name": "doze", "description": "Sleep, then answer differently", "args": ["sleep", "{ms}", "rested"],
              "parameters": [ { "name": "ms", "type": "integer", "description": "Milliseconds" } ] }
        ]
    })
}

async fn start_mcpify(
    dir: &tempfile::TempDir,
    config: &Value,
) -> anyhow::Result<(String, common::KillOnDrop)> {
    let cfg_path = write_config(dir.path(), "server", config)?;
    let port = pick_unused_port()?;
    let child = spawn_mcpify_http(&cfg_path, port)?;

    let base_url = format!("http://127.0.0.1:{port}");
    wait_http_ok(&format!("{base_url}/health"), Duration::from_secs(20)).await?;
    Ok((base_url, child))
}

#[tokio::test]
async fn aux_endpoints_report_running_backend() -> anyhow::Result<()> {
    let dir = tempdir().context("create temp dir")?;
    let (base_url, _mcpify) = start_mcpify(&dir, &echo_config("parallel_safe", "per_call")).await?;
    let client = reqwest::Client::new();

    let ready = client.get(format!("{base_url}/ready")).send().await?;
    assert_eq!(ready.status(), reqwest::StatusCode::OK);

    let status: Value = client
        .get(format!("{base_url}/status"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(status["name"], "echo-http");
    assert_eq!(status["backend"]["type"], "process");
    assert_eq!(status["backend"]["state"], "running");
    assert_eq!(status["tool_count"], 2);
    Ok(())
}

#[tokio::test]
async fn parallel_safe_calls_overlap() -> anyhow::Result<()> {
    let dir = tempdir().context("create temp dir")?;
    let (base_url, _mcpify) = start_mcpify(&dir, &echo_config("parallel_safe", "per_call")).await?;
    let session = McpStreamableHttpSession::connect(&base_url).await?;

    let list = session
        .request(1, "tools/list", json!({}), Duration::from_secs(10))
        .await?;
    assert_eq!(list.pointer("/result/tools/0/name"), Some(&json!("nap")));

    let started = Instant::now();
    let (a, b) = tokio::join!(
        session.call_tool(2, "nap", json!({ "ms": 800 }), Duration::from_secs(10)),
        session.call_tool(3, "doze", json!({ "ms": 800 }), Duration::from_secs(10)),
    );
    let elapsed = started.elapsed();

    assert_eq!(tool_text(&a?)?, "awake");
    assert_eq!(tool_text(&b?)?, "rested");
    assert!(elapsed < Duration::from_millis(1500), "elapsed={elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn serializable_persistent_backend_runs_one_call_at_a_time() -> anyhow::Result<()> {
    let dir = tempdir().context("create temp dir")?;
    let (base_url, _mcpify) = start_mcpify(&dir, &echo_config("serializable", "persistent")).await?;
    let session = McpStreamableHttpSession::connect(&base_url).await?;

    let started = Instant::now();
    let (a, b) = tokio::join!(
        session.call_tool(1, "nap", json!({ "ms": 400 }), Duration::from_secs(10)),
        session.call_tool(2, "doze", json!({ "ms": 400 }), Duration::from_secs(10)),
    );
    let elapsed = started.elapsed();

    assert_eq!(tool_text(&a?)?, "awake");
    assert_eq!(tool_text(&b?)?, "rested");
    assert!(elapsed >= Duration::from_millis(800), "elapsed={elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn bearer_token_protects_mcp_endpoint() -> anyhow::Result<()> {
    let settings = WrapperSettings {
        mcp_bearer_token: Some("s3cret".to_string()),
        ..WrapperSettings::default()
    };
    let wrapper = build_wrapper(echo_config("parallel_safe", "per_call"), settings)?;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let base_url = format!("http://{}", listener.local_addr()?);
    let ct = CancellationToken::new();

    let run = tokio::spawn({
        let wrapper = wrapper.clone();
        let ct = ct.clone();
        async move { wrapper.run_with_listener(listener, ct).await }
    });
    wait_http_ok(&format!("{base_url}/health"), Duration::from_secs(10)).await?;

    let client = reqwest::Client::new();
    let denied = client
        .post(format!("{base_url}/mcp"))
        .header("Accept", "application/json, text/event-stream")
        .json(&json!({ "jsonrpc": "2.0", "id": 0, "method": "tools/list" }))
        .send()
        .await?;
    assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

    ct.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(10), run).await???;
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(wrapper.lifecycle().stop_count(), 1);
    Ok(())
}
