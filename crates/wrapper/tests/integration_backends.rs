mod common;

use axum::extract::{Path, Query};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{StdioClient, build_wrapper, echo_backend_bin, is_tool_error, tool_text};
use mcpify_wrapper::{RunOutcome, Wrapper, WrapperSettings};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const CALL: Duration = Duration::from_secs(10);

async fn start_items_api() -> anyhow::Result<String> {
    async fn get_item(
        Path(id): Path<String>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        Json(json!({ "id": id, "query": query }))
    }

    async fn create_item(Json(body): Json<Value>) -> Json<Value> {
        Json(json!({ "created": body }))
    }

    let app = Router::new()
        .route("/items/{id}", get(get_item))
        .route("/items", post(create_item));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}", listener.local_addr()?);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(base)
}

fn serve_stdio(wrapper: &Arc<Wrapper>) -> (StdioClient, JoinHandle<mcpify_wrapper::Result<RunOutcome>>) {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(server_side);
    let run = tokio::spawn({
        let wrapper = Arc::clone(wrapper);
        async move { wrapper.run_with_io(reader, writer).await }
    });
    (StdioClient::new(client_side), run)
}

#[tokio::test]
async fn http_backend_routes_path_query_and_body() -> anyhow::Result<()> {
    let base = start_items_api().await?;
    let wrapper = build_wrapper(
        json!({
            "name": "items",
            "backend": { "type": "fastapi", "config": { "base_url": base } },
            "tools": [
                { "name": "get_item", "description": "Fetch an item", "args": ["GET /items/{id}?verbose={verbose}"],
                  "parameters": [
                    { "name": "id", "type": "string", "description": "Item id" },
                    { "name": "verbose", "type": "boolean", "description": "More detail", "required": false }
                  ] },
                { "name": "create_item", "description": "Create an item", "args": ["POST /items"],
                  "parameters": [
                    { "name": "name", "type": "string", "description": "Item name" },
                    { "name": "count", "type": "integer", "description": "How many", "default": 1 }
                  ] }
            ]
        }),
        WrapperSettings::default(),
    )?;
    let (mut client, run) = serve_stdio(&wrapper);
    client.initialize().await?;

    let fetched = client
        .call_tool(1, "get_item", json!({ "id": "a b", "verbose": "true" }), CALL)
        .await?;
    assert!(!is_tool_error(&fetched), "fetched={fetched}");
    assert_eq!(
        fetched.pointer("/result/structuredContent"),
        Some(&json!({ "id": "a b", "query": { "verbose": "true" } }))
    );

    let terse = client
        .call_tool(2, "get_item", json!({ "id": "42" }), CALL)
        .await?;
    assert_eq!(
        terse.pointer("/result/structuredContent"),
        Some(&json!({ "id": "42", "query": {} }))
    );

    let created = client
        .call_tool(3, "create_item", json!({ "name": "widget", "count": "3" }), CALL)
        .await?;
    assert_eq!(
        created.pointer("/result/structuredContent"),
        Some(&json!({ "created": { "name": "widget", "count": 3 } }))
    );

    let defaulted = client
        .call_tool(4, "create_item", json!({ "name": "gadget" }), CALL)
        .await?;
    assert_eq!(
        defaulted.pointer("/result/structuredContent/created/count"),
        Some(&json!(1))
    );

    // Missing path placeholder is rejected before any request is made.
    let missing = client.call_tool(5, "get_item", json!({}), CALL).await?;
    assert_eq!(missing.pointer("/error/code"), Some(&json!(-32602)));

    client.close().await?;
    assert_eq!(tokio::time::timeout(CALL, run).await???, RunOutcome::Completed);
    Ok(())
}

#[tokio::test]
async fn http_backend_errors_become_tool_errors() -> anyhow::Result<()> {
    let base = start_items_api().await?;
    let wrapper = build_wrapper(
        json!({
            "name": "items",
            "backend": { "type": "http", "config": { "base_url": base } },
            "tools": [
                { "name": "missing_route", "description": "Not served", "args": ["GET /nowhere/{id}"],
                  "parameters": [ { "name": "id", "type": "string", "description": "Id" } ] }
            ]
        }),
        WrapperSettings::default(),
    )?;
    let (mut client, run) = serve_stdio(&wrapper);
    client.initialize().await?;

    let result = client
        .call_tool(1, "missing_route", json!({ "id": "x" }), CALL)
        .await?;
    assert!(is_tool_error(&result), "result={result}");
    let error = result
        .pointer("/result/structuredContent/error")
        .cloned()
        .unwrap_or_default();
    assert_eq!(error["kind"], "http_status");
    assert_eq!(error["exitStatus"], 404);

    client.close().await?;
    assert!(tokio::time::timeout(CALL, run).await???.is_success());
    Ok(())
}

#[tokio::test]
async fn persistent_backend_keeps_one_process_and_recovers_from_crash() -> anyhow::Result<()> {
    let wrapper = build_wrapper(
        json!({
            "name": "echo-persistent",
            "backend": {
                "type": "cli",
                "config": { "command": echo_backend_bin(), "args": ["--persistent"], "mode": "persistent" }
            },
            "tools": [
                { "name": "say", "description": "Echo", "args": ["noisy", "{msg}"],
                  "parameters": [ { "name": "msg", "type": "string", "description": "Message" } ] },
                { "name": "count", "description": "Calls so far", "args": ["count"], "parameters": [] },
                { "name": "crash", "description": "Exit after answering", "args": ["crash"], "parameters": [] },
                { "name": "complain", "description": "Report an error", "args": ["fail", "{why}"],
                  "parameters": [ { "name": "why", "type": "string", "description": "Reason" } ] }
            ]
        }),
        WrapperSettings::default(),
    )?;
    let (mut client, run) = serve_stdio(&wrapper);
    client.initialize().await?;

    // Stray lines and stale ids from the backend are skipped.
    let said = client.call_tool(1, "say", json!({ "msg": "hi there" }), CALL).await?;
    assert_eq!(tool_text(&said)?, "hi there");

    let first = client.call_tool(2, "count", json!({}), CALL).await?;
    let first = first
        .pointer("/result/structuredContent")
        .cloned()
        .unwrap_or_default();
    assert_eq!(first["calls"], 2);

    let complained = client
        .call_tool(3, "complain", json!({ "why": "no such user" }), CALL)
        .await?;
    assert!(is_tool_error(&complained));
    assert_eq!(
        complained.pointer("/result/structuredContent/error/kind"),
        Some(&json!("process_failure"))
    );

    client.call_tool(4, "crash", json!({}), CALL).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let after = client.call_tool(5, "count", json!({}), CALL).await?;
    assert!(!is_tool_error(&after), "after={after}");
    let after = after
        .pointer("/result/structuredContent")
        .cloned()
        .unwrap_or_default();
    assert_eq!(after["calls"], 1);
    assert_ne!(after["pid"], first["pid"]);
    assert_eq!(wrapper.lifecycle().status().restart_count, 1);

    client.close().await?;
    assert!(tokio::time::timeout(CALL, run).await???.is_success());
    assert_eq!(wrapper.lifecycle().stop_count(), 1);
    Ok(())
}
