//! Tiny backend process used only for wrapper integration tests.
//!
//! Per-call mode takes a verb and its arguments on the command line:
//! - `echo <words...>`: print the words joined by spaces
//! - `sleep <ms> <words...>`: sleep, then echo
//! - `fail <code> <message...>`: print the message on stderr and exit with `code`
//! - `json <key> <value>`: print `{"<key>": "<value>"}`
//! - `env <VAR>`: print the value of an environment variable
//!
//! With `--persistent` it reads one JSON request per line from stdin and answers each with a
//! JSON line carrying the same `id`. The first rendered arg picks the verb as above, plus
//! `count`, `arguments`, `noisy` (stray lines first) and `crash` (exit after answering).

use serde_json::{Value, json};
use std::io::{BufRead as _, Write};
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("--persistent") {
        return serve_persistent();
    }

    let (verb, rest) = args.split_first().map_or(("echo", &[][..]), |(v, r)| (v.as_str(), r));
    match verb {
        "echo" => println!("{}", rest.join(" ")),
        "sleep" => {
            let ms = rest.first().and_then(|s| s.parse().ok()).unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            println!("{}", rest.get(1..).unwrap_or_default().join(" "));
        }
        "fail" => {
            let code = rest.first().and_then(|s| s.parse().ok()).unwrap_or(1);
            eprintln!("{}", rest.get(1..).unwrap_or_default().join(" "));
            std::process::exit(code);
        }
        "json" => {
            let mut object = serde_json::Map::new();
            object.insert(
                rest.first().cloned().unwrap_or_default(),
                Value::String(rest.get(1).cloned().unwrap_or_default()),
            );
            println!("{}", Value::Object(object));
        }
        "env" => {
            let name = rest.first().cloned().unwrap_or_default();
            println!("{}", std::env::var(name).unwrap_or_default());
        }
        other => anyhow::bail!("unknown verb: {other}"),
    }
    Ok(())
}

fn serve_persistent() -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();
    let mut calls: u64 = 0;

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let Ok(request) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        calls += 1;
        let args = rendered_args(&request);
        let (verb, rest) = args.split_first().map_or(("echo", &[][..]), |(v, r)| (v.as_str(), r));
        eprintln!("echo-backend: call {calls} tool={} verb={verb}", request["tool"]);

        if verb == "noisy" {
            writeln!(stdout, "starting work...")?;
            writeln!(stdout, "{}", json!({ "id": -1, "output": "stale" }))?;
        }
        let response = respond(verb, rest, &request, id, calls);
        writeln!(stdout, "{response}")?;
        stdout.flush()?;

        if verb == "crash" {
            // Exit right after answering so the next call finds a dead pipe.
            std::process::exit(3);
        }
    }
    Ok(())
}

fn rendered_args(request: &Value) -> Vec<String> {
    request["args"]
        .as_array()
        .map(|a| {
            a.iter()
                .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn respond(verb: &str, rest: &[String], request: &Value, id: Value, calls: u64) -> Value {
    match verb {
        "fail" => json!({ "id": id, "error": rest.join(" ") }),
        "sleep" => {
            let ms = rest.first().and_then(|s| s.parse().ok()).unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            json!({ "id": id, "output": rest.get(1..).unwrap_or_default().join(" ") })
        }
        "count" => json!({ "id": id, "output": { "calls": calls, "pid": std::process::id() } }),
        "arguments" => json!({ "id": id, "output": request["arguments"] }),
        _ => json!({ "id": id, "output": rest.join(" ") }),
    }
}
