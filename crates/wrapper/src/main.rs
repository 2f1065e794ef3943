//! mcpify
//!
//! Serve a JSON-described backend and tool list as an MCP server.

use anyhow::Context as _;
use clap::Parser;
use mcpify_wrapper::config::{CliArgs, Command, Mode, ServeArgs, ViewArgs, effective_log_level};
use mcpify_wrapper::{RunOutcome, ServerConfig, Transport, Wrapper, WrapperSettings};
use std::io::{IsTerminal as _, stderr};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> ExitCode {
    let cli = CliArgs::parse();
    init_logging(&effective_log_level(&cli));

    let result = match cli.command {
        Command::Serve(args) => serve(&args),
        Command::View(args) => view(&args),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "mcpify failed");
            ExitCode::FAILURE
        }
    }
}

/// Run the server; `Ok(false)` means the run started but ended with a failure.
fn serve(args: &ServeArgs) -> anyhow::Result<bool> {
    let config = ServerConfig::load(&args.config)?;
    let settings = WrapperSettings::from_serve_args(args);

    tracing::info!("Starting mcpify v{}", VERSION);

    let (transport, runtime) = match args.mode {
        // One consumer, one request at a time.
        Mode::Stdio => (
            Transport::Stdio,
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("build tokio runtime")?,
        ),
        Mode::StreamableHttp => (
            Transport::StreamableHttp {
                host: args.host.clone(),
                port: args.port,
            },
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("build tokio runtime")?,
        ),
    };

    let outcome = runtime.block_on(async move {
        let wrapper = Wrapper::build(&config, settings)?;
        wrapper.run(transport).await
    });
    // A blocking stdin reader may still be parked; don't wait for it.
    runtime.shutdown_background();

    match outcome? {
        RunOutcome::Completed => {
            tracing::info!("mcpify shut down gracefully");
            Ok(true)
        }
        RunOutcome::Failed(reason) => {
            tracing::error!(reason = %reason, "mcpify run failed");
            Ok(false)
        }
    }
}

fn view(args: &ViewArgs) -> anyhow::Result<bool> {
    let config = ServerConfig::load(&args.config)?;
    let wrapper = Wrapper::build(&config, WrapperSettings::default())?;
    let registry = wrapper.registry();

    println!("Name: {}", config.name);
    if !config.description.trim().is_empty() {
        println!("Description: {}", config.description.trim());
    }
    println!(
        "Backend: {} ({}, {})",
        config.backend.kind,
        registry.adapter().kind(),
        registry.concurrency()
    );
    println!("Tools ({}):", registry.len());
    for handler in registry.handlers() {
        println!("  - {}: {}", handler.name(), handler.description());
        for p in handler.parameters() {
            let required = if p.required { "required" } else { "optional" };
            println!(
                "      {} ({}, {}): {}",
                p.name, p.param_type, required, p.description
            );
        }
    }
    Ok(true)
}

/// Initialize logging based on the log level string.
///
/// Logs go to stderr; stdout carries the stdio protocol.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Check if stderr is a TTY for format selection
    let is_tty = stderr().is_terminal();

    if is_tty {
        // Human-readable format for development
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        // JSON format for production
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
