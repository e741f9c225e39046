//! ABOUTME: Entry point for the pipeline CLI binary.
//! ABOUTME: Parses arguments, sets up tracing, and dispatches to a command.

use anyhow::Result;
use clap::Parser;
use pipeline_cli::cli::{Cli, TraceLevel};
use pipeline_cli::commands::execute_command;
use pipeline_cli::config::load_runtime_config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(cli.trace);

    let runtime_config = load_runtime_config(cli.config.as_deref())?;
    execute_command(cli.command, runtime_config, cli.output).await
}

/// Priority: `RUST_LOG` env var, then `--trace`. Tracing output always goes
/// to stderr so a command's stdout stays clean for piping.
fn setup_tracing(trace_level: TraceLevel) {
    use std::io;
    use tracing_subscriber::EnvFilter;

    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(io::stderr)
            .with_target(false)
            .init();
    } else {
        let level: tracing::Level = trace_level.into();
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(io::stderr)
            .with_target(false)
            .init();
    }
}
