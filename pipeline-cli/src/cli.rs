//! ABOUTME: Command-line argument parsing: global flags and the run/
//! ABOUTME: validate/info/exec subcommand hierarchy.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Trace level for logging output, used only when `RUST_LOG` is unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TraceLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<TraceLevel> for tracing::Level {
    fn from(trace_level: TraceLevel) -> Self {
        match trace_level {
            TraceLevel::Off => tracing::Level::ERROR,
            TraceLevel::Error => tracing::Level::ERROR,
            TraceLevel::Warn => tracing::Level::WARN,
            TraceLevel::Info => tracing::Level::INFO,
            TraceLevel::Debug => tracing::Level::DEBUG,
            TraceLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

/// Command-line interface for the pipeline orchestrator.
#[derive(Parser, Debug)]
#[command(name = "pipeline")]
#[command(version)]
#[command(about = "Runs declarative LLM pipelines described as YAML workflow documents")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Runtime config file (GLOBAL)
    #[arg(short = 'c', long, global = true, env = "PIPELINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Trace level, used only when RUST_LOG is unset (GLOBAL)
    #[arg(long, global = true, value_enum, default_value = "warn")]
    pub trace: TraceLevel,

    /// Output format (GLOBAL)
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a workflow document end to end
    Run {
        /// Path to the workflow YAML document
        workflow: PathBuf,

        /// Input binding `key=value`; value is parsed as JSON, falling back
        /// to a plain string. May be repeated.
        #[arg(long = "input", value_parser = parse_key_val)]
        inputs: Vec<(String, String)>,

        /// Directory to resolve `nested_pipeline` paths relative to
        /// (defaults to the workflow file's own directory)
        #[arg(long)]
        workspace_dir: Option<PathBuf>,
    },

    /// Parse and validate a workflow document without running it
    Validate {
        /// Path to the workflow YAML document
        workflow: PathBuf,
    },

    /// Print a workflow document's inputs, steps, and functions
    Info {
        /// Path to the workflow YAML document
        workflow: PathBuf,
    },

    /// Run a single ad hoc step, for smoke-testing a step definition outside
    /// of a full workflow document
    Exec {
        /// Path to a YAML document containing exactly one step (name + type
        /// + its fields)
        step: PathBuf,

        /// Input binding `key=value`, as for `run`
        #[arg(long = "input", value_parser = parse_key_val)]
        inputs: Vec<(String, String)>,
    },
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    Ok((key.to_string(), value.to_string()))
}
