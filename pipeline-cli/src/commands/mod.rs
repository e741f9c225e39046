//! ABOUTME: Command dispatch: routes a parsed `Commands` variant to its
//! ABOUTME: handler and shares the input-binding parsing both use.

pub mod exec;
pub mod info;
pub mod run;
pub mod validate;

use crate::cli::{Commands, OutputFormat};
use crate::config::RuntimeConfig;
use anyhow::Result;
use pipeline_core::Value;
use std::collections::BTreeMap;

pub async fn execute_command(
    command: Commands,
    runtime_config: RuntimeConfig,
    output: OutputFormat,
) -> Result<()> {
    match command {
        Commands::Run {
            workflow,
            inputs,
            workspace_dir,
        } => run::run(&workflow, parse_inputs(&inputs), workspace_dir, &runtime_config, output).await,
        Commands::Validate { workflow } => validate::validate(&workflow, output),
        Commands::Info { workflow } => info::info(&workflow, output),
        Commands::Exec { step, inputs } => {
            exec::exec(&step, parse_inputs(&inputs), &runtime_config, output).await
        }
    }
}

/// Parse `--input key=value` pairs into a `Value` map: each value is parsed
/// as JSON first (so `--input count=3` or `--input flags=[1,2]` work),
/// falling back to a plain string for anything that isn't valid JSON.
fn parse_inputs(pairs: &[(String, String)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(key, raw)| {
            let value = serde_json::from_str::<serde_json::Value>(raw)
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(raw.as_str()));
            (key.clone(), value)
        })
        .collect()
}
