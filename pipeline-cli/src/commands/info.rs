//! ABOUTME: `pipeline info` — summarize a workflow document's inputs,
//! ABOUTME: steps, and declared functions without running it.

use crate::cli::OutputFormat;
use crate::output::format_value;
use anyhow::{Context, Result};
use std::path::Path;

pub fn info(workflow_path: &Path, output: OutputFormat) -> Result<()> {
    let workflow = pipeline_config::load_workflow(workflow_path)
        .with_context(|| format!("failed to load workflow '{}'", workflow_path.display()))?;

    let inputs: Vec<_> = workflow
        .inputs
        .iter()
        .map(|decl| {
            serde_json::json!({
                "name": decl.name,
                "required": decl.required,
                "has_default": decl.default.is_some(),
            })
        })
        .collect();

    let steps: Vec<_> = workflow
        .steps
        .iter()
        .map(|step| {
            serde_json::json!({
                "name": step.name,
                "type": step.kind.type_name(),
                "conditional": step.condition.is_some(),
            })
        })
        .collect();

    let summary = serde_json::json!({
        "name": workflow.name,
        "description": workflow.description,
        "checkpoint_enabled": workflow.checkpoint_enabled,
        "inputs": inputs,
        "steps": steps,
        "functions": workflow.functions.keys().collect::<Vec<_>>(),
    });

    println!("{}", format_value(&summary, output)?);
    Ok(())
}
