//! ABOUTME: `pipeline validate` — parse and structurally validate a
//! ABOUTME: workflow document without executing any step.

use crate::cli::OutputFormat;
use crate::output::format_value;
use anyhow::Result;
use std::path::Path;

pub fn validate(workflow_path: &Path, output: OutputFormat) -> Result<()> {
    match pipeline_config::load_workflow(workflow_path) {
        Ok(workflow) => {
            let summary = serde_json::json!({
                "valid": true,
                "name": workflow.name,
                "steps": workflow.steps.len(),
            });
            println!("{}", format_value(&summary, output)?);
            Ok(())
        }
        Err(err) => {
            let summary = serde_json::json!({
                "valid": false,
                "error": err.to_string(),
            });
            println!("{}", format_value(&summary, output)?);
            anyhow::bail!("workflow '{}' is invalid: {err}", workflow_path.display());
        }
    }
}
