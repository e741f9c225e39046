//! ABOUTME: `pipeline run` — load, validate, and execute a workflow
//! ABOUTME: document end to end, printing its Result Store on completion.

use crate::cli::OutputFormat;
use crate::config::RuntimeConfig;
use crate::output::format_results;
use anyhow::{Context, Result};
use pipeline_core::{SafetyContext, Value};
use pipeline_providers::{MockAssistantProvider, MockStructuredProvider, SessionManager};
use pipeline_workflows::dispatch::Providers;
use pipeline_workflows::{build_function_table, execute_workflow, Runtime};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub async fn run(
    workflow_path: &Path,
    inputs: BTreeMap<String, Value>,
    workspace_dir: Option<PathBuf>,
    runtime_config: &RuntimeConfig,
    output: OutputFormat,
) -> Result<()> {
    let workflow = pipeline_config::load_workflow(workflow_path)
        .with_context(|| format!("failed to load workflow '{}'", workflow_path.display()))?;
    let functions = build_function_table(&workflow)
        .with_context(|| "invalid function declaration in workflow".to_string())?;

    let workspace_dir = workspace_dir.or_else(|| workflow_path.parent().map(PathBuf::from));

    let assistant = MockAssistantProvider::new();
    let structured = MockStructuredProvider::new();
    let sessions = SessionManager::new();
    let runtime = Runtime {
        providers: Providers {
            assistant: &assistant,
            structured: &structured,
            sessions: &sessions,
        },
        functions,
        workspace_dir,
        limits: runtime_config.limits(),
    };

    let results = execute_workflow(
        &workflow,
        inputs,
        &runtime,
        SafetyContext::root(runtime.limits),
    )
    .await?;

    println!("{}", format_results(&results, output)?);
    Ok(())
}
