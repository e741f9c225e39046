//! ABOUTME: `pipeline exec` — run a single step definition in isolation,
//! ABOUTME: for smoke-testing a step outside of a full workflow document.

use crate::cli::OutputFormat;
use crate::config::RuntimeConfig;
use crate::output::format_value;
use anyhow::{Context, Result};
use pipeline_config::schema::{Defaults, EnvironmentConfig, Step, Workflow};
use pipeline_core::{SafetyContext, Value};
use pipeline_providers::{MockAssistantProvider, MockStructuredProvider, SessionManager};
use pipeline_workflows::dispatch::Providers;
use pipeline_workflows::{build_function_table, execute_workflow, Runtime};
use std::collections::BTreeMap;
use std::path::Path;

pub async fn exec(
    step_path: &Path,
    inputs: BTreeMap<String, Value>,
    runtime_config: &RuntimeConfig,
    output: OutputFormat,
) -> Result<()> {
    let contents = std::fs::read_to_string(step_path)
        .with_context(|| format!("failed to read step document '{}'", step_path.display()))?;
    let step: Step = serde_yaml::from_str(&contents)
        .with_context(|| format!("invalid step document '{}'", step_path.display()))?;
    let step_name = step.name.clone();

    let workflow = Workflow {
        name: "ad-hoc".to_string(),
        description: None,
        defaults: Defaults::default(),
        environment: EnvironmentConfig::default(),
        checkpoint_enabled: false,
        checkpoint_dir: None,
        inputs: Vec::new(),
        functions: BTreeMap::new(),
        steps: vec![step],
    };
    let functions = build_function_table(&workflow)?;

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
        workspace_dir: step_path.parent().map(std::path::PathBuf::from),
        limits: runtime_config.limits(),
    };

    let results = execute_workflow(
        &workflow,
        inputs,
        &runtime,
        SafetyContext::root(runtime.limits),
    )
    .await?;

    let result = results
        .get(&step_name)
        .context("step produced no result")?;
    println!("{}", format_value(&serde_json::to_value(result)?, output)?);
    Ok(())
}
