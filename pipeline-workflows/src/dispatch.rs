//! ABOUTME: Step Dispatcher — executes one leaf step (every step kind
//! ABOUTME: except the control-flow trio, which the Executor drives
//! ABOUTME: directly since they need to recurse) against its collaborators.

use crate::condition;
use pipeline_config::schema::{
    AggregateFunction, BatchTask, CodebaseQueryStep, DataTransformStep, FallbackAction,
    FileFormat, FileOpsStep, PostProcessStep, PromptPart, StepKind,
};
use pipeline_core::{PipelineError, Result, StepResult, Value};
use pipeline_providers::{
    query_collected, AssistantOptions, AssistantProvider, BackoffStrategy, GenerationConfig,
    OutputFormat, RetryConfig, SessionManager, StructuredOptions, StructuredProvider,
    ToolDeclaration,
};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;

/// The collaborators a leaf step may call out to.
pub struct Providers<'a> {
    pub assistant: &'a dyn AssistantProvider,
    pub structured: &'a dyn StructuredProvider,
    pub sessions: &'a SessionManager,
}

/// The step kinds with a single ordered `PromptPart` list, for arms that
/// don't otherwise need the rest of the step's fields.
fn step_prompt_parts(kind: &StepKind) -> Option<&[PromptPart]> {
    match kind {
        StepKind::Claude(s) => Some(&s.prompt),
        StepKind::ClaudeSmart(s) => Some(&s.prompt),
        StepKind::ClaudeSession(s) => Some(&s.prompt),
        StepKind::ClaudeExtract(s) => Some(&s.prompt),
        StepKind::ClaudeRobust(s) => Some(&s.prompt),
        StepKind::Gemini(s) => Some(&s.prompt),
        StepKind::GeminiInstructor(s) => Some(&s.prompt),
        _ => None,
    }
}

/// Build a `RetryConfig` from a merged option map's (or `claude_robust`'s
/// own) `retry_config` value.
fn parse_retry_config(value: &Value) -> RetryConfig {
    let mut retry_config = RetryConfig::default();
    if let Some(n) = value.get_path("max_retries").and_then(Value::as_f64) {
        retry_config.max_retries = n as u32;
    }
    if let Some(ms) = value.get_path("base_delay_ms").and_then(Value::as_f64) {
        retry_config.base_delay_ms = ms as u64;
    }
    if let Some(backoff) = value.get_path("backoff").and_then(Value::as_str) {
        retry_config.backoff = match backoff {
            "fixed" => BackoffStrategy::Fixed,
            "linear" => BackoffStrategy::Linear,
            _ => BackoffStrategy::Exponential,
        };
    }
    retry_config
}

/// Build an `AssistantOptions` from a merged option `Value` map, filling in
/// defaults for anything the map doesn't set.
pub fn build_assistant_options(merged: &Value) -> AssistantOptions {
    let mut options = AssistantOptions::default();
    if let Some(model) = merged.get_path("model").and_then(Value::as_str) {
        options.model = Some(model.to_string());
    }
    if let Some(model) = merged.get_path("fallback_model").and_then(Value::as_str) {
        options.fallback_model = Some(model.to_string());
    }
    if let Some(n) = merged.get_path("max_turns").and_then(Value::as_f64) {
        options.max_turns = Some(n as u32);
    }
    if let Some(list) = merged.get_path("allowed_tools").and_then(Value::as_list) {
        options.allowed_tools = list.iter().filter_map(Value::as_str).map(String::from).collect();
    }
    if let Some(list) = merged.get_path("disallowed_tools").and_then(Value::as_list) {
        options.disallowed_tools = list.iter().filter_map(Value::as_str).map(String::from).collect();
    }
    if let Some(s) = merged.get_path("system_prompt").and_then(Value::as_str) {
        options.system_prompt = Some(s.to_string());
    }
    if let Some(s) = merged.get_path("cwd").and_then(Value::as_str) {
        options.cwd = Some(s.to_string());
    }
    if let Some(ms) = merged.get_path("timeout_ms").and_then(Value::as_f64) {
        options.timeout_ms = ms as u64;
    }
    if let Some(b) = merged.get_path("verbose").and_then(Value::as_bool) {
        options.verbose = b;
    }
    if let Some(b) = merged.get_path("debug_mode").and_then(Value::as_bool) {
        options.debug_mode = b;
    }
    if let Some(b) = merged.get_path("telemetry_enabled").and_then(Value::as_bool) {
        options.telemetry_enabled = b;
    }
    if let Some(b) = merged.get_path("cost_tracking").and_then(Value::as_bool) {
        options.cost_tracking = b;
    }
    if let Some(b) = merged.get_path("resume_session").and_then(Value::as_bool) {
        options.resume_session = b;
    }
    if let Some(b) = merged.get_path("async_streaming").and_then(Value::as_bool) {
        options.async_streaming = b;
    }
    if let Some(format) = merged.get_path("output_format").and_then(Value::as_str) {
        options.output_format = match format {
            "json" => OutputFormat::Json,
            "stream_json" => OutputFormat::StreamJson,
            _ => OutputFormat::Text,
        };
    }
    if let Some(retry) = merged.get_path("retry_config") {
        options.retry_config = parse_retry_config(retry);
    }
    options
}

/// Build a `StructuredOptions` from a merged option `Value` map.
pub fn build_structured_options(merged: &Value, response_schema: Option<Value>) -> StructuredOptions {
    let mut options = StructuredOptions::default();
    if let Some(model) = merged.get_path("model").and_then(Value::as_str) {
        options.model = Some(model.to_string());
    }
    if let Some(temp) = merged.get_path("generation_config.temperature").and_then(Value::as_f64) {
        options.generation_config = GenerationConfig {
            temperature: Some(temp),
            max_output_tokens: merged
                .get_path("generation_config.max_output_tokens")
                .and_then(Value::as_f64)
                .map(|n| n as u32),
        };
    }
    options.response_schema = response_schema;
    options
}

/// Execute one leaf step kind.
///
/// - `render_parts` builds a step's or fan-out task's `PromptPart` list into
///   its final prompt text (§4.2).
/// - `resolve_value` resolves a template placeholder to its underlying
///   structured `Value` rather than a rendered string, which `data_transform`
///   needs to see lists/maps rather than JSON text.
/// - `function_table` is the workflow's Gemini tool-declaration registry,
///   keyed by the names a `gemini`/`gemini_instructor` step's `functions`
///   list references.
pub async fn dispatch_leaf_step(
    kind: &StepKind,
    merged_options: &Value,
    providers: &Providers<'_>,
    render_parts: &dyn Fn(&[PromptPart]) -> Result<String>,
    resolve_value: &dyn Fn(&str) -> Value,
    function_table: &BTreeMap<String, ToolDeclaration>,
) -> Result<StepResult> {
    match kind {
        StepKind::Claude(_) | StepKind::ClaudeSmart(_) => {
            let prompt = render_parts(step_prompt_parts(kind).unwrap_or(&[]))?;
            let options = build_assistant_options(merged_options);
            query_collected(providers.assistant, &prompt, &options).await
        }
        StepKind::ClaudeSession(step) => {
            let prompt = render_parts(&step.prompt)?;
            let mut options = build_assistant_options(merged_options);
            let session_id = providers.sessions.get_or_create(
                step.session_id.as_deref(),
                step.persist,
                step.continue_on_restart,
            );
            options.session_id = Some(session_id.clone());
            options.resume_session = true;
            let result = query_collected(providers.assistant, &prompt, &options).await?;
            providers.sessions.append(
                &session_id,
                pipeline_providers::Interaction {
                    prompt: prompt.clone(),
                    response_text: result.text.clone(),
                    timestamp: chrono::Utc::now(),
                },
            )?;
            if let Some(frequency) = step.checkpoint_frequency {
                if providers.sessions.should_checkpoint(&session_id, frequency) {
                    providers.sessions.checkpoint(&session_id, result.to_value())?;
                }
            }
            Ok(result)
        }
        StepKind::ClaudeExtract(step) => {
            let prompt = render_parts(&step.prompt)?;
            let options = build_assistant_options(merged_options);
            let result = query_collected(providers.assistant, &prompt, &options).await?;
            let processed = apply_post_process(result.text.clone(), &step.post_process, step.max_summary_length);
            render_extract_output(processed, step.output_format, result.cost)
        }
        StepKind::ClaudeRobust(step) => {
            let prompt = render_parts(&step.prompt)?;
            let mut options = build_assistant_options(merged_options);
            if let Some(retry) = &step.retry_config {
                options.retry_config = parse_retry_config(retry);
            }
            run_claude_robust(
                providers,
                &prompt,
                &options,
                &step.retry_conditions,
                step.fallback_action.as_ref(),
            )
            .await
        }
        StepKind::ClaudeBatch(step) => {
            let options = build_assistant_options(merged_options);
            run_batch(providers, &step.tasks, &options, render_parts, step.max_concurrency).await
        }
        StepKind::ParallelClaude(step) => {
            let options = build_assistant_options(merged_options);
            run_batch(providers, &step.tasks, &options, render_parts, step.max_concurrency).await
        }
        StepKind::Gemini(step) => {
            let prompt = render_parts(&step.prompt)?;
            let mut options = build_structured_options(merged_options, None);
            if let Some(names) = &step.functions {
                options.tools = crate::functions::resolve_functions(names, function_table)?;
            }
            let response = providers.structured.query(&prompt, &options).await?;
            Ok(response.into_step_result())
        }
        StepKind::GeminiInstructor(step) => {
            let prompt = render_parts(&step.prompt)?;
            let mut options =
                build_structured_options(merged_options, Some(step.response_schema.clone()));
            if let Some(names) = &step.functions {
                options.tools = crate::functions::resolve_functions(names, function_table)?;
            }
            let response = providers.structured.query(&prompt, &options).await?;
            if let Some(schema) = &options.response_schema {
                pipeline_providers::validate_against_schema(&response.content, schema)?;
            }
            Ok(response.into_step_result())
        }
        StepKind::SetVariable(step) => Ok(StepResult::text(step.value.render()).with_content(step.value.clone())),
        StepKind::DataTransform(step) => execute_data_transform(step, resolve_value),
        StepKind::FileOps(step) => execute_file_ops(step),
        StepKind::CodebaseQuery(step) => execute_codebase_query(step),
        StepKind::TestEcho(step) => Ok(StepResult::text(step.message.clone())),
        StepKind::ForLoop(_) | StepKind::WhileLoop(_) | StepKind::NestedPipeline(_) => {
            Err(PipelineError::internal(
                "control-flow step kinds are dispatched by the Executor, not dispatch_leaf_step",
            ))
        }
    }
}

/// Sleep-based retry loop for `claude_robust`: retries only errors matching
/// `retry_conditions` (empty means "retry anything"), applying `backoff`
/// between attempts, and handing off to `fallback_action` once retries are
/// exhausted or the error doesn't match (§4.10, §8 scenario 5).
async fn run_claude_robust(
    providers: &Providers<'_>,
    prompt: &str,
    options: &AssistantOptions,
    retry_conditions: &[String],
    fallback_action: Option<&FallbackAction>,
) -> Result<StepResult> {
    let retry = &options.retry_config;
    let mut attempt = 0u32;
    let mut error_history = Vec::new();
    loop {
        match query_collected(providers.assistant, prompt, options).await {
            Ok(result) => return Ok(result),
            Err(err) => {
                let retryable =
                    retry_conditions.is_empty() || retry_conditions.iter().any(|c| c == err.kind());
                error_history.push(format!("{}: {err}", err.kind()));
                if retryable && attempt < retry.max_retries {
                    let delay = backoff_delay(retry.backoff, retry.base_delay_ms, attempt);
                    tracing::warn!(attempt, kind = err.kind(), delay_ms = delay, "claude_robust retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    attempt += 1;
                    continue;
                }
                return match fallback_action {
                    Some(action) => apply_fallback(action, error_history, providers, prompt, options).await,
                    None => Err(err),
                };
            }
        }
    }
}

fn backoff_delay(strategy: BackoffStrategy, base_delay_ms: u64, attempt: u32) -> u64 {
    match strategy {
        BackoffStrategy::Fixed => base_delay_ms,
        BackoffStrategy::Linear => base_delay_ms * u64::from(attempt + 1),
        BackoffStrategy::Exponential => base_delay_ms.saturating_mul(1u64 << attempt.min(32)),
    }
}

/// Produce the mandated degraded-but-successful result once `claude_robust`
/// has exhausted its retries and a `fallback_action` is configured.
async fn apply_fallback(
    action: &FallbackAction,
    error_history: Vec<String>,
    providers: &Providers<'_>,
    prompt: &str,
    options: &AssistantOptions,
) -> Result<StepResult> {
    let mut result = match action {
        FallbackAction::DefaultValue { value } => {
            StepResult::text(value.render()).with_content(value.clone())
        }
        FallbackAction::FallbackModel { model } => {
            let mut fallback_options = options.clone();
            fallback_options.model = Some(model.clone());
            match query_collected(providers.assistant, prompt, &fallback_options).await {
                Ok(result) => result,
                Err(err) => StepResult::text(format!("fallback model also failed: {err}")),
            }
        }
        FallbackAction::Skip => StepResult::text("skipped after retries exhausted"),
    };
    result.success = true;
    result = result
        .with_metadata("degraded_mode", Value::Bool(true))
        .with_metadata(
            "fallback_type",
            Value::String(
                match action {
                    FallbackAction::DefaultValue { .. } => "default_value",
                    FallbackAction::FallbackModel { .. } => "fallback_model",
                    FallbackAction::Skip => "skip",
                }
                .to_string(),
            ),
        )
        .with_metadata(
            "robustness_metadata",
            Value::Map(BTreeMap::from([(
                "error_history".to_string(),
                Value::list(error_history.into_iter().map(Value::String)),
            )])),
        );
    Ok(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Success,
    Timeout,
    Error,
}

impl TaskStatus {
    fn name(self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Error => "error",
        }
    }
}

/// Run a fan-out task list concurrently (bounded by `max_concurrency`),
/// absorbing each task's own success/timeout/error into a per-task status
/// record rather than letting one failing task abort the whole step
/// (§4.10, §8 scenario 4). Declared order is restored after completion,
/// regardless of which task finished first.
async fn run_batch(
    providers: &Providers<'_>,
    tasks: &[BatchTask],
    options: &AssistantOptions,
    render_parts: &dyn Fn(&[PromptPart]) -> Result<String>,
    max_concurrency: Option<usize>,
) -> Result<StepResult> {
    let prepared: Vec<(usize, String, Result<String>)> = tasks
        .iter()
        .enumerate()
        .map(|(index, task)| (index, task.name.clone(), render_parts(&task.prompt)))
        .collect();
    let concurrency = max_concurrency.unwrap_or_else(|| tasks.len().max(1)).max(1);

    let mut outcomes = stream::iter(prepared)
        .map(|(index, name, prompt)| async move {
            let prompt = match prompt {
                Ok(p) => p,
                Err(err) => return (index, name, TaskStatus::Error, StepResult::failure(err.to_string())),
            };
            match query_collected(providers.assistant, &prompt, options).await {
                Ok(result) => (index, name, TaskStatus::Success, result),
                Err(err) => {
                    let status = if err.kind() == "timeout" {
                        TaskStatus::Timeout
                    } else {
                        TaskStatus::Error
                    };
                    (index, name, status, StepResult::failure(err.to_string()))
                }
            }
        })
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>()
        .await;
    outcomes.sort_by_key(|(index, ..)| *index);
    Ok(consolidate_batch(outcomes))
}

/// Consolidate fan-out task results in declared order, regardless of
/// completion order, recording each task's absorbed status. The step itself
/// always succeeds: a per-task failure is visible in `content.<name>.status`,
/// never propagated into the step-level result.
fn consolidate_batch(outcomes: Vec<(usize, String, TaskStatus, StepResult)>) -> StepResult {
    let mut text = String::new();
    let mut content_map = BTreeMap::new();
    let mut total_cost = 0.0;
    for (_, name, status, result) in &outcomes {
        text.push_str(&format!("## {name}\n{}\n\n", result.text));
        total_cost += result.cost;
        let mut entry = result.to_value().as_map().cloned().unwrap_or_default();
        entry.insert("status".to_string(), Value::String(status.name().to_string()));
        content_map.insert(name.clone(), Value::Map(entry));
    }
    StepResult::text(text.trim_end().to_string())
        .with_content(Value::Map(content_map))
        .with_cost(total_cost)
}

fn extract_all_code_blocks(text: &str) -> String {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after_fence = &rest[start + 3..];
        let Some(lang_end) = after_fence.find('\n') else {
            break;
        };
        let body = &after_fence[lang_end + 1..];
        let Some(end) = body.find("```") else {
            break;
        };
        blocks.push(body[..end].trim_end().to_string());
        rest = &body[end + 3..];
    }
    blocks.join("\n\n")
}

fn extract_links(text: &str) -> String {
    text.split_whitespace()
        .filter(|token| token.starts_with("http://") || token.starts_with("https://"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn extract_bulleted_lines(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with('-')
                || trimmed.starts_with('*')
                || trimmed.chars().next().is_some_and(|c| c.is_ascii_digit())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn extract_recommendations(text: &str) -> String {
    text.lines()
        .filter(|line| line.to_lowercase().contains("recommend"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn generate_summary(text: &str, max_summary_length: Option<usize>) -> String {
    let trimmed = text.trim();
    match max_summary_length {
        Some(limit) if trimmed.chars().count() > limit => {
            let truncated: String = trimmed.chars().take(limit).collect();
            format!("{truncated}...")
        }
        _ => trimmed.to_string(),
    }
}

/// Apply `claude_extract`'s ordered post-processing pipeline to the
/// provider's response text (§4.10).
fn apply_post_process(mut text: String, steps: &[PostProcessStep], max_summary_length: Option<usize>) -> String {
    for step in steps {
        text = match step {
            PostProcessStep::ExtractCodeBlocks => extract_all_code_blocks(&text),
            PostProcessStep::ExtractRecommendations => extract_recommendations(&text),
            PostProcessStep::ExtractLinks => extract_links(&text),
            PostProcessStep::ExtractKeyPoints => extract_bulleted_lines(&text),
            PostProcessStep::FormatMarkdown => text.trim().to_string(),
            PostProcessStep::GenerateSummary => generate_summary(&text, max_summary_length),
        };
    }
    text
}

fn render_extract_output(
    text: String,
    format: pipeline_config::schema::ExtractOutputFormat,
    cost: f64,
) -> Result<StepResult> {
    use pipeline_config::schema::ExtractOutputFormat;
    match format {
        ExtractOutputFormat::Text | ExtractOutputFormat::Markdown | ExtractOutputFormat::Summary => {
            Ok(StepResult::text(text).with_cost(cost))
        }
        ExtractOutputFormat::Json => {
            let parsed: serde_json::Value =
                serde_json::from_str(text.trim()).map_err(|e| PipelineError::ParsingError {
                    message: format!("claude_extract: response is not valid json: {e}"),
                })?;
            Ok(StepResult::text(text).with_content(Value::from(parsed)).with_cost(cost))
        }
        ExtractOutputFormat::Structured => {
            Ok(StepResult::text(text.clone()).with_content(Value::String(text)).with_cost(cost))
        }
    }
}

fn sort_value_cmp(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.render().cmp(&b.render()),
    }
}

/// Execute `data_transform`'s closed relational operation set against
/// whatever `resolve_value` resolves its template-string inputs to (§4.10).
fn execute_data_transform(step: &DataTransformStep, resolve_value: &dyn Fn(&str) -> Value) -> Result<StepResult> {
    let as_rows = |value: &Value, label: &str| -> Result<Vec<Value>> {
        value
            .as_list()
            .map(<[Value]>::to_vec)
            .ok_or_else(|| PipelineError::validation(format!("data_transform {label} input is not a list")))
    };
    match step {
        DataTransformStep::Filter { input, condition } => {
            let rows = as_rows(&resolve_value(input), "filter")?;
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                if condition::evaluate_value(condition, &row)? {
                    kept.push(row);
                }
            }
            let output = Value::List(kept);
            Ok(StepResult::text(output.render()).with_content(output))
        }
        DataTransformStep::Map { input, field } => {
            let rows = as_rows(&resolve_value(input), "map")?;
            let mapped: Vec<Value> = rows
                .iter()
                .map(|row| row.get_path(field).cloned().unwrap_or(Value::Null))
                .collect();
            let output = Value::List(mapped);
            Ok(StepResult::text(output.render()).with_content(output))
        }
        DataTransformStep::Aggregate { input, function, field } => {
            let rows = as_rows(&resolve_value(input), "aggregate")?;
            let numbers: Vec<f64> = rows
                .iter()
                .filter_map(|row| match field {
                    Some(f) => row.get_path(f).and_then(Value::as_f64),
                    None => row.as_f64(),
                })
                .collect();
            let result = match function {
                AggregateFunction::Count => rows.len() as f64,
                AggregateFunction::Sum => numbers.iter().sum(),
                AggregateFunction::Avg => {
                    if numbers.is_empty() {
                        0.0
                    } else {
                        numbers.iter().sum::<f64>() / numbers.len() as f64
                    }
                }
                AggregateFunction::Min => numbers.iter().cloned().fold(f64::INFINITY, f64::min),
                AggregateFunction::Max => numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            };
            let output = Value::Number(result);
            Ok(StepResult::text(output.render()).with_content(output))
        }
        DataTransformStep::Join { left, right, on } => {
            let left_rows = as_rows(&resolve_value(left), "join")?;
            let right_rows = as_rows(&resolve_value(right), "join")?;
            let mut joined = Vec::new();
            for left_row in &left_rows {
                let Some(key) = left_row.get_path(on) else {
                    continue;
                };
                for right_row in &right_rows {
                    if right_row.get_path(on) == Some(key) {
                        let mut merged = left_row.as_map().cloned().unwrap_or_default();
                        if let Some(right_map) = right_row.as_map() {
                            for (k, v) in right_map {
                                merged.entry(k.clone()).or_insert_with(|| v.clone());
                            }
                        }
                        joined.push(Value::Map(merged));
                    }
                }
            }
            let output = Value::List(joined);
            Ok(StepResult::text(output.render()).with_content(output))
        }
        DataTransformStep::GroupBy { input, key } => {
            let rows = as_rows(&resolve_value(input), "group_by")?;
            let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
            for row in rows {
                let group_key = row.get_path(key).map(Value::render).unwrap_or_default();
                groups.entry(group_key).or_default().push(row);
            }
            let output = Value::Map(groups.into_iter().map(|(k, v)| (k, Value::List(v))).collect());
            Ok(StepResult::text(output.render()).with_content(output))
        }
        DataTransformStep::Sort { input, key, descending } => {
            let mut rows = as_rows(&resolve_value(input), "sort")?;
            rows.sort_by(|a, b| {
                let (av, bv) = match key {
                    Some(k) => (
                        a.get_path(k).cloned().unwrap_or(Value::Null),
                        b.get_path(k).cloned().unwrap_or(Value::Null),
                    ),
                    None => (a.clone(), b.clone()),
                };
                sort_value_cmp(&av, &bv)
            });
            if *descending {
                rows.reverse();
            }
            let output = Value::List(rows);
            Ok(StepResult::text(output.render()).with_content(output))
        }
    }
}

fn io_err(err: std::io::Error, path: &str) -> PipelineError {
    PipelineError::File {
        message: err.to_string(),
        path: Some(path.to_string()),
    }
}

fn apply_stream_function(name: &str, text: &str) -> Result<String> {
    match name {
        "uppercase" => Ok(text.to_uppercase()),
        "lowercase" => Ok(text.to_lowercase()),
        "trim" => Ok(text.trim().to_string()),
        "reverse" => Ok(text.chars().rev().collect()),
        other => Err(PipelineError::validation(format!(
            "unknown stream_process function '{other}'"
        ))),
    }
}

/// Execute `file_ops`'s closed file-operation set (§4.10).
fn execute_file_ops(step: &FileOpsStep) -> Result<StepResult> {
    match step {
        FileOpsStep::Copy { path, destination } => {
            std::fs::copy(path, destination).map_err(|err| io_err(err, path))?;
            Ok(StepResult::text(format!("copied {path} to {destination}")))
        }
        FileOpsStep::Move { path, destination } => {
            std::fs::rename(path, destination).map_err(|err| io_err(err, path))?;
            Ok(StepResult::text(format!("moved {path} to {destination}")))
        }
        FileOpsStep::Delete { path } => {
            std::fs::remove_file(path).map_err(|err| io_err(err, path))?;
            Ok(StepResult::text(format!("deleted {path}")))
        }
        FileOpsStep::Validate { path, schema } => {
            let contents = std::fs::read_to_string(path).map_err(|err| io_err(err, path))?;
            let value: Value = serde_json::from_str::<serde_json::Value>(&contents)
                .map(Value::from)
                .or_else(|_| serde_yaml::from_str::<serde_json::Value>(&contents).map(Value::from))
                .map_err(|e| PipelineError::ParsingError {
                    message: format!("file_ops validate: '{path}' is neither valid json nor yaml: {e}"),
                })?;
            if let Some(schema) = schema {
                pipeline_providers::validate_against_schema(&value, schema)?;
            }
            Ok(StepResult::text(format!("{path} is valid")).with_content(value))
        }
        FileOpsStep::List { path, pattern } => {
            let mut entries = Vec::new();
            for entry in walkdir::WalkDir::new(path).into_iter().filter_map(std::result::Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.path().to_string_lossy().to_string();
                if pattern.as_deref().map_or(true, |p| name.contains(p)) {
                    entries.push(name);
                }
            }
            let text = entries.join("\n");
            Ok(StepResult::text(text).with_content(Value::list(entries.into_iter().map(Value::String))))
        }
        FileOpsStep::Convert { path, destination, format } => {
            let contents = std::fs::read_to_string(path).map_err(|err| io_err(err, path))?;
            let value: serde_json::Value = serde_json::from_str(&contents)
                .or_else(|_| serde_yaml::from_str(&contents))
                .map_err(|e| PipelineError::ParsingError {
                    message: format!("file_ops convert: '{path}' is neither valid json nor yaml: {e}"),
                })?;
            let rendered = match format {
                FileFormat::Json => serde_json::to_string_pretty(&value)
                    .map_err(|e| PipelineError::ParsingError { message: e.to_string() })?,
                FileFormat::Yaml => serde_yaml::to_string(&value)
                    .map_err(|e| PipelineError::ParsingError { message: e.to_string() })?,
            };
            std::fs::write(destination, &rendered).map_err(|err| io_err(err, destination))?;
            Ok(StepResult::text(format!("converted {path} to {destination}")))
        }
        FileOpsStep::StreamCopy { path, destination } => {
            let mut reader = std::io::BufReader::new(std::fs::File::open(path).map_err(|err| io_err(err, path))?);
            let mut writer =
                std::io::BufWriter::new(std::fs::File::create(destination).map_err(|err| io_err(err, destination))?);
            let bytes = std::io::copy(&mut reader, &mut writer).map_err(|err| io_err(err, path))?;
            Ok(StepResult::text(format!("streamed {bytes} bytes from {path} to {destination}")))
        }
        FileOpsStep::StreamProcess { path, destination, function } => {
            let contents = std::fs::read_to_string(path).map_err(|err| io_err(err, path))?;
            let processed = apply_stream_function(function, &contents)?;
            std::fs::write(destination, &processed).map_err(|err| io_err(err, destination))?;
            Ok(StepResult::text(format!("processed {path} into {destination} via '{function}'")))
        }
    }
}

fn default_roots(paths: &[String]) -> Vec<String> {
    if paths.is_empty() {
        vec![".".to_string()]
    } else {
        paths.to_vec()
    }
}

fn codebase_query_result(matches: Vec<String>) -> StepResult {
    let text = if matches.is_empty() {
        "no matches found".to_string()
    } else {
        matches.join("\n")
    };
    StepResult::text(text).with_content(Value::list(matches.into_iter().map(Value::String)))
}

fn grep_lines_matching(roots: &[String], max_results: usize, predicate: impl Fn(&str) -> bool) -> Vec<String> {
    let mut matches = Vec::new();
    for root in roots {
        'files: for entry in walkdir::WalkDir::new(root).into_iter().filter_map(std::result::Result::ok) {
            if matches.len() >= max_results {
                break;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            for (line_no, line) in contents.lines().enumerate() {
                if predicate(line) {
                    matches.push(format!("{}:{}: {}", entry.path().display(), line_no + 1, line.trim()));
                    if matches.len() >= max_results {
                        break 'files;
                    }
                }
            }
        }
    }
    matches
}

/// Execute `codebase_query`'s closed named-query set (§4.10).
fn execute_codebase_query(step: &CodebaseQueryStep) -> Result<StepResult> {
    match step {
        CodebaseQueryStep::FindFiles { paths, pattern, max_results } => {
            let roots = default_roots(paths);
            let max = max_results.unwrap_or(50);
            let mut matches = Vec::new();
            'roots: for root in &roots {
                for entry in walkdir::WalkDir::new(root).into_iter().filter_map(std::result::Result::ok) {
                    if matches.len() >= max {
                        break 'roots;
                    }
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let name = entry.path().to_string_lossy().to_string();
                    if pattern.as_deref().map_or(true, |p| name.contains(p)) {
                        matches.push(name);
                    }
                }
            }
            Ok(codebase_query_result(matches))
        }
        CodebaseQueryStep::FindDependencies { paths, target, max_results } => {
            let roots = default_roots(paths);
            let matches = grep_lines_matching(&roots, max_results.unwrap_or(50), |line| {
                line.contains(target.as_str())
                    && (line.contains("use ") || line.contains("import ") || line.contains("require("))
            });
            Ok(codebase_query_result(matches))
        }
        CodebaseQueryStep::FindFunctions { paths, name, max_results } => {
            let roots = default_roots(paths);
            let matches = grep_lines_matching(&roots, max_results.unwrap_or(50), |line| {
                line.contains(name.as_str())
                    && (line.contains("fn ") || line.contains("function ") || line.contains("def "))
            });
            Ok(codebase_query_result(matches))
        }
        CodebaseQueryStep::FindRelated { paths, to, max_results } => {
            let roots = default_roots(paths);
            let matches = grep_lines_matching(&roots, max_results.unwrap_or(50), |line| line.contains(to.as_str()));
            Ok(codebase_query_result(matches))
        }
        CodebaseQueryStep::AnalyzeImpact { paths, target, max_results } => {
            let roots = default_roots(paths);
            let matches =
                grep_lines_matching(&roots, max_results.unwrap_or(50), |line| line.contains(target.as_str()));
            let files_touched: std::collections::BTreeSet<&str> =
                matches.iter().filter_map(|m| m.split(':').next()).collect();
            let result = codebase_query_result(matches)
                .with_metadata("files_touched", Value::Number(files_touched.len() as f64));
            Ok(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_config::schema::{ClaudeExtractStep, ExtractOutputFormat, TestEchoStep};
    use pipeline_providers::{AlwaysFailProvider, FailureKind, MockAssistantProvider, MockStructuredProvider};

    fn providers(
        assistant: &dyn AssistantProvider,
        structured: &dyn StructuredProvider,
        sessions: &SessionManager,
    ) -> Providers<'_> {
        Providers {
            assistant,
            structured,
            sessions,
        }
    }

    fn static_prompt(text: &str) -> Vec<PromptPart> {
        vec![PromptPart::Static { text: text.to_string() }]
    }

    fn no_op_render_parts(parts: &[PromptPart]) -> Result<String> {
        match parts.first() {
            Some(PromptPart::Static { text }) => Ok(text.clone()),
            _ => Ok(String::new()),
        }
    }

    #[tokio::test]
    async fn test_echo_returns_its_message_without_touching_providers() {
        let assistant = MockAssistantProvider::new();
        let structured = MockStructuredProvider::new();
        let sessions = SessionManager::new();
        let kind = StepKind::TestEcho(TestEchoStep {
            message: "hi".to_string(),
        });
        let functions = BTreeMap::new();
        let result = dispatch_leaf_step(
            &kind,
            &Value::map(),
            &providers(&assistant, &structured, &sessions),
            &no_op_render_parts,
            &|_| Value::Null,
            &functions,
        )
        .await
        .unwrap();
        assert_eq!(result.text, "hi");
    }

    #[tokio::test]
    async fn claude_batch_consolidates_in_declared_order_and_absorbs_task_failures() {
        let assistant = MockAssistantProvider::with_responses(vec![StepResult::text("A")]);
        let structured = MockStructuredProvider::new();
        let sessions = SessionManager::new();
        let kind = StepKind::ClaudeBatch(pipeline_config::schema::ClaudeBatchStep {
            tasks: vec![
                BatchTask {
                    name: "first".to_string(),
                    prompt: static_prompt("p1"),
                },
                BatchTask {
                    name: "second".to_string(),
                    prompt: static_prompt("p2"),
                },
            ],
            preset: None,
            options: None,
            max_concurrency: Some(1),
        });
        let functions = BTreeMap::new();
        let result = dispatch_leaf_step(
            &kind,
            &Value::map(),
            &providers(&assistant, &structured, &sessions),
            &no_op_render_parts,
            &|_| Value::Null,
            &functions,
        )
        .await
        .unwrap();
        assert!(result.success);
        let first_idx = result.text.find("first").unwrap();
        let second_idx = result.text.find("second").unwrap();
        assert!(first_idx < second_idx);
        let second_status = result
            .content
            .as_ref()
            .and_then(|c| c.get_path("second.status"))
            .and_then(Value::as_str);
        assert_eq!(second_status, Some("error"));
    }

    #[tokio::test]
    async fn data_transform_filter_keeps_matching_rows() {
        let assistant = MockAssistantProvider::new();
        let structured = MockStructuredProvider::new();
        let sessions = SessionManager::new();
        let kind = StepKind::DataTransform(DataTransformStep::Filter {
            input: "{{rows.content}}".to_string(),
            condition: "amount > 10".to_string(),
        });
        let rows = Value::list([
            Value::from(serde_json::json!({"amount": 5})),
            Value::from(serde_json::json!({"amount": 20})),
        ]);
        let functions = BTreeMap::new();
        let result = dispatch_leaf_step(
            &kind,
            &Value::map(),
            &providers(&assistant, &structured, &sessions),
            &no_op_render_parts,
            &|_| rows.clone(),
            &functions,
        )
        .await
        .unwrap();
        let kept = result.content.unwrap();
        assert_eq!(kept.as_list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn data_transform_aggregate_sums_a_field() {
        let rows = Value::list([
            Value::from(serde_json::json!({"amount": 5})),
            Value::from(serde_json::json!({"amount": 20})),
        ]);
        let step = DataTransformStep::Aggregate {
            input: "{{rows}}".to_string(),
            function: AggregateFunction::Sum,
            field: Some("amount".to_string()),
        };
        let result = execute_data_transform(&step, &|_| rows.clone()).unwrap();
        assert_eq!(result.content.unwrap().as_f64(), Some(25.0));
    }

    #[tokio::test]
    async fn claude_extract_applies_post_process_pipeline() {
        let assistant = MockAssistantProvider::with_responses(vec![StepResult::text(
            "- keep costs down\n- improve latency\nsome other line",
        )]);
        let structured = MockStructuredProvider::new();
        let sessions = SessionManager::new();
        let kind = StepKind::ClaudeExtract(ClaudeExtractStep {
            prompt: static_prompt("list findings"),
            post_process: vec![PostProcessStep::ExtractKeyPoints],
            output_format: ExtractOutputFormat::Text,
            max_summary_length: None,
            preset: None,
            options: None,
        });
        let functions = BTreeMap::new();
        let result = dispatch_leaf_step(
            &kind,
            &Value::map(),
            &providers(&assistant, &structured, &sessions),
            &no_op_render_parts,
            &|_| Value::Null,
            &functions,
        )
        .await
        .unwrap();
        assert_eq!(result.text, "- keep costs down\n- improve latency");
    }

    #[tokio::test]
    async fn claude_robust_falls_back_to_default_value_after_exhausting_retries() {
        let assistant = MockAssistantProvider::always_timeout();
        let structured = MockStructuredProvider::new();
        let sessions = SessionManager::new();
        let mut options = AssistantOptions::default();
        options.retry_config = RetryConfig {
            max_retries: 1,
            backoff: BackoffStrategy::Fixed,
            base_delay_ms: 1,
        };
        let result = run_claude_robust(
            &providers(&assistant, &structured, &sessions),
            "p",
            &options,
            &[],
            Some(&FallbackAction::DefaultValue {
                value: Value::String("fallback".to_string()),
            }),
        )
        .await
        .unwrap();
        assert!(result.success);
        assert_eq!(
            result.metadata.get("degraded_mode").and_then(Value::as_bool),
            Some(true)
        );
        assert_eq!(
            result.metadata.get("fallback_type").and_then(Value::as_str),
            Some("default_value")
        );
        let history = result
            .metadata
            .get("robustness_metadata")
            .and_then(|v| v.get_path("error_history"))
            .and_then(Value::as_list)
            .unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn claude_robust_does_not_retry_conditions_outside_retry_conditions() {
        let assistant = AlwaysFailProvider {
            error: "bad request".to_string(),
            kind: FailureKind::ApiError,
        };
        let structured = MockStructuredProvider::new();
        let sessions = SessionManager::new();
        let options = AssistantOptions::default();
        let err = run_claude_robust(
            &providers(&assistant, &structured, &sessions),
            "p",
            &options,
            &["timeout".to_string()],
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "api_error");
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn claude_robust_logs_a_warning_on_each_retry() {
        let assistant = MockAssistantProvider::always_timeout();
        let structured = MockStructuredProvider::new();
        let sessions = SessionManager::new();
        let mut options = AssistantOptions::default();
        options.retry_config = RetryConfig {
            max_retries: 1,
            backoff: BackoffStrategy::Fixed,
            base_delay_ms: 1,
        };
        let _ = run_claude_robust(
            &providers(&assistant, &structured, &sessions),
            "p",
            &options,
            &[],
            Some(&FallbackAction::DefaultValue {
                value: Value::String("fallback".to_string()),
            }),
        )
        .await
        .unwrap();
        assert!(logs_contain("claude_robust retrying"));
    }

    proptest::proptest! {
        #[test]
        fn filter_then_sum_never_exceeds_unfiltered_sum(amounts in proptest::collection::vec(0.0f64..1000.0, 0..20)) {
            let rows = Value::list(
                amounts
                    .iter()
                    .map(|amount| Value::from(serde_json::json!({ "amount": amount })))
                    .collect::<Vec<_>>(),
            );
            let filter_step = DataTransformStep::Filter {
                input: "{{rows}}".to_string(),
                condition: "amount > 500".to_string(),
            };
            let filtered = execute_data_transform(&filter_step, &|_| rows.clone()).unwrap();
            let filtered_rows = filtered.content.unwrap();

            let sum_step = DataTransformStep::Aggregate {
                input: "{{rows}}".to_string(),
                function: AggregateFunction::Sum,
                field: Some("amount".to_string()),
            };
            let filtered_sum = execute_data_transform(&sum_step, &|_| filtered_rows.clone())
                .unwrap()
                .content
                .unwrap()
                .as_f64()
                .unwrap();
            let total_sum: f64 = amounts.iter().sum();

            proptest::prop_assert!(filtered_sum <= total_sum + f64::EPSILON);

            let expected_count = amounts.iter().filter(|a| **a > 500.0).count();
            proptest::prop_assert_eq!(filtered_rows.as_list().unwrap().len(), expected_count);
        }
    }
}
