//! ABOUTME: Workflow document validation — structural checks that must
//! ABOUTME: hold before the Executor is handed a workflow: unique step
//! ABOUTME: names, known step types, forward-reference and function-table
//! ABOUTME: checks, and advisory soft-limit warnings.

use crate::schema::{DataTransformStep, PromptPart, StepKind, Workflow};
use pipeline_core::PipelineError;
use std::collections::BTreeSet;

/// Advisory ceiling above which a workflow still validates but logs a
/// warning: very large step counts are usually a generated-document bug.
const SOFT_STEP_COUNT_LIMIT: usize = 500;

/// Namespace prefixes a `{{...}}` placeholder may use that never name a
/// step — skipped when scanning for forward references.
const RESERVED_PREFIXES: &[&str] = &["inputs.", "loop.", "vars."];

/// Validate a parsed workflow document, returning the first structural
/// violation found. Soft limits are logged via `tracing::warn!` rather than
/// rejected, matching the hard-error/soft-warn split used throughout this
/// orchestrator's config layer.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), PipelineError> {
    validate_unique_step_names(workflow)?;
    validate_previous_response_references(workflow)?;
    validate_gemini_function_references(workflow)?;
    validate_nested_pipeline_references(workflow)?;
    warn_on_soft_limits(workflow);
    Ok(())
}

fn all_steps(steps: &[crate::schema::Step]) -> Vec<&crate::schema::Step> {
    let mut out = Vec::new();
    for step in steps {
        out.push(step);
        if let StepKind::ForLoop(body) = &step.kind {
            out.extend(all_steps(&body.body));
        }
        if let StepKind::WhileLoop(body) = &step.kind {
            out.extend(all_steps(&body.body));
        }
    }
    out
}

fn validate_unique_step_names(workflow: &Workflow) -> Result<(), PipelineError> {
    let mut seen = BTreeSet::new();
    for step in all_steps(&workflow.steps) {
        if !seen.insert(step.name.as_str()) {
            return Err(PipelineError::Validation {
                message: format!("duplicate step name: {}", step.name),
                field: Some(format!("steps[{}].name", step.name)),
            });
        }
    }
    Ok(())
}

/// A step's `condition` or template text may reference another step by bare
/// name (`{{step_name.field}}`, or `{{previous_response:step_name:field}}`);
/// every such reference must name a step that appears earlier in
/// declaration order (forward references are rejected, since the Result
/// Store cannot hold a not-yet-run step's output).
fn validate_previous_response_references(workflow: &Workflow) -> Result<(), PipelineError> {
    let steps = all_steps(&workflow.steps);
    let mut known = BTreeSet::new();
    for step in &steps {
        for reference in extract_result_references(step) {
            if !known.contains(reference.as_str()) {
                return Err(PipelineError::Validation {
                    message: format!(
                        "step '{}' references result of '{}' before it runs",
                        step.name, reference
                    ),
                    field: Some(format!("steps[{}]", step.name)),
                });
            }
        }
        known.insert(step.name.as_str());
    }
    Ok(())
}

fn prompt_part_texts(parts: &[PromptPart]) -> Vec<String> {
    parts
        .iter()
        .filter_map(|part| match part {
            PromptPart::Static { text } => Some(text.clone()),
            PromptPart::PreviousResponse { step, .. } => Some(format!("{{{{{step}}}}}")),
            PromptPart::File { .. } | PromptPart::SessionContext { .. } => None,
        })
        .collect()
}

fn data_transform_texts(step: &DataTransformStep) -> Vec<String> {
    match step {
        DataTransformStep::Filter { input, condition } => vec![input.clone(), condition.clone()],
        DataTransformStep::Map { input, .. } => vec![input.clone()],
        DataTransformStep::Aggregate { input, .. } => vec![input.clone()],
        DataTransformStep::Join { left, right, .. } => vec![left.clone(), right.clone()],
        DataTransformStep::GroupBy { input, .. } => vec![input.clone()],
        DataTransformStep::Sort { input, .. } => vec![input.clone()],
    }
}

/// Extract bare step-name references from everywhere a step can embed a
/// template string: its `condition` and, for step kinds that carry prompt
/// or expression text, that text.
fn extract_result_references(step: &crate::schema::Step) -> Vec<String> {
    let mut texts = Vec::new();
    if let Some(condition) = &step.condition {
        texts.push(condition.clone());
    }
    match &step.kind {
        StepKind::Claude(s) => texts.extend(prompt_part_texts(&s.prompt)),
        StepKind::ClaudeSmart(s) => texts.extend(prompt_part_texts(&s.prompt)),
        StepKind::ClaudeSession(s) => texts.extend(prompt_part_texts(&s.prompt)),
        StepKind::ClaudeExtract(s) => texts.extend(prompt_part_texts(&s.prompt)),
        StepKind::ClaudeRobust(s) => texts.extend(prompt_part_texts(&s.prompt)),
        StepKind::Gemini(s) => texts.extend(prompt_part_texts(&s.prompt)),
        StepKind::GeminiInstructor(s) => texts.extend(prompt_part_texts(&s.prompt)),
        StepKind::ClaudeBatch(s) => {
            texts.extend(s.tasks.iter().flat_map(|t| prompt_part_texts(&t.prompt)))
        }
        StepKind::ParallelClaude(s) => {
            texts.extend(s.tasks.iter().flat_map(|t| prompt_part_texts(&t.prompt)))
        }
        StepKind::DataTransform(s) => texts.extend(data_transform_texts(s)),
        StepKind::WhileLoop(s) => texts.push(s.condition.clone()),
        StepKind::ForLoop(s) => texts.push(s.over.clone()),
        StepKind::SetVariable(_)
        | StepKind::FileOps(_)
        | StepKind::CodebaseQuery(_)
        | StepKind::NestedPipeline(_)
        | StepKind::TestEcho(_) => {}
    }

    let mut references = Vec::new();
    for text in texts {
        references.extend(find_placeholder_step_names(&text));
    }
    references
}

/// Scan `text` for `{{...}}` placeholders and return the step name each one
/// references, skipping reserved namespaces (`inputs.`, `loop.`, `vars.`,
/// `workspace_dir`) and resolving `previous_response:step:field` to `step`.
fn find_placeholder_step_names(text: &str) -> Vec<String> {
    let mut references = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        let inner = after[..end].trim();
        rest = &after[end + 2..];

        if inner == "workspace_dir" {
            continue;
        }
        if let Some(remainder) = inner.strip_prefix("previous_response:") {
            if let Some(name) = remainder.split(':').next() {
                if !name.is_empty() {
                    references.push(name.to_string());
                }
            }
            continue;
        }
        if RESERVED_PREFIXES.iter().any(|prefix| inner.starts_with(prefix)) {
            continue;
        }
        let name = inner.split('.').next().unwrap_or(inner);
        if !name.is_empty() {
            references.push(name.to_string());
        }
    }
    references
}

/// Every `gemini`/`gemini_instructor` step's `functions` list must name
/// entries in the workflow's tool-declaration table.
fn validate_gemini_function_references(workflow: &Workflow) -> Result<(), PipelineError> {
    for step in all_steps(&workflow.steps) {
        let names = match &step.kind {
            StepKind::Gemini(s) => s.functions.as_ref(),
            StepKind::GeminiInstructor(s) => s.functions.as_ref(),
            _ => None,
        };
        let Some(names) = names else { continue };
        for name in names {
            if !workflow.functions.contains_key(name) {
                return Err(PipelineError::Validation {
                    message: format!(
                        "step '{}' references unknown function '{}'",
                        step.name, name
                    ),
                    field: Some(format!("steps[{}].functions", step.name)),
                });
            }
        }
    }
    Ok(())
}

/// `nested_pipeline` steps must set exactly one of `pipeline_file` or
/// `pipeline`; the referenced file itself is resolved at execution time by
/// the Executor, not here.
fn validate_nested_pipeline_references(workflow: &Workflow) -> Result<(), PipelineError> {
    for step in all_steps(&workflow.steps) {
        if let StepKind::NestedPipeline(nested) = &step.kind {
            match (&nested.pipeline_file, &nested.pipeline) {
                (None, None) => {
                    return Err(PipelineError::Validation {
                        message: format!(
                            "step '{}' must set exactly one of 'pipeline_file' or 'pipeline'",
                            step.name
                        ),
                        field: Some(format!("steps[{}]", step.name)),
                    });
                }
                (Some(_), Some(_)) => {
                    return Err(PipelineError::Validation {
                        message: format!(
                            "step '{}' sets both 'pipeline_file' and 'pipeline'; only one is allowed",
                            step.name
                        ),
                        field: Some(format!("steps[{}]", step.name)),
                    });
                }
                (Some(path), None) if path.trim().is_empty() => {
                    return Err(PipelineError::Validation {
                        message: format!("step '{}' has an empty nested pipeline path", step.name),
                        field: Some(format!("steps[{}].pipeline_file", step.name)),
                    });
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn warn_on_soft_limits(workflow: &Workflow) {
    let count = all_steps(&workflow.steps).len();
    if count > SOFT_STEP_COUNT_LIMIT {
        tracing::warn!(
            step_count = count,
            limit = SOFT_STEP_COUNT_LIMIT,
            "workflow '{}' has an unusually large step count",
            workflow.name
        );
    }
}
