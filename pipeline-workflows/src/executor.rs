//! ABOUTME: Executor — the top-level driver that walks a workflow's steps
//! ABOUTME: in order, rendering prompts, evaluating conditions, dispatching
//! ABOUTME: leaf steps, and recursing into control-flow steps.

use crate::condition;
use crate::control_flow;
use crate::dispatch::{self, Providers};
use crate::prompt::PromptContext;
use crate::safety;
use crate::template::{self, TemplateContext};
use futures::future::BoxFuture;
use pipeline_config::schema::{Defaults, EnvironmentConfig, PromptPart, Step, StepKind, Workflow};
use pipeline_core::{
    PipelineError, PipelineId, Result, ResultStore, SafetyContext, SafetyLimits, StepResult,
    VariableScope, VariableState, Value,
};
use pipeline_providers::options::{apply_preset_optimizations, merge, resolve_preset};
use pipeline_providers::ToolDeclaration;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Configuration shared, read-only, across an entire execution (including
/// into any `nested_pipeline` descendants).
pub struct Runtime<'a> {
    pub providers: Providers<'a>,
    pub functions: BTreeMap<String, ToolDeclaration>,
    pub workspace_dir: Option<PathBuf>,
    pub limits: SafetyLimits,
}

/// Build the workflow's Gemini tool-declaration table.
pub fn build_function_table(workflow: &Workflow) -> Result<BTreeMap<String, ToolDeclaration>> {
    crate::functions::build_function_table(&workflow.functions)
}

/// Resolve a workflow's declared `inputs` against what the caller supplied:
/// a provided value always wins, then a declared `default`, then `required`
/// inputs with neither are rejected.
pub fn resolve_inputs(
    workflow: &Workflow,
    provided: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>> {
    let mut resolved = provided.clone();
    for decl in &workflow.inputs {
        if resolved.contains_key(&decl.name) {
            continue;
        }
        if let Some(default) = &decl.default {
            resolved.insert(decl.name.clone(), default.clone());
        } else if decl.required {
            return Err(PipelineError::validation(format!(
                "missing required input '{}'",
                decl.name
            )));
        }
    }
    Ok(resolved)
}

/// Run a workflow document to completion, returning the populated Result
/// Store. `safety` carries the depth/step-count/timeout bookkeeping for
/// this invocation (root for a top-level run, a child context for a
/// `nested_pipeline` step).
pub async fn execute_workflow(
    workflow: &Workflow,
    inputs: BTreeMap<String, Value>,
    runtime: &Runtime<'_>,
    mut safety: SafetyContext,
) -> Result<ResultStore> {
    let inputs = resolve_inputs(workflow, &inputs)?;
    let mut results = ResultStore::new();
    let mut vars = VariableState::new();
    let guard = safety::enter_pipeline(&mut safety, runtime.workspace_dir.as_deref())?;
    let outcome = run_steps(
        &workflow.steps,
        &mut results,
        &mut vars,
        &mut safety,
        &inputs,
        None,
        &workflow.defaults,
        workflow.environment.mode.as_deref(),
        runtime,
        workflow.checkpoint_enabled,
        workflow.checkpoint_dir.as_deref(),
        false,
    )
    .await;
    safety::exit_pipeline(&mut safety, guard);
    outcome?;
    Ok(results)
}

fn workspace_dir_str(safety: &SafetyContext) -> Option<&str> {
    safety.workspace_dir.as_deref().and_then(|p| p.to_str())
}

/// Resolve a `nested_pipeline`'s `pipeline_file` against the active
/// workspace directory, the same convention the Prompt Builder's `file`
/// part uses: relative paths resolve against the workspace, absolute paths
/// pass through untouched.
fn resolve_nested_path(path: &str, workspace_dir: Option<&std::path::Path>) -> PathBuf {
    let candidate = PathBuf::from(path);
    if candidate.is_relative() {
        if let Some(dir) = workspace_dir {
            return dir.join(candidate);
        }
    }
    candidate
}

fn estimate_result_bytes(result: &StepResult) -> u64 {
    let mut bytes = result.text.len() as u64;
    if let Some(content) = &result.content {
        bytes += serde_json::to_vec(&serde_json::Value::from(content.clone()))
            .map(|v| v.len() as u64)
            .unwrap_or(0);
    }
    bytes
}

/// Persist the Result Store's current state to the checkpoint directory.
/// Checkpoint failures are logged, never fatal to the run itself.
fn write_checkpoint(results: &ResultStore, checkpoint_dir: Option<&str>) {
    let Some(dir) = checkpoint_dir else { return };
    if let Err(err) = std::fs::create_dir_all(dir) {
        tracing::warn!(error = %err, dir, "failed to create checkpoint directory");
        return;
    }
    let path = std::path::Path::new(dir).join("checkpoint.json");
    match serde_json::to_vec_pretty(&results.to_json()) {
        Ok(bytes) => {
            if let Err(err) = std::fs::write(&path, bytes) {
                tracing::warn!(error = %err, path = %path.display(), "failed to write checkpoint");
            }
        }
        Err(err) => tracing::warn!(error = %err, "failed to serialize checkpoint"),
    }
}

/// Walk `steps` in order against the shared execution state. Recurses into
/// itself for `for_loop`/`while_loop` bodies and (via `execute_workflow`)
/// for `nested_pipeline`.
///
/// `overwrite_results` selects `ResultStore::upsert` over `put` at the
/// per-step write: `while_loop`'s body reruns the same step names every
/// iteration against the real outer store and must overwrite rather than
/// error on the second write.
#[allow(clippy::too_many_arguments)]
fn run_steps<'a>(
    steps: &'a [Step],
    results: &'a mut ResultStore,
    vars: &'a mut VariableState,
    safety: &'a mut SafetyContext,
    inputs: &'a BTreeMap<String, Value>,
    loop_item: Option<&'a BTreeMap<String, Value>>,
    defaults: &'a Defaults,
    environment_mode: Option<&'a str>,
    runtime: &'a Runtime<'a>,
    checkpoint_enabled: bool,
    checkpoint_dir: Option<&'a str>,
    overwrite_results: bool,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        for step in steps {
            let workspace_dir = workspace_dir_str(safety);
            let ctx = TemplateContext {
                results: &*results,
                inputs,
                vars: &*vars,
                loop_item,
                workspace_dir,
            };
            if let Some(expr) = &step.condition {
                if !condition::evaluate(expr, &ctx)? {
                    continue;
                }
            }
            safety::check_before_step(safety)?;
            safety.record_step();

            let result = match &step.kind {
                StepKind::ForLoop(body) => {
                    let over = template::resolve_to_value(&body.over, &ctx);
                    let items = control_flow::resolve_iterable(&over);
                    let iterator_name = body.iterator.as_deref().unwrap_or("item");
                    let total = items.len();
                    let mut iteration_records = Vec::with_capacity(total);
                    let mut overall_success = true;
                    let mut max_iterations_reached = false;
                    for (index, item) in items.into_iter().enumerate() {
                        if let Some(cap) = body.max_iterations {
                            if control_flow::iteration_limit_reached(index, cap) {
                                max_iterations_reached = true;
                                break;
                            }
                        }
                        let namespace =
                            control_flow::loop_namespace(iterator_name, item, index, total);
                        let mut iter_results = ResultStore::new();
                        let outcome = run_steps(
                            &body.body,
                            &mut iter_results,
                            &mut *vars,
                            &mut *safety,
                            inputs,
                            Some(&namespace),
                            defaults,
                            environment_mode,
                            runtime,
                            false,
                            checkpoint_dir,
                            false,
                        )
                        .await;
                        let success = outcome.is_ok();
                        overall_success &= success;
                        let mut record = BTreeMap::new();
                        record.insert("index".to_string(), Value::Number(index as f64));
                        record.insert("success".to_string(), Value::Bool(success));
                        match outcome {
                            Ok(()) => {
                                let output: BTreeMap<String, Value> = iter_results
                                    .iter()
                                    .map(|(name, r)| (name.clone(), r.to_value()))
                                    .collect();
                                record.insert("output".to_string(), Value::Map(output));
                            }
                            Err(err) => {
                                record.insert("error".to_string(), Value::String(err.to_string()));
                            }
                        }
                        iteration_records.push(Value::Map(record));
                    }
                    let content = Value::Map(BTreeMap::from([
                        ("iterations".to_string(), Value::List(iteration_records)),
                        ("success".to_string(), Value::Bool(overall_success)),
                        (
                            "max_iterations_reached".to_string(),
                            Value::Bool(max_iterations_reached),
                        ),
                    ]));
                    StepResult::text(format!("completed {total} iteration(s)"))
                        .with_content(content)
                }
                StepKind::WhileLoop(body) => {
                    let mut iteration = 0usize;
                    let mut overall_success = true;
                    let mut max_iterations_reached = false;
                    loop {
                        if control_flow::iteration_limit_reached(iteration, body.max_iterations) {
                            max_iterations_reached = true;
                            break;
                        }
                        let namespace = control_flow::loop_namespace(
                            "iteration",
                            Value::Number(iteration as f64),
                            iteration,
                            body.max_iterations,
                        );
                        let cond_ctx = TemplateContext {
                            results: &*results,
                            inputs,
                            vars: &*vars,
                            loop_item: Some(&namespace),
                            workspace_dir: workspace_dir_str(safety),
                        };
                        if !condition::evaluate(&body.condition, &cond_ctx)? {
                            break;
                        }
                        let outcome = run_steps(
                            &body.body,
                            &mut *results,
                            &mut *vars,
                            &mut *safety,
                            inputs,
                            Some(&namespace),
                            defaults,
                            environment_mode,
                            runtime,
                            checkpoint_enabled,
                            checkpoint_dir,
                            true,
                        )
                        .await;
                        if let Err(err) = &outcome {
                            tracing::warn!(iteration, error = %err, "while_loop iteration failed, continuing");
                        }
                        overall_success &= outcome.is_ok();
                        iteration += 1;
                    }
                    let content = Value::Map(BTreeMap::from([
                        ("iterations".to_string(), Value::Number(iteration as f64)),
                        ("success".to_string(), Value::Bool(overall_success)),
                        (
                            "max_iterations_reached".to_string(),
                            Value::Bool(max_iterations_reached),
                        ),
                    ]));
                    StepResult::text(format!("completed {iteration} iteration(s)"))
                        .with_content(content)
                }
                StepKind::NestedPipeline(nested) => {
                    let child_inputs: BTreeMap<String, Value> = nested
                        .inputs
                        .iter()
                        .map(|(k, v)| (k.clone(), template::render_value(v, &ctx)))
                        .collect();
                    let (child_workflow, child_pipeline_id) =
                        match (&nested.pipeline_file, &nested.pipeline) {
                            (Some(path), None) => {
                                let resolved =
                                    resolve_nested_path(path, safety.workspace_dir.as_deref());
                                let workflow = pipeline_config::load_workflow(&resolved)?;
                                let id = PipelineId::from_path(&resolved.to_string_lossy());
                                (workflow, id)
                            }
                            (None, Some(inline)) => {
                                let workflow = Workflow {
                                    name: inline
                                        .name
                                        .clone()
                                        .unwrap_or_else(|| step.name.clone()),
                                    description: None,
                                    defaults: Defaults::default(),
                                    environment: EnvironmentConfig::default(),
                                    checkpoint_enabled: false,
                                    checkpoint_dir: None,
                                    inputs: Vec::new(),
                                    functions: BTreeMap::new(),
                                    steps: inline.steps.clone(),
                                };
                                (workflow, PipelineId::new())
                            }
                            _ => {
                                return Err(PipelineError::internal(
                                    "nested_pipeline step must set exactly one of pipeline_file or pipeline",
                                ));
                            }
                        };
                    safety::check_before_descend(safety, child_pipeline_id)?;
                    let parent = std::sync::Arc::new(safety.clone());
                    let mut child_safety = SafetyContext::child(&parent, safety.limits);
                    child_safety.pipeline_id = child_pipeline_id;
                    let child_functions =
                        crate::functions::build_function_table(&child_workflow.functions)?;
                    let child_runtime = Runtime {
                        providers: Providers {
                            assistant: runtime.providers.assistant,
                            structured: runtime.providers.structured,
                            sessions: runtime.providers.sessions,
                        },
                        functions: child_functions,
                        workspace_dir: safety.workspace_dir.clone(),
                        limits: runtime.limits,
                    };
                    let child_results = Box::pin(execute_workflow(
                        &child_workflow,
                        child_inputs,
                        &child_runtime,
                        child_safety,
                    ))
                    .await?;
                    for name in &nested.outputs {
                        if let Some(r) = child_results.get(name) {
                            results.upsert(name.clone(), r.clone());
                        }
                    }
                    StepResult::text(format!(
                        "nested pipeline completed ({} step(s))",
                        child_results.len()
                    ))
                    .with_content(Value::from(child_results.to_json()))
                    .with_cost(child_results.summary().total_cost)
                }
                kind => {
                    let effective = pipeline_config::merge_step_defaults(defaults, step);
                    let preset = resolve_preset(
                        effective.preset.as_deref(),
                        defaults.claude_preset.as_deref(),
                        environment_mode,
                    );
                    let empty_options = Value::map();
                    let overrides = effective.options.as_ref().unwrap_or(&empty_options);
                    let merged = apply_preset_optimizations(preset, merge(preset, overrides));
                    let pc = PromptContext {
                        template: TemplateContext {
                            results: &*results,
                            inputs,
                            vars: &*vars,
                            loop_item,
                            workspace_dir,
                        },
                        sessions: Some(runtime.providers.sessions),
                    };
                    let render_parts = |parts: &[PromptPart]| pc.build(parts);
                    let resolve_value = |text: &str| template::resolve_to_value(text, &pc.template);
                    dispatch::dispatch_leaf_step(
                        kind,
                        &merged,
                        &runtime.providers,
                        &render_parts,
                        &resolve_value,
                        &runtime.functions,
                    )
                    .await?
                }
            };

            if let StepKind::SetVariable(set) = &step.kind {
                vars.set(VariableScope::Global, &set.variable, set.value.clone());
            }
            if let Some(schema) = &step.output_schema {
                if let Some(content) = &result.content {
                    pipeline_providers::validate_against_schema(content, schema)?;
                }
            }
            if let Some(path) = &step.output_to_file {
                std::fs::write(path, &result.text).map_err(|err| PipelineError::File {
                    message: err.to_string(),
                    path: Some(path.clone()),
                })?;
            }
            safety.record_bytes(estimate_result_bytes(&result));
            if overwrite_results {
                results.upsert(step.name.clone(), result);
            } else {
                results.put(step.name.clone(), result)?;
            }
            if checkpoint_enabled {
                write_checkpoint(results, checkpoint_dir);
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_config::schema::{ForLoopStep, TestEchoStep, WhileLoopStep};
    use pipeline_providers::{MockAssistantProvider, MockStructuredProvider, SessionManager};

    fn echo_step(name: &str, message: &str) -> Step {
        Step {
            name: name.to_string(),
            condition: None,
            output_to_file: None,
            output_schema: None,
            kind: StepKind::TestEcho(TestEchoStep {
                message: message.to_string(),
            }),
        }
    }

    fn workflow(steps: Vec<Step>) -> Workflow {
        Workflow {
            name: "test".to_string(),
            description: None,
            defaults: Defaults::default(),
            environment: EnvironmentConfig::default(),
            checkpoint_enabled: false,
            checkpoint_dir: None,
            inputs: Vec::new(),
            functions: BTreeMap::new(),
            steps,
        }
    }

    fn runtime<'a>(
        assistant: &'a MockAssistantProvider,
        structured: &'a MockStructuredProvider,
        sessions: &'a SessionManager,
    ) -> Runtime<'a> {
        Runtime {
            providers: Providers {
                assistant,
                structured,
                sessions,
            },
            functions: BTreeMap::new(),
            workspace_dir: None,
            limits: SafetyLimits::default(),
        }
    }

    #[tokio::test]
    async fn runs_steps_in_order_and_populates_result_store() {
        let assistant = MockAssistantProvider::new();
        let structured = MockStructuredProvider::new();
        let sessions = SessionManager::new();
        let wf = workflow(vec![echo_step("a", "1"), echo_step("b", "2")]);
        let rt = runtime(&assistant, &structured, &sessions);
        let results = execute_workflow(&wf, BTreeMap::new(), &rt, SafetyContext::root(rt.limits))
            .await
            .unwrap();
        assert_eq!(results.order(), &["a".to_string(), "b".to_string()]);
        assert_eq!(results.get("b").unwrap().text, "2");
    }

    #[tokio::test]
    async fn condition_gated_step_is_skipped_entirely() {
        let assistant = MockAssistantProvider::new();
        let structured = MockStructuredProvider::new();
        let sessions = SessionManager::new();
        let mut gated = echo_step("skipped", "never");
        gated.condition = Some("inputs.flag".to_string());
        let wf = workflow(vec![gated]);
        let rt = runtime(&assistant, &structured, &sessions);
        let results = execute_workflow(&wf, BTreeMap::new(), &rt, SafetyContext::root(rt.limits))
            .await
            .unwrap();
        assert!(!results.contains("skipped"));
    }

    #[tokio::test]
    async fn for_loop_runs_body_once_per_item() {
        let assistant = MockAssistantProvider::new();
        let structured = MockStructuredProvider::new();
        let sessions = SessionManager::new();
        let for_loop = Step {
            name: "iterate".to_string(),
            condition: None,
            output_to_file: None,
            output_schema: None,
            kind: StepKind::ForLoop(ForLoopStep {
                over: "{{inputs.items}}".to_string(),
                body: vec![echo_step("inner", "{{loop.item}}")],
                iterator: None,
                max_iterations: None,
            }),
        };
        let wf = workflow(vec![for_loop]);
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "items".to_string(),
            Value::list([Value::from("x"), Value::from("y")]),
        );
        let rt = runtime(&assistant, &structured, &sessions);
        let results = execute_workflow(&wf, inputs, &rt, SafetyContext::root(rt.limits))
            .await
            .unwrap();
        let content = results.get("iterate").unwrap().content.clone().unwrap();
        let iterations = content
            .get_path("iterations")
            .and_then(Value::as_list)
            .unwrap();
        assert_eq!(iterations.len(), 2);
        assert_eq!(
            content.get_path("success").and_then(Value::as_bool),
            Some(true)
        );
    }

    #[tokio::test]
    async fn for_loop_body_failure_does_not_abort_remaining_iterations() {
        let assistant = MockAssistantProvider::new();
        let structured = MockStructuredProvider::new();
        let sessions = SessionManager::new();
        let mut failing_inner = echo_step("inner", "{{loop.item}}");
        failing_inner.output_to_file = Some("/no/such/directory/out.txt".to_string());
        let for_loop = Step {
            name: "iterate".to_string(),
            condition: None,
            output_to_file: None,
            output_schema: None,
            kind: StepKind::ForLoop(ForLoopStep {
                over: "{{inputs.items}}".to_string(),
                body: vec![failing_inner],
                iterator: None,
                max_iterations: None,
            }),
        };
        let wf = workflow(vec![for_loop]);
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "items".to_string(),
            Value::list([Value::from("x"), Value::from("y")]),
        );
        let rt = runtime(&assistant, &structured, &sessions);
        let results = execute_workflow(&wf, inputs, &rt, SafetyContext::root(rt.limits))
            .await
            .unwrap();
        let content = results.get("iterate").unwrap().content.clone().unwrap();
        let iterations = content
            .get_path("iterations")
            .and_then(Value::as_list)
            .unwrap();
        assert_eq!(iterations.len(), 2);
    }

    #[tokio::test]
    async fn while_loop_merges_body_results_into_outer_store() {
        let assistant = MockAssistantProvider::new();
        let structured = MockStructuredProvider::new();
        let sessions = SessionManager::new();
        let while_loop = Step {
            name: "spin".to_string(),
            condition: None,
            output_to_file: None,
            output_schema: None,
            kind: StepKind::WhileLoop(WhileLoopStep {
                condition: "loop.index < 2".to_string(),
                body: vec![echo_step("tick", "{{loop.iteration}}")],
                max_iterations: 5,
            }),
        };
        let wf = workflow(vec![while_loop]);
        let rt = runtime(&assistant, &structured, &sessions);
        let results = execute_workflow(&wf, BTreeMap::new(), &rt, SafetyContext::root(rt.limits))
            .await
            .unwrap();
        assert_eq!(results.get("tick").unwrap().text, "2");
        let content = results.get("spin").unwrap().content.clone().unwrap();
        assert_eq!(
            content.get_path("iterations").and_then(Value::as_f64),
            Some(2.0)
        );
    }

    #[tokio::test]
    async fn resolve_inputs_rejects_missing_required_input() {
        let mut wf = workflow(vec![]);
        wf.inputs.push(pipeline_config::schema::InputDecl {
            name: "topic".to_string(),
            required: true,
            default: None,
        });
        let err = resolve_inputs(&wf, &BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
