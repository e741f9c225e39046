//! ABOUTME: Benchmarks the Template Engine's hot path — rendering a prompt
//! ABOUTME: with several placeholders against a populated Result Store.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pipeline_core::{ResultStore, StepResult, VariableState, Value};
use pipeline_workflows::TemplateContext;
use std::collections::BTreeMap;

const TEMPLATE: &str = "Summary of {{inputs.topic}}:\n\
    {{step_one.text}}\n\
    {{step_two.text}}\n\
    Cost so far: {{vars.running_cost}}\n\
    Workspace: {{workspace_dir}}";

fn bench_render(c: &mut Criterion) {
    let mut results = ResultStore::new();
    results
        .put("step_one", StepResult::text("first result body"))
        .unwrap();
    results
        .put("step_two", StepResult::text("second result body").with_cost(0.42))
        .unwrap();

    let mut inputs = BTreeMap::new();
    inputs.insert("topic".to_string(), Value::String("benchmarks".to_string()));

    let mut vars = VariableState::new();
    vars.set(
        pipeline_core::VariableScope::Global,
        "running_cost",
        Value::Number(1.23),
    );

    let ctx = TemplateContext {
        results: &results,
        inputs: &inputs,
        vars: &vars,
        loop_item: None,
        workspace_dir: Some("/tmp/workspace"),
    };

    c.bench_function("render_multi_placeholder_template", |b| {
        b.iter(|| pipeline_workflows::template::render(black_box(TEMPLATE), black_box(&ctx)))
    });
}

criterion_group!(benches, bench_render);
criterion_main!(benches);
