//! ABOUTME: Template Engine — resolves `{{...}}` placeholders against the
//! ABOUTME: Result Store by bare step name, declared inputs, workflow
//! ABOUTME: variables, the active loop context, and the workspace directory.

use pipeline_core::{Extracted, PromptFormat, ResultStore, Value, VariableState};
use std::collections::BTreeMap;

/// Everything template rendering needs to resolve a placeholder, borrowed
/// for the duration of one render call.
pub struct TemplateContext<'a> {
    pub results: &'a ResultStore,
    pub inputs: &'a BTreeMap<String, Value>,
    pub vars: &'a VariableState,
    pub loop_item: Option<&'a BTreeMap<String, Value>>,
    /// The pipeline's workspace directory, sourced from the Safety
    /// Manager's lifecycle (auto-created when none is configured), so
    /// `{{workspace_dir}}` always resolves to the directory actually in use.
    pub workspace_dir: Option<&'a str>,
}

/// Render every `{{...}}` placeholder in `text` against `ctx`.
///
/// Resolution order for a placeholder:
/// - `workspace_dir` (exact) — the active workspace directory.
/// - `previous_response:<step>:<field>` — a prior step's result, `field`
///   optional (defaults to `text`).
/// - `inputs.<key>` — looked up in the declared-inputs map. A declared
///   input with no value resolves to the empty string; an undeclared key
///   is left untouched, same as an unknown result.
/// - `loop.<field>` — resolved against the active loop context, if any
///   (the iterator's chosen name, plus `index`/`iteration`/`total`/
///   `first`/`last`); outside a loop body these are left untouched.
/// - `vars.<key>` — resolved against workflow variable state (narrowest
///   scope wins); unset variables are left untouched.
/// - anything else — the first dot segment names a step, the remainder is
///   a dotted path into that step's result (`{{step_name.field.sub}}`,
///   bare `{{step_name}}` for the whole result). A step that hasn't run
///   yet (skipped by its condition, or simply unknown) leaves the
///   placeholder text untouched rather than substituting anything, so a
///   reader can tell the value never materialized.
pub fn render(text: &str, ctx: &TemplateContext<'_>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let Some(start) = rest.find("{{") else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            // Unterminated placeholder: emit the rest verbatim.
            out.push_str(&rest[start..]);
            break;
        };
        let placeholder = after_open[..end].trim();
        match resolve(placeholder, ctx) {
            Some(rendered) => out.push_str(&rendered),
            None => {
                out.push_str("{{");
                out.push_str(placeholder);
                out.push_str("}}");
            }
        }
        rest = &after_open[end + 2..];
    }
    out
}

fn resolve(placeholder: &str, ctx: &TemplateContext<'_>) -> Option<String> {
    if let Some(path) = placeholder.strip_prefix("inputs.") {
        return ctx
            .inputs
            .get(path)
            .map(|v| if v.is_null() { String::new() } else { v.render() });
    }
    resolve_raw(placeholder, ctx).map(|v| v.render())
}

/// Resolve a placeholder's body (without the surrounding `{{ }}`) to its
/// underlying `Value`, without stringifying. Used where a field's shape
/// must survive the placeholder (e.g. `for_loop`'s
/// `over: "{{inputs.items}}"` must still see a list), and shared with the
/// Condition Engine's path resolution.
pub(crate) fn resolve_raw(placeholder: &str, ctx: &TemplateContext<'_>) -> Option<Value> {
    if placeholder == "workspace_dir" {
        return ctx.workspace_dir.map(|dir| Value::String(dir.to_string()));
    }
    if let Some(rest) = placeholder.strip_prefix("previous_response:") {
        let mut parts = rest.splitn(2, ':');
        let step_name = parts.next().unwrap_or("");
        let field = parts.next().unwrap_or("text");
        return match ctx.results.extract(step_name, field) {
            Extracted::Found(value) => Some(value),
            Extracted::NotFound => None,
        };
    }
    let (namespace, path) = placeholder.split_once('.').unwrap_or((placeholder, ""));
    match namespace {
        "inputs" => ctx.inputs.get(path).cloned(),
        "loop" => ctx.loop_item.and_then(|m| m.get(path)).cloned(),
        "vars" => ctx.vars.resolve_scoped(path).cloned(),
        _ => {
            let (step_name, rest) = placeholder.split_once('.').unwrap_or((placeholder, ""));
            match ctx.results.extract(step_name, rest) {
                Extracted::Found(value) => Some(value),
                Extracted::NotFound => None,
            }
        }
    }
}

/// Resolve a field that is expected to carry a structured value (a
/// `for_loop`'s `over`, a condition's bare reference): when `text` is
/// exactly one `{{...}}` placeholder, return the underlying `Value`
/// unrendered; otherwise fall back to full string rendering wrapped in
/// `Value::String`.
pub fn resolve_to_value(text: &str, ctx: &TemplateContext<'_>) -> Value {
    let trimmed = text.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
    {
        if !inner.contains("{{") {
            return resolve_raw(inner.trim(), ctx).unwrap_or(Value::Null);
        }
    }
    Value::String(render(text, ctx))
}

/// Render every string leaf of a structured `Value` (used for
/// `nested_pipeline`'s `inputs` map, whose values may themselves be
/// template placeholders referencing the parent pipeline's results).
pub fn render_value(value: &Value, ctx: &TemplateContext<'_>) -> Value {
    match value {
        Value::String(s) => resolve_to_value(s, ctx),
        Value::List(items) => Value::List(items.iter().map(|v| render_value(v, ctx)).collect()),
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render a step result into prompt text the way the Prompt Builder embeds
/// prior work: prefer `text`, fall back to pretty-printed JSON.
pub fn transform_for_prompt(store: &ResultStore, step_name: &str, force_json: bool) -> Option<String> {
    store.transform_for_prompt(step_name, PromptFormat { force_json })
}

/// Extension trait filling the gap between `VariableState::resolve` (which
/// only takes a bare key) and the engine's need to resolve `vars.<key>`
/// dotted paths against nested values.
trait ResolveScoped {
    fn resolve_scoped(&self, path: &str) -> Option<&Value>;
}

impl ResolveScoped for VariableState {
    fn resolve_scoped(&self, path: &str) -> Option<&Value> {
        let (key, rest) = path.split_once('.').unwrap_or((path, ""));
        let value = self.resolve(key)?;
        if rest.is_empty() {
            Some(value)
        } else {
            value.get_path(rest)
        }
    }
}
