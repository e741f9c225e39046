//! ABOUTME: Function table — resolves a workflow's `functions` map into the
//! ABOUTME: tool-declaration list a `gemini_instructor`/`gemini` step's
//! ABOUTME: `functions` references pull from (§4.5/§4.10).

use pipeline_core::{PipelineError, Result, Value};
use pipeline_providers::ToolDeclaration;
use std::collections::BTreeMap;

/// Parse a workflow's `functions.<name>` declaration into a `ToolDeclaration`.
/// Each entry is a `Value::Map` with `description` and `parameters` fields;
/// `name` is taken from the table key, not the declaration body, so renaming
/// a function in the table can't silently desync it from its own schema.
fn parse_declaration(name: &str, declaration: &Value) -> Result<ToolDeclaration> {
    let description = declaration
        .get_path("description")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            PipelineError::validation(format!(
                "function '{name}' declaration missing string 'description' field"
            ))
        })?
        .to_string();
    let parameters = declaration
        .get_path("parameters")
        .cloned()
        .unwrap_or(Value::Map(BTreeMap::new()));
    Ok(ToolDeclaration {
        name: name.to_string(),
        description,
        parameters,
    })
}

/// Build the full tool-declaration table from a workflow's `functions` map.
pub fn build_function_table(
    functions: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, ToolDeclaration>> {
    functions
        .iter()
        .map(|(name, declaration)| Ok((name.clone(), parse_declaration(name, declaration)?)))
        .collect()
}

/// Resolve a `gemini`/`gemini_instructor` step's `functions` list against the
/// workflow's table, in the order the step lists them. Validation already
/// rejects unknown names before a workflow runs (`validate_gemini_function_references`);
/// this still errors defensively rather than silently dropping one.
pub fn resolve_functions(
    names: &[String],
    table: &BTreeMap<String, ToolDeclaration>,
) -> Result<Vec<ToolDeclaration>> {
    names
        .iter()
        .map(|name| {
            table.get(name).cloned().ok_or_else(|| {
                PipelineError::validation(format!("unknown function reference '{name}'"))
            })
        })
        .collect()
}
