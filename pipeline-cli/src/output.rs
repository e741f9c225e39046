//! ABOUTME: Output formatting for command results: plain text summaries or
//! ABOUTME: a full JSON/YAML rendering of the underlying data.

use crate::cli::OutputFormat;
use anyhow::Result;
use pipeline_core::ResultStore;
use serde_json::Value as Json;

/// Render a completed workflow's Result Store.
pub fn format_results(results: &ResultStore, format: OutputFormat) -> Result<String> {
    let json = results.to_json();
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&json)?),
        OutputFormat::Yaml => Ok(serde_yaml::to_string(&json)?),
        OutputFormat::Text => Ok(format_results_text(results)),
    }
}

fn format_results_text(results: &ResultStore) -> String {
    let summary = results.summary();
    let mut out = String::new();
    for name in results.order() {
        let Some(result) = results.get(name) else {
            continue;
        };
        out.push_str(&format!(
            "[{}] {}\n",
            if result.success { "ok" } else { "FAILED" },
            name
        ));
        if !result.text.is_empty() {
            out.push_str(&format!("  {}\n", result.text));
        }
    }
    out.push_str(&format!(
        "\n{} steps, {} succeeded, {} failed, cost {:.4}\n",
        summary.total_steps, summary.successful_steps, summary.failed_steps, summary.total_cost
    ));
    out
}

/// Render any serializable value (a workflow's `info` summary, a single
/// step's result, ...) under the requested format.
pub fn format_value(value: &Json, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => Ok(serde_yaml::to_string(value)?),
        OutputFormat::Text => Ok(render_text(value, 0)),
    }
}

fn render_text(value: &Json, indent: usize) -> String {
    let pad = "  ".repeat(indent);
    match value {
        Json::Object(map) => {
            let mut out = String::new();
            for (key, v) in map {
                match v {
                    Json::Object(_) | Json::Array(_) => {
                        out.push_str(&format!("{pad}{key}:\n{}", render_text(v, indent + 1)));
                    }
                    _ => out.push_str(&format!("{pad}{key}: {}\n", render_scalar(v))),
                }
            }
            out
        }
        Json::Array(items) => {
            let mut out = String::new();
            for item in items {
                out.push_str(&format!("{pad}- {}\n", render_scalar_or_inline(item)));
            }
            out
        }
        other => format!("{pad}{}\n", render_scalar(other)),
    }
}

fn render_scalar(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_scalar_or_inline(value: &Json) -> String {
    match value {
        Json::Object(_) => serde_json::to_string(value).unwrap_or_default(),
        other => render_scalar(other),
    }
}
