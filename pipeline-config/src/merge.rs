//! ABOUTME: Defaults merging — fold `workflow.defaults` into a step's own
//! ABOUTME: `options`/`preset`/`timeout_ms` fields before dispatch.

use crate::schema::{Defaults, Step, StepKind};
use pipeline_core::Value;

/// The effective per-step configuration after folding workflow defaults in.
/// Step-level fields always win; a field left unset on the step falls back
/// to the workflow default, and a field unset on both is `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectiveStepConfig {
    pub preset: Option<String>,
    pub timeout_ms: Option<u64>,
    pub options: Option<Value>,
}

/// Merge `defaults` under a step's own preset/options, following the same
/// override-only-if-present convention used throughout the orchestrator's
/// config layer: a step value of `None` defers to the default, `Some`
/// always wins regardless of what the default held.
pub fn merge_step_defaults(defaults: &Defaults, step: &Step) -> EffectiveStepConfig {
    let (step_preset, step_options) = step_preset_and_options(&step.kind);

    let options = match (&defaults.options, &step_options) {
        (Some(default_opts), Some(step_opts)) => Some(deep_merge_values(default_opts, step_opts)),
        (Some(default_opts), None) => Some(default_opts.clone()),
        (None, Some(step_opts)) => Some(step_opts.clone()),
        (None, None) => None,
    };

    EffectiveStepConfig {
        preset: step_preset.or_else(|| defaults.claude_preset.clone()),
        timeout_ms: defaults.timeout_ms,
        options,
    }
}

/// Recursive map merge: `overrides` wins key-by-key, recursing into nested
/// maps and replacing scalars/lists outright, same convention the Option
/// Builder uses over provider options.
fn deep_merge_values(base: &Value, overrides: &Value) -> Value {
    match (base, overrides) {
        (Value::Map(base_map), Value::Map(override_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in override_map {
                let next = match merged.get(key) {
                    Some(existing) => deep_merge_values(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Map(merged)
        }
        (_, other) => other.clone(),
    }
}

fn step_preset_and_options(kind: &StepKind) -> (Option<String>, Option<Value>) {
    match kind {
        StepKind::Claude(s) => (s.preset.clone(), s.options.clone()),
        StepKind::ClaudeSmart(s) => (s.preset.clone(), s.options.clone()),
        StepKind::ClaudeSession(s) => (s.preset.clone(), s.options.clone()),
        StepKind::ClaudeExtract(s) => (s.preset.clone(), s.options.clone()),
        StepKind::ClaudeBatch(s) => (s.preset.clone(), s.options.clone()),
        StepKind::ClaudeRobust(s) => (s.preset.clone(), s.options.clone()),
        StepKind::ParallelClaude(s) => (s.preset.clone(), s.options.clone()),
        StepKind::Gemini(s) => (None, s.options.clone()),
        StepKind::GeminiInstructor(s) => (None, s.options.clone()),
        StepKind::SetVariable(_)
        | StepKind::DataTransform(_)
        | StepKind::FileOps(_)
        | StepKind::CodebaseQuery(_)
        | StepKind::ForLoop(_)
        | StepKind::WhileLoop(_)
        | StepKind::NestedPipeline(_)
        | StepKind::TestEcho(_) => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ClaudeStep, StepKind};
    use std::collections::BTreeMap;

    fn claude_step(name: &str, preset: Option<&str>, options: Option<Value>) -> Step {
        Step {
            name: name.to_string(),
            condition: None,
            output_to_file: None,
            output_schema: None,
            kind: StepKind::Claude(ClaudeStep {
                prompt: vec![crate::schema::PromptPart::Static {
                    text: "p".to_string(),
                }],
                preset: preset.map(str::to_string),
                options,
            }),
        }
    }

    #[test]
    fn step_preset_overrides_default_preset() {
        let defaults = Defaults {
            claude_preset: Some("production".to_string()),
            timeout_ms: None,
            options: None,
        };
        let step = claude_step("s", Some("chat"), None);
        let effective = merge_step_defaults(&defaults, &step);
        assert_eq!(effective.preset.as_deref(), Some("chat"));
    }

    #[test]
    fn missing_step_preset_falls_back_to_default() {
        let defaults = Defaults {
            claude_preset: Some("production".to_string()),
            timeout_ms: Some(5_000),
            options: None,
        };
        let step = claude_step("s", None, None);
        let effective = merge_step_defaults(&defaults, &step);
        assert_eq!(effective.preset.as_deref(), Some("production"));
        assert_eq!(effective.timeout_ms, Some(5_000));
    }

    #[test]
    fn step_options_deep_merge_over_default_options() {
        let defaults = Defaults {
            claude_preset: None,
            timeout_ms: None,
            options: Some(Value::Map(BTreeMap::from([(
                "max_turns".to_string(),
                Value::Number(1.0),
            )]))),
        };
        let step = claude_step(
            "s",
            None,
            Some(Value::Map(BTreeMap::from([(
                "output_format".to_string(),
                Value::String("json".to_string()),
            )]))),
        );
        let effective = merge_step_defaults(&defaults, &step);
        let options = effective.options.unwrap();
        assert_eq!(
            options.get_path("max_turns").and_then(Value::as_f64),
            Some(1.0)
        );
        assert_eq!(
            options.get_path("output_format").and_then(Value::as_str),
            Some("json")
        );
    }
}
