//! ABOUTME: Option Builder — named option presets, deep-merge with
//! ABOUTME: step-level overrides, and preset resolution precedence (§4.8).

use pipeline_core::Value;
use std::collections::BTreeMap;

/// The closed set of built-in presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Development,
    Production,
    Analysis,
    Chat,
    Test,
}

impl Preset {
    pub fn name(&self) -> &'static str {
        match self {
            Preset::Development => "development",
            Preset::Production => "production",
            Preset::Analysis => "analysis",
            Preset::Chat => "chat",
            Preset::Test => "test",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "development" => Some(Preset::Development),
            "production" => Some(Preset::Production),
            "analysis" => Some(Preset::Analysis),
            "chat" => Some(Preset::Chat),
            "test" => Some(Preset::Test),
            _ => None,
        }
    }

    /// The preset's base option map, expressed as a `Value::Map` so it can
    /// be deep-merged the same way step-level overrides are.
    pub fn base_options(&self) -> Value {
        let mut map = BTreeMap::new();
        match self {
            Preset::Development => {
                map.insert("verbose".to_string(), Value::Bool(true));
                map.insert("debug_mode".to_string(), Value::Bool(true));
                map.insert("telemetry_enabled".to_string(), Value::Bool(false));
                map.insert("timeout_ms".to_string(), Value::Number(120_000.0));
            }
            Preset::Production => {
                map.insert("verbose".to_string(), Value::Bool(false));
                map.insert("debug_mode".to_string(), Value::Bool(false));
                map.insert("telemetry_enabled".to_string(), Value::Bool(true));
                map.insert("cost_tracking".to_string(), Value::Bool(true));
                map.insert("timeout_ms".to_string(), Value::Number(60_000.0));
            }
            Preset::Analysis => {
                map.insert("max_turns".to_string(), Value::Number(1.0));
                map.insert("output_format".to_string(), Value::String("json".to_string()));
                map.insert("timeout_ms".to_string(), Value::Number(180_000.0));
            }
            Preset::Chat => {
                map.insert("resume_session".to_string(), Value::Bool(true));
                map.insert("async_streaming".to_string(), Value::Bool(true));
                map.insert("timeout_ms".to_string(), Value::Number(60_000.0));
            }
            Preset::Test => {
                map.insert("telemetry_enabled".to_string(), Value::Bool(false));
                map.insert("cost_tracking".to_string(), Value::Bool(false));
                map.insert("timeout_ms".to_string(), Value::Number(5_000.0));
            }
        }
        Value::Map(map)
    }
}

/// Recursively merge `overrides` onto `base`: maps merge key-by-key
/// (recursing into nested maps), any other value in `overrides` replaces
/// the corresponding value in `base` outright. Idempotent: merging the
/// same overrides twice yields the same result as merging once.
pub fn deep_merge(base: &Value, overrides: &Value) -> Value {
    match (base, overrides) {
        (Value::Map(base_map), Value::Map(override_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in override_map {
                let next = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Map(merged)
        }
        (_, other) => other.clone(),
    }
}

/// Build the effective option map for a step: the named preset's base
/// options deep-merged with the step's own `options` override map.
pub fn merge(preset: Preset, overrides: &Value) -> Value {
    deep_merge(&preset.base_options(), overrides)
}

/// `apply_preset_optimizations` is a no-op pass over an already-merged
/// option map that fills in preset-implied values the merge itself cannot
/// express (e.g. `production` forces `cost_tracking` on even if a step
/// override explicitly turned it off, since cost tracking in production is
/// a safety requirement, not a preference). Applying it twice is a no-op.
pub fn apply_preset_optimizations(preset: Preset, options: Value) -> Value {
    match preset {
        Preset::Production => deep_merge(
            &options,
            &Value::Map(BTreeMap::from([(
                "cost_tracking".to_string(),
                Value::Bool(true),
            )])),
        ),
        _ => options,
    }
}

/// Resolve which preset applies to a step, honoring the documented
/// precedence: `step.preset` > `workflow.defaults.claude_preset` >
/// environment-aware selection (`environment.mode` mapped to a
/// same-named preset) > the built-in `development` default.
pub fn resolve_preset(
    step_preset: Option<&str>,
    workflow_default_preset: Option<&str>,
    environment_mode: Option<&str>,
) -> Preset {
    step_preset
        .and_then(Preset::from_name)
        .or_else(|| workflow_default_preset.and_then(Preset::from_name))
        .or_else(|| environment_mode.and_then(Preset::from_name))
        .unwrap_or(Preset::Development)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_recurses_into_nested_maps() {
        let base = Value::Map(BTreeMap::from([(
            "retry_config".to_string(),
            Value::Map(BTreeMap::from([
                ("max_retries".to_string(), Value::Number(3.0)),
                ("base_delay_ms".to_string(), Value::Number(200.0)),
            ])),
        )]));
        let overrides = Value::Map(BTreeMap::from([(
            "retry_config".to_string(),
            Value::Map(BTreeMap::from([(
                "max_retries".to_string(),
                Value::Number(5.0),
            )])),
        )]));
        let merged = deep_merge(&base, &overrides);
        let retry = merged.get_path("retry_config.max_retries").unwrap();
        assert_eq!(retry.as_f64(), Some(5.0));
        let untouched = merged.get_path("retry_config.base_delay_ms").unwrap();
        assert_eq!(untouched.as_f64(), Some(200.0));
    }

    #[test]
    fn deep_merge_replaces_non_map_values_outright() {
        let base = Value::Map(BTreeMap::from([(
            "allowed_tools".to_string(),
            Value::List(vec![Value::String("a".to_string())]),
        )]));
        let overrides = Value::Map(BTreeMap::from([(
            "allowed_tools".to_string(),
            Value::List(vec![Value::String("b".to_string())]),
        )]));
        let merged = deep_merge(&base, &overrides);
        let tools = merged.get_path("allowed_tools").unwrap();
        assert_eq!(tools.as_list().unwrap().len(), 1);
    }

    #[test]
    fn apply_preset_optimizations_is_idempotent() {
        let options = Preset::Production.base_options();
        let once = apply_preset_optimizations(Preset::Production, options.clone());
        let twice = apply_preset_optimizations(Preset::Production, once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn resolve_preset_honors_documented_precedence() {
        assert_eq!(
            resolve_preset(Some("chat"), Some("production"), Some("analysis")).name(),
            "chat"
        );
        assert_eq!(
            resolve_preset(None, Some("production"), Some("analysis")).name(),
            "production"
        );
        assert_eq!(resolve_preset(None, None, Some("analysis")).name(), "analysis");
        assert_eq!(resolve_preset(None, None, None).name(), "development");
    }

    #[test]
    fn unknown_preset_names_fall_through_to_next_precedence_level() {
        assert_eq!(
            resolve_preset(Some("nonexistent"), Some("chat"), None).name(),
            "chat"
        );
    }
}
