//! ABOUTME: Result Store — the per-execution append-only map from step name
//! ABOUTME: to step result, with dotted-path extraction and prompt rendering.

use crate::error::{PipelineError, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;

/// The outcome of one executed step.
///
/// Normalizes the many provider-specific response shapes (§3 "Result") into
/// one struct: a success flag, rendered text, an optional structured
/// payload, a cost figure, and free-form metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub success: bool,
    pub text: String,
    pub content: Option<Value>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl StepResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: text.into(),
            content: None,
            cost: 0.0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn failure(text: impl Into<String>) -> Self {
        Self {
            success: false,
            text: text.into(),
            content: None,
            cost: 0.0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Render this result as the single `Value` the Result Store's
    /// `extract` traverses. Keys match the field names an author would
    /// naturally reach for in `previous_response { extract: "..." }`.
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("success".to_string(), Value::Bool(self.success));
        map.insert("text".to_string(), Value::String(self.text.clone()));
        map.insert(
            "content".to_string(),
            self.content.clone().unwrap_or(Value::Null),
        );
        map.insert("cost".to_string(), Value::Number(self.cost));
        for (k, v) in &self.metadata {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Value::Map(map)
    }
}

impl From<String> for StepResult {
    /// A bare string becomes `{success: true, text: <s>, cost: 0}` (§4.1).
    fn from(s: String) -> Self {
        StepResult::text(s)
    }
}

impl From<&str> for StepResult {
    fn from(s: &str) -> Self {
        StepResult::text(s)
    }
}

/// Options controlling `transform_for_prompt`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptFormat {
    pub force_json: bool,
}

/// What `extract` found at a dotted path — distinguishes a present-but-null
/// field from one that doesn't exist, per spec §4.1.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Found(Value),
    NotFound,
}

impl Extracted {
    pub fn into_option(self) -> Option<Value> {
        match self {
            Extracted::Found(v) => Some(v),
            Extracted::NotFound => None,
        }
    }
}

/// Aggregate counters returned by `summary()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreSummary {
    pub total_steps: usize,
    pub successful_steps: usize,
    pub failed_steps: usize,
    pub total_cost: f64,
}

/// The per-execution, append-only map from step name to `StepResult`.
///
/// Insertion order is preserved and observable (invariant #1 in spec §3):
/// `iter()` yields steps in the order they were written, which later steps
/// rely on when rendering a `session_context`-style summary of prior work.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    order: Vec<String>,
    results: HashMap<String, StepResult>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a step's result. Writing the same step name twice is an
    /// invariant violation (§3 invariant #2) and returns
    /// `PipelineError::Internal`.
    pub fn put(&mut self, step_name: impl Into<String>, result: impl Into<StepResult>) -> Result<()> {
        let step_name = step_name.into();
        if self.results.contains_key(&step_name) {
            return Err(PipelineError::internal(format!(
                "step '{step_name}' was written to the Result Store more than once"
            )));
        }
        self.order.push(step_name.clone());
        self.results.insert(step_name, result.into());
        Ok(())
    }

    /// Insert or overwrite a step's result without `put`'s double-write
    /// check. Used by `while_loop`, whose body steps run against the real
    /// outer Result Store once per iteration and must be able to reuse the
    /// same names so the next iteration's condition sees the latest value.
    pub fn upsert(&mut self, step_name: impl Into<String>, result: impl Into<StepResult>) {
        let step_name = step_name.into();
        if !self.results.contains_key(&step_name) {
            self.order.push(step_name.clone());
        }
        self.results.insert(step_name, result.into());
    }

    pub fn get(&self, step_name: &str) -> Option<&StepResult> {
        self.results.get(step_name)
    }

    pub fn contains(&self, step_name: &str) -> bool {
        self.results.contains_key(step_name)
    }

    /// Traverse `step_name.dotted.path`, where the first segment selects the
    /// step and the remainder is handed to `Value::get_path`.
    pub fn extract(&self, step_name: &str, dotted_path: &str) -> Extracted {
        let Some(result) = self.get(step_name) else {
            return Extracted::NotFound;
        };
        let value = result.to_value();
        if dotted_path.is_empty() {
            return Extracted::Found(value);
        }
        match value.get_path(dotted_path) {
            Some(v) => Extracted::Found(v.clone()),
            None => Extracted::NotFound,
        }
    }

    /// Render a step's result as a prompt fragment: prefer `text`, and
    /// pretty-print JSON when the caller asks for it or the value is
    /// non-scalar (§4.1 / §4.2).
    pub fn transform_for_prompt(&self, step_name: &str, opts: PromptFormat) -> Option<String> {
        let result = self.get(step_name)?;
        if opts.force_json {
            return Some(serde_json::to_string_pretty(&serde_json::Value::from(result.to_value())).unwrap_or_default());
        }
        if !result.text.is_empty() {
            return Some(result.text.clone());
        }
        if let Some(content) = &result.content {
            return Some(if content.is_scalar() {
                content.render()
            } else {
                serde_json::to_string_pretty(&serde_json::Value::from(content.clone())).unwrap_or_default()
            });
        }
        Some(serde_json::to_string_pretty(&serde_json::Value::from(result.to_value())).unwrap_or_default())
    }

    pub fn summary(&self) -> StoreSummary {
        let mut summary = StoreSummary::default();
        for name in &self.order {
            let Some(result) = self.results.get(name) else {
                continue;
            };
            summary.total_steps += 1;
            if result.success {
                summary.successful_steps += 1;
            } else {
                summary.failed_steps += 1;
            }
            summary.total_cost += result.cost;
        }
        summary
    }

    /// Step names in insertion order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StepResult)> {
        self.order
            .iter()
            .filter_map(move |name| self.results.get(name).map(|r| (name, r)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Serialize to JSON for checkpointing, preserving insertion order.
    pub fn to_json(&self) -> serde_json::Value {
        let steps: Vec<serde_json::Value> = self
            .order
            .iter()
            .filter_map(|name| {
                self.results.get(name).map(|r| {
                    serde_json::json!({ "name": name, "result": r })
                })
            })
            .collect();
        serde_json::json!({ "steps": steps })
    }

    /// Deserialize from the JSON produced by `to_json`, restoring insertion
    /// order exactly (§8 round-trip property).
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let mut store = ResultStore::new();
        let steps = value
            .get("steps")
            .and_then(|v| v.as_array())
            .ok_or_else(|| PipelineError::ParsingError {
                message: "checkpoint missing 'steps' array".to_string(),
            })?;
        for entry in steps {
            let name = entry
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| PipelineError::ParsingError {
                    message: "checkpoint step missing 'name'".to_string(),
                })?
                .to_string();
            let result: StepResult = serde_json::from_value(
                entry.get("result").cloned().unwrap_or(serde_json::Value::Null),
            )
            .map_err(|e| PipelineError::ParsingError {
                message: format!("invalid step result for '{name}': {e}"),
            })?;
            store.put(name, result)?;
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_twice_is_an_error() {
        let mut store = ResultStore::new();
        store.put("a", "hello").unwrap();
        let err = store.put("a", "again").unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn bare_string_normalizes_to_success_text_zero_cost() {
        let mut store = ResultStore::new();
        store.put("a", "hello").unwrap();
        let result = store.get("a").unwrap();
        assert!(result.success);
        assert_eq!(result.text, "hello");
        assert_eq!(result.cost, 0.0);
    }

    #[test]
    fn extract_distinguishes_missing_from_null() {
        let mut store = ResultStore::new();
        let result = StepResult::text("x").with_content(serde_json::json!({"field": null}).into());
        store.put("a", result).unwrap();

        assert_eq!(
            store.extract("a", "content.field"),
            Extracted::Found(Value::Null)
        );
        assert_eq!(store.extract("a", "content.missing"), Extracted::NotFound);
        assert_eq!(store.extract("missing_step", "text"), Extracted::NotFound);
    }

    #[test]
    fn insertion_order_is_observable() {
        let mut store = ResultStore::new();
        store.put("b", "2").unwrap();
        store.put("a", "1").unwrap();
        assert_eq!(store.order(), &["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn summary_counts_success_failure_and_cost() {
        let mut store = ResultStore::new();
        store.put("ok", StepResult::text("x").with_cost(1.5)).unwrap();
        store.put("bad", StepResult::failure("oops").with_cost(0.5)).unwrap();
        let summary = store.summary();
        assert_eq!(summary.total_steps, 2);
        assert_eq!(summary.successful_steps, 1);
        assert_eq!(summary.failed_steps, 1);
        assert_eq!(summary.total_cost, 2.0);
    }

    #[test]
    fn json_round_trip_preserves_order_and_values() {
        let mut store = ResultStore::new();
        store.put("first", StepResult::text("a")).unwrap();
        store.put("second", StepResult::text("b").with_cost(2.0)).unwrap();

        let json = store.to_json();
        let restored = ResultStore::from_json(&json).unwrap();
        assert_eq!(restored.order(), store.order());
        assert_eq!(restored.get("second").unwrap().cost, 2.0);
    }

    #[test]
    fn transform_for_prompt_prefers_text_then_content_then_json() {
        let mut store = ResultStore::new();
        store.put("a", StepResult::text("hi")).unwrap();
        assert_eq!(
            store.transform_for_prompt("a", PromptFormat::default()),
            Some("hi".to_string())
        );

        let mut store2 = ResultStore::new();
        let mut no_text = StepResult::text("");
        no_text.content = Some(Value::from("fallback"));
        store2.put("b", no_text).unwrap();
        assert_eq!(
            store2.transform_for_prompt("b", PromptFormat::default()),
            Some("fallback".to_string())
        );
    }
}
