//! ABOUTME: Structured Provider trait — the "Gemini-style" function-calling
//! ABOUTME: collaborator interface used by `gemini`/`gemini_instructor` steps.

use async_trait::async_trait;
use pipeline_core::{PipelineError, Result, StepResult, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenerationConfig {
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u32>,
}

/// A callable function the provider may invoke mid-generation, declared the
/// way function-calling APIs expect: name, description, JSON-schema params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Options recognized by the Structured Provider (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StructuredOptions {
    pub model: Option<String>,
    pub tools: Vec<ToolDeclaration>,
    pub generation_config: GenerationConfig,
    pub response_schema: Option<Value>,
    pub extra: BTreeMap<String, Value>,
}

/// One function call the provider chose to make in response to a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
}

/// The structured provider's response: the textual/JSON content plus any
/// function calls it made. `gemini_instructor` merges `function_calls` into
/// the top-level response under the `function_calls` key (§4.10).
#[derive(Debug, Clone)]
pub struct StructuredResponse {
    pub content: Value,
    pub function_calls: Vec<FunctionCall>,
    pub cost: f64,
}

impl StructuredResponse {
    pub fn into_step_result(self) -> StepResult {
        let text = self.content.render();
        let mut result = StepResult::text(text)
            .with_content(self.content)
            .with_cost(self.cost);
        if !self.function_calls.is_empty() {
            let calls = Value::List(
                self.function_calls
                    .into_iter()
                    .map(|call| {
                        let mut map = std::collections::BTreeMap::new();
                        map.insert("name".to_string(), Value::String(call.name));
                        map.insert("arguments".to_string(), call.arguments);
                        Value::Map(map)
                    })
                    .collect(),
            );
            result = result.with_metadata("function_calls", calls);
        }
        result
    }
}

/// The "Gemini-style" structured-output collaborator (§4.5). Validates its
/// response against `response_schema` when one is supplied; a schema
/// mismatch surfaces as `PipelineError::Schema`.
#[async_trait]
pub trait StructuredProvider: Send + Sync {
    async fn query(&self, prompt: &str, options: &StructuredOptions)
        -> Result<StructuredResponse>;
}

/// Validate `content` against `schema` using JSON Schema semantics.
pub fn validate_against_schema(content: &Value, schema: &Value) -> Result<()> {
    let schema_json = serde_json::Value::from(schema.clone());
    let content_json = serde_json::Value::from(content.clone());
    let compiled = jsonschema::validator_for(&schema_json).map_err(|e| PipelineError::Schema {
        message: format!("invalid response_schema: {e}"),
    })?;
    if let Err(errors) = compiled.validate(&content_json) {
        return Err(PipelineError::Schema {
            message: errors.to_string(),
        });
    }
    Ok(())
}

/// Deterministic test double for `StructuredProvider`, scripted the same
/// way as `MockAssistantProvider`.
pub struct MockStructuredProvider {
    scripted: parking_lot::Mutex<Vec<StructuredResponse>>,
}

impl MockStructuredProvider {
    pub fn new() -> Self {
        Self {
            scripted: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn with_responses(responses: Vec<StructuredResponse>) -> Self {
        Self {
            scripted: parking_lot::Mutex::new(responses),
        }
    }
}

impl Default for MockStructuredProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StructuredProvider for MockStructuredProvider {
    async fn query(
        &self,
        prompt: &str,
        _options: &StructuredOptions,
    ) -> Result<StructuredResponse> {
        let mut scripted = self.scripted.lock();
        if !scripted.is_empty() {
            return Ok(scripted.remove(0));
        }
        Ok(StructuredResponse {
            content: Value::String(format!("mock structured response to: {prompt}")),
            function_calls: Vec::new(),
            cost: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_validation_accepts_matching_content() {
        let schema = Value::from(serde_json::json!({
            "type": "object",
            "required": ["name"],
            "properties": {"name": {"type": "string"}}
        }));
        let mut map = std::collections::BTreeMap::new();
        map.insert("name".to_string(), Value::String("ok".to_string()));
        let content = Value::Map(map);
        assert!(validate_against_schema(&content, &schema).is_ok());
    }

    #[test]
    fn schema_validation_rejects_missing_required_field() {
        let schema = Value::from(serde_json::json!({
            "type": "object",
            "required": ["name"],
            "properties": {"name": {"type": "string"}}
        }));
        let content = Value::Map(std::collections::BTreeMap::new());
        let err = validate_against_schema(&content, &schema).unwrap_err();
        assert_eq!(err.kind(), "schema");
    }

    #[tokio::test]
    async fn structured_response_merges_function_calls_into_metadata() {
        let response = StructuredResponse {
            content: Value::String("done".to_string()),
            function_calls: vec![FunctionCall {
                name: "lookup".to_string(),
                arguments: Value::Null,
            }],
            cost: 0.001,
        };
        let result = response.into_step_result();
        assert!(result.metadata.contains_key("function_calls"));
    }

    #[tokio::test]
    async fn mock_structured_provider_echoes_when_unscripted() {
        let provider = MockStructuredProvider::new();
        let response = provider
            .query("ping", &StructuredOptions::default())
            .await
            .unwrap();
        assert!(matches!(response.content, Value::String(s) if s.contains("ping")));
    }
}
