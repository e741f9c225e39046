//! ABOUTME: Assistant Provider trait — the "Claude-style" agent SDK
//! ABOUTME: collaborator interface, plus the options map it recognizes.

use crate::streaming::MessageStream;
use async_trait::async_trait;
use pipeline_core::{PipelineError, Result, StepResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Backoff strategy for provider-level retry configuration carried in
/// `AssistantOptions::retry_config` (consumed by `claude_robust`, §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    Text,
    Json,
    StreamJson,
}

/// Options recognized by the Assistant Provider (§4.5). Fields not set fall
/// back to provider defaults; `step_options` + preset merging happens in
/// `crate::options` before this struct is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantOptions {
    pub model: Option<String>,
    pub fallback_model: Option<String>,
    pub max_turns: Option<u32>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub cwd: Option<String>,
    pub session_id: Option<String>,
    pub resume_session: bool,
    pub async_streaming: bool,
    pub stream_buffer_size: usize,
    pub stream_file_path: Option<String>,
    pub timeout_ms: u64,
    pub retry_config: RetryConfig,
    pub output_format: OutputFormat,
    pub verbose: bool,
    pub debug_mode: bool,
    pub permission_mode: Option<String>,
    pub telemetry_enabled: bool,
    pub cost_tracking: bool,
    pub collect_stream: bool,
    pub extra: BTreeMap<String, pipeline_core::Value>,
}

impl Default for AssistantOptions {
    fn default() -> Self {
        Self {
            model: None,
            fallback_model: None,
            max_turns: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            system_prompt: None,
            append_system_prompt: None,
            cwd: None,
            session_id: None,
            resume_session: false,
            async_streaming: false,
            stream_buffer_size: 64,
            stream_file_path: None,
            timeout_ms: 60_000,
            retry_config: RetryConfig::default(),
            output_format: OutputFormat::Text,
            verbose: false,
            debug_mode: false,
            permission_mode: None,
            telemetry_enabled: true,
            cost_tracking: true,
            collect_stream: false,
            extra: BTreeMap::new(),
        }
    }
}

/// What calling the Assistant Provider returns: either a fully-materialized
/// response or a lazy message stream the caller must consume (§4.6).
pub enum AssistantResponse {
    Sync(StepResult),
    Stream(MessageStream),
}

/// The "Claude-style" agent SDK collaborator (§4.5). Implementations talk to
/// a real provider process/API; `pipeline-providers` ships only
/// `MockAssistantProvider` for deterministic tests, since the concrete
/// transport is explicitly out of scope (spec.md §1).
#[async_trait]
pub trait AssistantProvider: Send + Sync {
    async fn query(&self, prompt: &str, options: &AssistantOptions) -> Result<AssistantResponse>;
}

/// Convenience: run a query and always collapse the result to a
/// synchronous `StepResult`, draining a stream via `collect_stream` when the
/// provider returned one. Used by step variants that don't expose streaming
/// (e.g. `claude_batch` sub-tasks).
pub async fn query_collected(
    provider: &dyn AssistantProvider,
    prompt: &str,
    options: &AssistantOptions,
) -> Result<StepResult> {
    match provider.query(prompt, options).await? {
        AssistantResponse::Sync(result) => Ok(result),
        AssistantResponse::Stream(stream) => crate::streaming::collect_stream(stream).await,
    }
}

/// Deterministic test double. Returns a scripted queue of responses in
/// order, or a canned echo when the queue is empty, grounded on the
/// `TEST_MODE=mock` path described in spec.md §6.
pub struct MockAssistantProvider {
    scripted: parking_lot::Mutex<Vec<StepResult>>,
}

impl MockAssistantProvider {
    pub fn new() -> Self {
        Self {
            scripted: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn with_responses(responses: Vec<StepResult>) -> Self {
        Self {
            scripted: parking_lot::Mutex::new(responses),
        }
    }

    pub fn push_response(&self, result: StepResult) {
        self.scripted.lock().push(result);
    }

    pub fn always_timeout() -> AlwaysFailProvider {
        AlwaysFailProvider {
            error: "provider call exceeded configured timeout".to_string(),
            kind: FailureKind::Timeout,
        }
    }
}

impl Default for MockAssistantProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssistantProvider for MockAssistantProvider {
    async fn query(&self, prompt: &str, _options: &AssistantOptions) -> Result<AssistantResponse> {
        let mut scripted = self.scripted.lock();
        if !scripted.is_empty() {
            return Ok(AssistantResponse::Sync(scripted.remove(0)));
        }
        Ok(AssistantResponse::Sync(StepResult::text(format!(
            "mock response to: {prompt}"
        ))))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FailureKind {
    Timeout,
    RateLimit,
    ApiError,
}

/// A provider double that always fails the same way — used to exercise
/// `claude_robust`'s retry/fallback machinery deterministically.
pub struct AlwaysFailProvider {
    pub error: String,
    pub kind: FailureKind,
}

#[async_trait]
impl AssistantProvider for AlwaysFailProvider {
    async fn query(&self, _prompt: &str, _options: &AssistantOptions) -> Result<AssistantResponse> {
        Err(match self.kind {
            FailureKind::Timeout => PipelineError::Timeout {
                message: self.error.clone(),
                duration_ms: None,
            },
            FailureKind::RateLimit => PipelineError::RateLimit {
                message: self.error.clone(),
            },
            FailureKind::ApiError => PipelineError::ApiError {
                message: self.error.clone(),
                status: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_provider_echoes_prompt_when_unscripted() {
        let provider = MockAssistantProvider::new();
        let response = provider
            .query("hello", &AssistantOptions::default())
            .await
            .unwrap();
        match response {
            AssistantResponse::Sync(result) => assert!(result.text.contains("hello")),
            AssistantResponse::Stream(_) => panic!("expected sync response"),
        }
    }

    #[tokio::test]
    async fn mock_provider_drains_scripted_queue_in_order() {
        let provider = MockAssistantProvider::with_responses(vec![
            StepResult::text("first"),
            StepResult::text("second"),
        ]);
        let opts = AssistantOptions::default();
        let AssistantResponse::Sync(r1) = provider.query("x", &opts).await.unwrap() else {
            panic!()
        };
        let AssistantResponse::Sync(r2) = provider.query("x", &opts).await.unwrap() else {
            panic!()
        };
        assert_eq!(r1.text, "first");
        assert_eq!(r2.text, "second");
    }

    #[tokio::test]
    async fn always_fail_provider_returns_configured_kind() {
        let provider = MockAssistantProvider::always_timeout();
        let err = provider
            .query("x", &AssistantOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }
}
