//! ABOUTME: Error types and handling for the pipeline orchestrator
//! ABOUTME: Provides PipelineError enum and the crate-wide Result type alias

use thiserror::Error;

/// Comprehensive error enum for all pipeline orchestration operations.
///
/// Variants correspond one-to-one with the closed set of error kinds the
/// orchestrator recognizes. `kind()` returns the stable lowercase name used
/// both in user-visible failure messages and as the substring matched by a
/// `claude_robust` step's `retry_conditions` list.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("template error: {message}")]
    Template {
        message: String,
        reference: Option<String>,
    },

    #[error("provider error: {message}")]
    Provider {
        message: String,
        provider: Option<String>,
    },

    #[error("timeout: {message}")]
    Timeout {
        message: String,
        duration_ms: Option<u64>,
    },

    #[error("stream interrupted: {message}")]
    StreamInterrupted { message: String },

    #[error("rate limit: {message}")]
    RateLimit { message: String },

    #[error("api error: {message}")]
    ApiError {
        message: String,
        status: Option<u16>,
    },

    #[error("parsing error: {message}")]
    ParsingError { message: String },

    #[error("file error: {message}")]
    File {
        message: String,
        path: Option<String>,
    },

    #[error("schema error: {message}")]
    Schema { message: String },

    #[error("recursion error: {message}")]
    Recursion {
        message: String,
        ancestor_chain: Vec<String>,
    },

    #[error("resource error: {message}")]
    Resource { message: String },

    #[error("condition error: {message}")]
    Condition {
        message: String,
        expression: Option<String>,
    },

    #[error("unknown step type: {type_name}")]
    UnknownStepType { type_name: String },

    /// Internal invariant violation (e.g. a double-write to the Result
    /// Store). Never expected to surface from a well-formed workflow.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl PipelineError {
    /// The stable kind name used in `step '<name>' failed: <kind>: <detail>`
    /// messages and matched (by substring) against `retry_conditions`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Template { .. } => "template",
            Self::Provider { .. } => "provider",
            Self::Timeout { .. } => "timeout",
            Self::StreamInterrupted { .. } => "stream_interrupted",
            Self::RateLimit { .. } => "rate_limit",
            Self::ApiError { .. } => "api_error",
            Self::ParsingError { .. } => "parsing_error",
            Self::File { .. } => "file",
            Self::Schema { .. } => "schema",
            Self::Recursion { .. } => "recursion",
            Self::Resource { .. } => "resource",
            Self::Condition { .. } => "condition",
            Self::UnknownStepType { .. } => "unknown_step_type",
            Self::Internal { .. } => "internal",
        }
    }

    /// Render the user-visible failure string described in spec §7:
    /// `step '<name>' failed: <kind>: <detail>`.
    pub fn as_step_failure(&self, step_name: &str) -> String {
        format!("step '{}' failed: {}: {}", step_name, self.kind(), self)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn template(message: impl Into<String>) -> Self {
        Self::Template {
            message: message.into(),
            reference: None,
        }
    }

    pub fn condition(message: impl Into<String>) -> Self {
        Self::Condition {
            message: message.into(),
            expression: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_retry_condition_substrings() {
        let err = PipelineError::Timeout {
            message: "provider call exceeded 1000ms".to_string(),
            duration_ms: Some(1000),
        };
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn step_failure_message_has_expected_shape() {
        let err = PipelineError::validation("missing field 'name'");
        let msg = err.as_step_failure("fetch_data");
        assert_eq!(
            msg,
            "step 'fetch_data' failed: validation: validation error: missing field 'name'"
        );
    }

    #[test]
    fn recursion_error_carries_ancestor_chain() {
        let err = PipelineError::Recursion {
            message: "depth exceeded".to_string(),
            ancestor_chain: vec!["root".into(), "child".into()],
        };
        match &err {
            PipelineError::Recursion { ancestor_chain, .. } => {
                assert_eq!(ancestor_chain.len(), 2);
            }
            _ => panic!("wrong variant"),
        }
    }
}
