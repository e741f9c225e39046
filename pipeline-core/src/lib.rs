//! ABOUTME: Core substrate for the pipeline orchestrator
//! ABOUTME: Value model, error types, Result Store, and Safety Context

pub mod error;
pub mod execution_context;
pub mod result_store;
pub mod value;

pub use error::{PipelineError, Result};
pub use execution_context::{
    PipelineId, SafetyContext, SafetyLimits, VariableScope, VariableState,
};
pub use result_store::{Extracted, PromptFormat, ResultStore, StepResult, StoreSummary};
pub use value::Value;
