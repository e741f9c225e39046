//! ABOUTME: Provider interfaces, streaming layer, session manager, and
//! ABOUTME: option builder for the pipeline orchestrator's two collaborator
//! ABOUTME: kinds: the Assistant Provider and the Structured Provider.

pub mod assistant;
pub mod options;
pub mod session;
pub mod streaming;
pub mod structured;

pub use assistant::{
    query_collected, AlwaysFailProvider, AssistantOptions, AssistantProvider, AssistantResponse,
    BackoffStrategy, FailureKind, MockAssistantProvider, OutputFormat, RetryConfig,
};
pub use options::{apply_preset_optimizations, deep_merge, merge, resolve_preset, Preset};
pub use session::{Interaction, Session, SessionManager};
pub use streaming::{
    collect_stream, run_stream, spawn_producer, BufferHandler, CallbackHandler, ConsoleHandler,
    DebugHandler, ErrorStrategy, FileHandler, MessageStream, SimpleHandler, StreamHandler,
    StreamMessage, StreamMetrics,
};
pub use structured::{
    validate_against_schema, FunctionCall, GenerationConfig, MockStructuredProvider,
    StructuredOptions, StructuredProvider, StructuredResponse, ToolDeclaration,
};
