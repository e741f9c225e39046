//! ABOUTME: Workflow execution substrate — the Template Engine, Condition
//! ABOUTME: Engine, Safety Manager, functions table, Step Dispatcher,
//! ABOUTME: control-flow helpers, and the Executor that ties them together.

pub mod condition;
pub mod control_flow;
pub mod dispatch;
pub mod executor;
pub mod functions;
pub mod prompt;
pub mod safety;
pub mod template;

pub use executor::{build_function_table, execute_workflow, resolve_inputs, Runtime};
pub use functions::resolve_functions;
pub use prompt::PromptContext;
pub use template::TemplateContext;
