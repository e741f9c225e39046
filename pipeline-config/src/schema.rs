//! ABOUTME: Workflow document schema — the YAML shape of a workflow, its
//! ABOUTME: defaults, declared inputs, function table, and the closed set
//! ABOUTME: of step types a workflow can be built from.

use pipeline_core::Value;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// A single workflow document, the unit `pipeline-cli run` loads and the
/// Executor drives.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub checkpoint_enabled: bool,
    #[serde(default)]
    pub checkpoint_dir: Option<String>,
    #[serde(default)]
    pub inputs: Vec<InputDecl>,
    /// Gemini structured-provider function-calling tool declarations,
    /// keyed by name and referenced from `gemini`/`gemini_instructor`
    /// steps' `functions` list (§4.5).
    #[serde(default)]
    pub functions: BTreeMap<String, Value>,
    pub steps: Vec<Step>,
}

/// Workflow-wide defaults, deep-merged under any step-level `options`
/// override before dispatch (see `pipeline_config::merge`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default)]
    pub claude_preset: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub options: Option<Value>,
}

/// Declares which named preset family applies when a step asks for
/// environment-aware preset resolution (Option Builder precedence level 3).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub mode: Option<String>,
}

/// A declared workflow input. `required` inputs with no `default` must be
/// supplied by the caller (CLI flag, nested-pipeline caller, or API caller).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputDecl {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

/// A step in workflow order. `name` must be unique within the workflow;
/// `condition` is a Condition Engine expression gating execution; `kind`
/// carries the step-type-specific fields via internally-tagged `type`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub output_to_file: Option<String>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// The closed set of step types a workflow document can use.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Claude(ClaudeStep),
    ClaudeSmart(ClaudeSmartStep),
    ClaudeSession(ClaudeSessionStep),
    ClaudeExtract(ClaudeExtractStep),
    ClaudeBatch(ClaudeBatchStep),
    ClaudeRobust(ClaudeRobustStep),
    ParallelClaude(ParallelClaudeStep),
    Gemini(GeminiStep),
    GeminiInstructor(GeminiInstructorStep),
    SetVariable(SetVariableStep),
    DataTransform(DataTransformStep),
    FileOps(FileOpsStep),
    CodebaseQuery(CodebaseQueryStep),
    ForLoop(ForLoopStep),
    WhileLoop(WhileLoopStep),
    NestedPipeline(NestedPipelineStep),
    TestEcho(TestEchoStep),
}

impl StepKind {
    /// `type` discriminant as it appears in the document, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Claude(_) => "claude",
            StepKind::ClaudeSmart(_) => "claude_smart",
            StepKind::ClaudeSession(_) => "claude_session",
            StepKind::ClaudeExtract(_) => "claude_extract",
            StepKind::ClaudeBatch(_) => "claude_batch",
            StepKind::ClaudeRobust(_) => "claude_robust",
            StepKind::ParallelClaude(_) => "parallel_claude",
            StepKind::Gemini(_) => "gemini",
            StepKind::GeminiInstructor(_) => "gemini_instructor",
            StepKind::SetVariable(_) => "set_variable",
            StepKind::DataTransform(_) => "data_transform",
            StepKind::FileOps(_) => "file_ops",
            StepKind::CodebaseQuery(_) => "codebase_query",
            StepKind::ForLoop(_) => "for_loop",
            StepKind::WhileLoop(_) => "while_loop",
            StepKind::NestedPipeline(_) => "nested_pipeline",
            StepKind::TestEcho(_) => "test_echo",
        }
    }
}

/// One element of a prompt's ordered part list (§4.2 Prompt Builder). A
/// step's full prompt is the concatenation of its parts, in order.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptPart {
    /// Literal text, itself template-rendered against the Result Store.
    Static { text: String },
    /// The contents of a file, resolved relative to the workspace directory.
    File { path: String },
    /// A prior step's response text (or a dotted field of it).
    PreviousResponse {
        step: String,
        #[serde(default)]
        field: Option<String>,
    },
    /// A rendered summary of everything run so far in this session.
    SessionContext {
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// Accepts either a bare string (normalized to one `Static` part, for
/// authors who don't need multi-part prompts) or an explicit part list.
pub fn deserialize_prompt<'de, D>(deserializer: D) -> Result<Vec<PromptPart>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PromptInput {
        Plain(String),
        Parts(Vec<PromptPart>),
    }
    match PromptInput::deserialize(deserializer)? {
        PromptInput::Plain(text) => Ok(vec![PromptPart::Static { text }]),
        PromptInput::Parts(parts) => Ok(parts),
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeStep {
    #[serde(deserialize_with = "deserialize_prompt")]
    pub prompt: Vec<PromptPart>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub options: Option<Value>,
}

/// `claude_smart` adds router-selected model/preset behavior on top of
/// plain `claude`: a `routing_prompt` classifies the task before the main
/// prompt runs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeSmartStep {
    #[serde(deserialize_with = "deserialize_prompt")]
    pub prompt: Vec<PromptPart>,
    #[serde(default)]
    pub routing_prompt: Option<String>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeSessionStep {
    #[serde(deserialize_with = "deserialize_prompt")]
    pub prompt: Vec<PromptPart>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub persist: bool,
    #[serde(default)]
    pub continue_on_restart: bool,
    #[serde(default)]
    pub checkpoint_frequency: Option<u32>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub options: Option<Value>,
}

/// A single ordered post-processing step applied to `claude_extract`'s
/// response text, in the order declared (§4.10).
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PostProcessStep {
    ExtractCodeBlocks,
    ExtractRecommendations,
    ExtractLinks,
    ExtractKeyPoints,
    FormatMarkdown,
    GenerateSummary,
}

/// Shape of `claude_extract`'s final rendered output.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractOutputFormat {
    #[default]
    Text,
    Json,
    Structured,
    Summary,
    Markdown,
}

/// `claude_extract` runs the prompt, then applies an ordered post-processing
/// pipeline to the response text before rendering it in `output_format`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeExtractStep {
    #[serde(deserialize_with = "deserialize_prompt")]
    pub prompt: Vec<PromptPart>,
    #[serde(default)]
    pub post_process: Vec<PostProcessStep>,
    #[serde(default)]
    pub output_format: ExtractOutputFormat,
    #[serde(default)]
    pub max_summary_length: Option<usize>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchTask {
    pub name: String,
    #[serde(deserialize_with = "deserialize_prompt")]
    pub prompt: Vec<PromptPart>,
}

/// `claude_batch` fans a list of named tasks out, consolidating their
/// results in declared order regardless of completion order.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeBatchStep {
    pub tasks: Vec<BatchTask>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub options: Option<Value>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

/// What to do with a `claude_robust` step once retries are exhausted.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FallbackAction {
    DefaultValue { value: Value },
    FallbackModel { model: String },
    Skip,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeRobustStep {
    #[serde(deserialize_with = "deserialize_prompt")]
    pub prompt: Vec<PromptPart>,
    #[serde(default)]
    pub retry_config: Option<Value>,
    /// Error kinds (matched against `PipelineError::kind()`) worth retrying;
    /// empty means retry on any error.
    #[serde(default)]
    pub retry_conditions: Vec<String>,
    #[serde(default)]
    pub fallback_action: Option<FallbackAction>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub options: Option<Value>,
}

/// `parallel_claude` runs a fixed set of named prompts concurrently with
/// no ordering guarantee on the consolidated text (unlike `claude_batch`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParallelClaudeStep {
    pub tasks: Vec<BatchTask>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub options: Option<Value>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeminiStep {
    #[serde(deserialize_with = "deserialize_prompt")]
    pub prompt: Vec<PromptPart>,
    /// Names drawn from the workflow's `functions` tool-declaration table.
    #[serde(default)]
    pub functions: Option<Vec<String>>,
    #[serde(default)]
    pub options: Option<Value>,
}

/// `gemini_instructor` adds `response_schema`-constrained structured output
/// to the base `gemini` step.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeminiInstructorStep {
    #[serde(deserialize_with = "deserialize_prompt")]
    pub prompt: Vec<PromptPart>,
    pub response_schema: Value,
    #[serde(default)]
    pub functions: Option<Vec<String>>,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SetVariableStep {
    pub variable: String,
    pub value: Value,
}

/// An aggregation function `data_transform`'s `aggregate` operation supports.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

/// `data_transform`'s closed relational operation set (§4.10). Every
/// variant names a template-resolved input expression (or two, for `join`)
/// drawn from the Result Store.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum DataTransformStep {
    Filter {
        input: String,
        condition: String,
    },
    Map {
        input: String,
        field: String,
    },
    Aggregate {
        input: String,
        function: AggregateFunction,
        #[serde(default)]
        field: Option<String>,
    },
    Join {
        left: String,
        right: String,
        on: String,
    },
    GroupBy {
        input: String,
        key: String,
    },
    Sort {
        input: String,
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        descending: bool,
    },
}

/// Serialization target for `file_ops`'s `convert` operation.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Json,
    Yaml,
}

/// `file_ops`'s closed file-operation set (§4.10).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum FileOpsStep {
    Copy {
        path: String,
        destination: String,
    },
    Move {
        path: String,
        destination: String,
    },
    Delete {
        path: String,
    },
    Validate {
        path: String,
        #[serde(default)]
        schema: Option<Value>,
    },
    List {
        path: String,
        #[serde(default)]
        pattern: Option<String>,
    },
    Convert {
        path: String,
        destination: String,
        format: FileFormat,
    },
    StreamCopy {
        path: String,
        destination: String,
    },
    StreamProcess {
        path: String,
        destination: String,
        function: String,
    },
}

/// `codebase_query`'s closed named-query set (§4.10), each searching a set
/// of `paths` (workspace-relative, default the whole workspace).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum CodebaseQueryStep {
    FindFiles {
        #[serde(default)]
        paths: Vec<String>,
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        max_results: Option<usize>,
    },
    FindDependencies {
        #[serde(default)]
        paths: Vec<String>,
        target: String,
        #[serde(default)]
        max_results: Option<usize>,
    },
    FindFunctions {
        #[serde(default)]
        paths: Vec<String>,
        name: String,
        #[serde(default)]
        max_results: Option<usize>,
    },
    FindRelated {
        #[serde(default)]
        paths: Vec<String>,
        to: String,
        #[serde(default)]
        max_results: Option<usize>,
    },
    AnalyzeImpact {
        #[serde(default)]
        paths: Vec<String>,
        target: String,
        #[serde(default)]
        max_results: Option<usize>,
    },
}

/// `for_loop` binds `loop.<iterator>` (default name `item`, plus `index`,
/// `iteration`, `total`, `first`, `last`) for each element of `over` while
/// running `body` in order.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForLoopStep {
    pub over: String,
    pub body: Vec<Step>,
    #[serde(default)]
    pub iterator: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WhileLoopStep {
    pub condition: String,
    pub body: Vec<Step>,
    pub max_iterations: usize,
}

/// An inline child workflow, as an alternative to `pipeline_file`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InlinePipeline {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<Step>,
}

/// `nested_pipeline` runs another workflow — loaded from `pipeline_file` or
/// given inline as `pipeline` (mutually exclusive) — as a single step,
/// passing a subset of its declared inputs and folding the child results
/// named in `outputs` back into the parent Result Store under the same
/// names.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NestedPipelineStep {
    #[serde(default)]
    pub pipeline_file: Option<String>,
    #[serde(default)]
    pub pipeline: Option<InlinePipeline>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// `test_echo` exists for exercising the Executor/dispatcher wiring
/// without a live provider: it immediately resolves to its `message`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestEchoStep {
    pub message: String,
}
