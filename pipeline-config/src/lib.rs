//! ABOUTME: Workflow document schema, defaults merging, structural
//! ABOUTME: validation, and environment variable overrides for the
//! ABOUTME: pipeline orchestrator's YAML workflow documents.

pub mod env;
pub mod merge;
pub mod schema;
pub mod validation;

pub use env::{EnvOverrides, EnvVarDef, ENV_VARS};
pub use merge::{merge_step_defaults, EffectiveStepConfig};
pub use schema::{
    AggregateFunction, BatchTask, ClaudeBatchStep, ClaudeExtractStep, ClaudeRobustStep,
    ClaudeSessionStep, ClaudeSmartStep, ClaudeStep, CodebaseQueryStep, DataTransformStep,
    Defaults, EnvironmentConfig, ExtractOutputFormat, FallbackAction, FileFormat, FileOpsStep,
    ForLoopStep, GeminiInstructorStep, GeminiStep, InlinePipeline, InputDecl, NestedPipelineStep,
    ParallelClaudeStep, PostProcessStep, PromptPart, SetVariableStep, Step, StepKind,
    TestEchoStep, WhileLoopStep, Workflow,
};
pub use validation::validate_workflow;

use pipeline_core::PipelineError;
use std::path::Path;

/// Parse and validate a workflow document from a YAML string.
pub fn parse_workflow(yaml: &str) -> Result<Workflow, PipelineError> {
    let workflow: Workflow =
        serde_yaml::from_str(yaml).map_err(|err| PipelineError::Validation {
            message: format!("invalid workflow document: {err}"),
            field: None,
        })?;
    validate_workflow(&workflow)?;
    Ok(workflow)
}

/// Load, parse, and validate a workflow document from a file on disk.
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow, PipelineError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|err| PipelineError::File {
        message: err.to_string(),
        path: Some(path.display().to_string()),
    })?;
    parse_workflow(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_workflow_reads_parses_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "name: w\nsteps:\n  - name: a\n    type: test_echo\n    message: hi\n"
        )
        .unwrap();
        let workflow = load_workflow(file.path()).unwrap();
        assert_eq!(workflow.name, "w");
    }

    #[test]
    fn load_workflow_surfaces_missing_file_as_file_error() {
        let err = load_workflow("/no/such/path.yaml").unwrap_err();
        assert!(matches!(err, PipelineError::File { .. }));
    }

    #[test]
    fn parse_workflow_surfaces_validation_failures() {
        let yaml = "name: w\nsteps:\n  - name: a\n    type: test_echo\n    message: x\n  - name: a\n    type: test_echo\n    message: y\n";
        let err = parse_workflow(yaml).unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
    }
}
