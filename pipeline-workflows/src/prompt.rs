//! ABOUTME: Prompt Builder — concatenates a step's ordered `PromptPart` list
//! ABOUTME: into the final prompt text sent to a provider (§4.2).

use crate::template::{self, TemplateContext};
use pipeline_config::schema::PromptPart;
use pipeline_core::{PipelineError, Result};
use pipeline_providers::SessionManager;

/// Everything the Prompt Builder needs beyond plain template rendering: the
/// active `TemplateContext` plus the session registry `session_context`
/// parts read from.
pub struct PromptContext<'a> {
    pub template: TemplateContext<'a>,
    pub sessions: Option<&'a SessionManager>,
}

impl PromptContext<'_> {
    /// Render each part in order and concatenate them directly — no
    /// separator is inserted between parts, so a `static` part immediately
    /// followed by a `previous_response` part reads as one continuous string.
    pub fn build(&self, parts: &[PromptPart]) -> Result<String> {
        let mut out = String::new();
        for part in parts {
            out.push_str(&self.render_part(part)?);
        }
        Ok(out)
    }

    fn render_part(&self, part: &PromptPart) -> Result<String> {
        match part {
            PromptPart::Static { text } => Ok(template::render(text, &self.template)),
            PromptPart::File { path } => {
                let resolved = self.resolve_workspace_path(path);
                std::fs::read_to_string(&resolved).map_err(|err| PipelineError::File {
                    message: err.to_string(),
                    path: Some(resolved.to_string_lossy().to_string()),
                })
            }
            PromptPart::PreviousResponse { step, field } => {
                let field = field.as_deref().unwrap_or("text");
                self.template
                    .results
                    .extract(step, field)
                    .into_option()
                    .map(|v| v.render())
                    .ok_or_else(|| {
                        PipelineError::template(format!(
                            "previous_response part references unresolved step '{step}'"
                        ))
                    })
            }
            PromptPart::SessionContext { session_id } => {
                let sessions = self.sessions.ok_or_else(|| {
                    PipelineError::internal("session_context part used without a SessionManager")
                })?;
                let session_id = session_id.as_deref().ok_or_else(|| {
                    PipelineError::validation("session_context part requires a session_id")
                })?;
                let session = sessions.resume(session_id).ok_or_else(|| {
                    PipelineError::validation(format!("no such session '{session_id}'"))
                })?;
                Ok(session
                    .interactions
                    .iter()
                    .map(|turn| format!("> {}\n{}", turn.prompt, turn.response_text))
                    .collect::<Vec<_>>()
                    .join("\n\n"))
            }
        }
    }

    fn resolve_workspace_path(&self, path: &str) -> std::path::PathBuf {
        let candidate = std::path::Path::new(path);
        match self.template.workspace_dir {
            Some(dir) if candidate.is_relative() => std::path::Path::new(dir).join(candidate),
            _ => candidate.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::{ResultStore, StepResult, VariableState, Value};
    use std::collections::BTreeMap;

    fn ctx<'a>(
        results: &'a ResultStore,
        inputs: &'a BTreeMap<String, Value>,
        vars: &'a VariableState,
    ) -> TemplateContext<'a> {
        TemplateContext {
            results,
            inputs,
            vars,
            loop_item: None,
            workspace_dir: None,
        }
    }

    #[test]
    fn static_part_followed_by_previous_response_concatenates_with_no_separator() {
        let mut results = ResultStore::new();
        results.put("a", StepResult::text("A's text")).unwrap();
        let inputs = BTreeMap::new();
        let vars = VariableState::new();
        let pc = PromptContext {
            template: ctx(&results, &inputs, &vars),
            sessions: None,
        };
        let parts = vec![
            PromptPart::Static {
                text: "previous_response A ".to_string(),
            },
            PromptPart::PreviousResponse {
                step: "a".to_string(),
                field: None,
            },
        ];
        assert_eq!(pc.build(&parts).unwrap(), "previous_response A A's text");
    }

    #[test]
    fn previous_response_field_defaults_to_text() {
        let mut results = ResultStore::new();
        results.put("a", StepResult::text("hi").with_cost(2.0)).unwrap();
        let inputs = BTreeMap::new();
        let vars = VariableState::new();
        let pc = PromptContext {
            template: ctx(&results, &inputs, &vars),
            sessions: None,
        };
        let parts = vec![PromptPart::PreviousResponse {
            step: "a".to_string(),
            field: Some("cost".to_string()),
        }];
        assert_eq!(pc.build(&parts).unwrap(), "2");
    }

    #[test]
    fn previous_response_to_unknown_step_is_a_template_error() {
        let results = ResultStore::new();
        let inputs = BTreeMap::new();
        let vars = VariableState::new();
        let pc = PromptContext {
            template: ctx(&results, &inputs, &vars),
            sessions: None,
        };
        let parts = vec![PromptPart::PreviousResponse {
            step: "missing".to_string(),
            field: None,
        }];
        let err = pc.build(&parts).unwrap_err();
        assert_eq!(err.kind(), "template");
    }

    #[test]
    fn session_context_part_renders_prior_interactions() {
        let results = ResultStore::new();
        let inputs = BTreeMap::new();
        let vars = VariableState::new();
        let sessions = SessionManager::new();
        let id = sessions.get_or_create(Some("s"), false, false);
        sessions
            .append(
                &id,
                pipeline_providers::Interaction {
                    prompt: "hi".to_string(),
                    response_text: "hello".to_string(),
                    timestamp: chrono::Utc::now(),
                },
            )
            .unwrap();
        let pc = PromptContext {
            template: ctx(&results, &inputs, &vars),
            sessions: Some(&sessions),
        };
        let parts = vec![PromptPart::SessionContext {
            session_id: Some("s".to_string()),
        }];
        assert_eq!(pc.build(&parts).unwrap(), "> hi\nhello");
    }
}
