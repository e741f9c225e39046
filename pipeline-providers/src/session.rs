//! ABOUTME: Session Manager — stable, append-only conversational sessions
//! ABOUTME: for `claude_session` steps, with periodic checkpointing (§4.7).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pipeline_core::{PipelineError, Result, Value};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One turn recorded against a session: the prompt sent and the response
/// text/content received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub prompt: String,
    pub response_text: String,
    pub timestamp: DateTime<Utc>,
}

/// A single conversational session: a stable public id plus an append-only
/// interaction log and the last checkpoint payload, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub interactions: Vec<Interaction>,
    pub last_checkpoint: Option<Value>,
    pub persist: bool,
    pub continue_on_restart: bool,
}

impl Session {
    fn new(id: String, persist: bool, continue_on_restart: bool) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            interactions: Vec::new(),
            last_checkpoint: None,
            persist,
            continue_on_restart,
        }
    }
}

/// In-memory session registry. Looked up by the caller-supplied
/// `session_id` (or a freshly minted one); `checkpoint_frequency` decides
/// how often the owning step snapshots session state into
/// `last_checkpoint` (spec's checkpointing cadence, §4.7). Backed by a
/// `DashMap` so concurrent `claude_batch`/`parallel_claude` tasks sharing
/// one workflow run can touch distinct sessions without a single
/// workflow-wide lock serializing them.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<String, Session>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Returns the session for `session_id` if it exists, otherwise creates
    /// one (minting a fresh id when `session_id` is `None`). Returns the
    /// session's stable public id.
    pub fn get_or_create(
        &self,
        session_id: Option<&str>,
        persist: bool,
        continue_on_restart: bool,
    ) -> String {
        if let Some(id) = session_id {
            if self.sessions.contains_key(id) {
                return id.to_string();
            }
            self.sessions.insert(
                id.to_string(),
                Session::new(id.to_string(), persist, continue_on_restart),
            );
            return id.to_string();
        }
        let id = Uuid::new_v4().to_string();
        self.sessions.insert(
            id.clone(),
            Session::new(id.clone(), persist, continue_on_restart),
        );
        id
    }

    pub fn append(&self, session_id: &str, interaction: Interaction) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| PipelineError::Provider {
                message: format!("no such session '{session_id}'"),
                provider: None,
            })?;
        session.interactions.push(interaction);
        Ok(())
    }

    pub fn checkpoint(&self, session_id: &str, data: Value) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| PipelineError::Provider {
                message: format!("no such session '{session_id}'"),
                provider: None,
            })?;
        session.last_checkpoint = Some(data);
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn resume(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    /// Whether the step-local interaction count since the last checkpoint
    /// has reached `checkpoint_frequency`.
    pub fn should_checkpoint(&self, session_id: &str, checkpoint_frequency: u32) -> bool {
        if checkpoint_frequency == 0 {
            return false;
        }
        match self.sessions.get(session_id) {
            Some(session) => {
                session.interactions.len() as u32 % checkpoint_frequency == 0
                    && !session.interactions.is_empty()
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn get_or_create_reuses_existing_session_id() {
        let manager = SessionManager::new();
        let first = manager.get_or_create(Some("sess-1"), true, true);
        let second = manager.get_or_create(Some("sess-1"), true, true);
        assert_eq!(first, second);
        assert_eq!(manager.list().len(), 1);
    }

    #[test]
    #[serial]
    fn get_or_create_mints_fresh_id_when_none_given() {
        let manager = SessionManager::new();
        let a = manager.get_or_create(None, false, false);
        let b = manager.get_or_create(None, false, false);
        assert_ne!(a, b);
    }

    #[test]
    fn append_is_observable_via_resume() {
        let manager = SessionManager::new();
        let id = manager.get_or_create(Some("s"), true, false);
        manager
            .append(
                &id,
                Interaction {
                    prompt: "hi".to_string(),
                    response_text: "hello".to_string(),
                    timestamp: Utc::now(),
                },
            )
            .unwrap();
        let session = manager.resume(&id).unwrap();
        assert_eq!(session.interactions.len(), 1);
    }

    #[test]
    fn append_to_unknown_session_is_an_error() {
        let manager = SessionManager::new();
        let err = manager
            .append(
                "missing",
                Interaction {
                    prompt: "x".to_string(),
                    response_text: "y".to_string(),
                    timestamp: Utc::now(),
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), "provider");
    }

    #[test]
    fn checkpoint_frequency_gates_on_multiples() {
        let manager = SessionManager::new();
        let id = manager.get_or_create(Some("s"), true, false);
        for _ in 0..3 {
            manager
                .append(
                    &id,
                    Interaction {
                        prompt: "p".to_string(),
                        response_text: "r".to_string(),
                        timestamp: Utc::now(),
                    },
                )
                .unwrap();
        }
        assert!(manager.should_checkpoint(&id, 3));
        assert!(!manager.should_checkpoint(&id, 5));
    }
}
