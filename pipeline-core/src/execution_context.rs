//! ABOUTME: Safety Context (recursion/resource bookkeeping for nested
//! ABOUTME: pipelines) and the scoped variable state carried through a run.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Unique identifier for one in-flight pipeline invocation (top-level or
/// nested). Distinct from a step name: a `nested_pipeline` step gets one
/// `PipelineId` per invocation even if the same step runs in a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineId(Uuid);

/// Fixed namespace used to derive stable ids from a nested pipeline's path,
/// so the same workflow file always maps to the same `PipelineId` and a
/// cycle back to an ancestor can actually be detected.
const PIPELINE_PATH_NAMESPACE: Uuid = Uuid::from_bytes([
    0x8f, 0x3a, 0x2c, 0x41, 0x9b, 0x5e, 0x4d, 0x6a, 0xb1, 0x7c, 0x0e, 0x2d, 0x5f, 0x91, 0xa4, 0x33,
]);

impl PipelineId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id for a pipeline identified by its resolved file path,
    /// used by `nested_pipeline` so re-entering the same workflow file
    /// anywhere on the ancestor chain is recognized as a cycle.
    pub fn from_path(path: &str) -> Self {
        Self(Uuid::new_v5(&PIPELINE_PATH_NAMESPACE, path.as_bytes()))
    }
}

impl Default for PipelineId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configurable limits enforced by the Safety Manager (§4.9).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SafetyLimits {
    pub max_depth: u32,
    pub max_total_steps: u32,
    pub memory_limit_mb: u64,
    pub timeout_seconds: u64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_total_steps: 1000,
            memory_limit_mb: 1024,
            timeout_seconds: 300,
        }
    }
}

/// An immutable record tracking depth, step counts, wall-clock, and the
/// ancestor chain for one in-flight pipeline (§3, §4.9, Glossary).
///
/// Never mutated in place: a nested pipeline's context is a brand-new
/// `SafetyContext` holding an `Arc` pointer to its parent, so descending
/// into a nested pipeline strictly increases `depth` and ancestor chains
/// are cheap to share (invariant #3).
#[derive(Debug, Clone)]
pub struct SafetyContext {
    pub depth: u32,
    pub pipeline_id: PipelineId,
    pub parent: Option<Arc<SafetyContext>>,
    pub step_count: u32,
    pub start_time: Instant,
    pub workspace_dir: Option<std::path::PathBuf>,
    pub bytes_used: u64,
    pub limits: SafetyLimits,
}

impl SafetyContext {
    /// Root context for a top-level pipeline execution.
    pub fn root(limits: SafetyLimits) -> Self {
        Self {
            depth: 0,
            pipeline_id: PipelineId::new(),
            parent: None,
            step_count: 0,
            start_time: Instant::now(),
            workspace_dir: None,
            bytes_used: 0,
            limits,
        }
    }

    /// Build the child context for a `nested_pipeline` step. The child owns
    /// a new `pipeline_id`, `depth + 1`, and a pointer back to `self`.
    pub fn child(parent: &Arc<SafetyContext>, limits: SafetyLimits) -> Self {
        Self {
            depth: parent.depth + 1,
            pipeline_id: PipelineId::new(),
            parent: Some(Arc::clone(parent)),
            step_count: 0,
            start_time: Instant::now(),
            workspace_dir: None,
            bytes_used: 0,
            limits,
        }
    }

    /// Ancestor chain from root to self, inclusive, for error messages and
    /// the circular-dependency check.
    pub fn ancestor_chain(&self) -> Vec<PipelineId> {
        let mut chain = Vec::new();
        let mut current = Some(self);
        let mut owned: Option<Arc<SafetyContext>>;
        loop {
            match current {
                Some(ctx) => {
                    chain.push(ctx.pipeline_id);
                    owned = ctx.parent.clone();
                    current = owned.as_deref();
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    /// True if `pipeline_id` already appears on the ancestor chain — the
    /// circular-dependency check run before entering a nested pipeline.
    pub fn chain_contains(&self, pipeline_id: PipelineId) -> bool {
        let mut current = Some(self);
        let mut owned: Option<Arc<SafetyContext>>;
        loop {
            match current {
                Some(ctx) => {
                    if ctx.pipeline_id == pipeline_id {
                        return true;
                    }
                    owned = ctx.parent.clone();
                    current = owned.as_deref();
                }
                None => return false,
            }
        }
    }

    /// Sum of `step_count` along the ancestor chain (including self),
    /// compared against `max_total_steps` so sibling nested pipelines can't
    /// evade the cap by splitting work (§4.10 `nested_pipeline`).
    pub fn cumulative_step_count(&self) -> u32 {
        let mut total = self.step_count;
        let mut current = self.parent.clone();
        while let Some(ctx) = current {
            total += ctx.step_count;
            current = ctx.parent.clone();
        }
        total
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn record_step(&mut self) {
        self.step_count += 1;
    }

    /// Accumulate an estimate of bytes held in the Result Store, checked
    /// against `limits.memory_limit_mb` before the next step runs. An
    /// approximation of actual process memory, not a real RSS probe.
    pub fn record_bytes(&mut self, bytes: u64) {
        self.bytes_used += bytes;
    }
}

/// The scope a `set_variable` step writes into (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableScope {
    Global,
    Session,
    Loop,
}

/// Scoped variable storage carried through execution (§3 "Context").
///
/// Lookup precedence for unscoped reads is loop, then session, then global —
/// the narrowest scope wins, mirroring how `for_loop`/`while_loop` iteration
/// variables should shadow anything set earlier at broader scope.
#[derive(Debug, Clone, Default)]
pub struct VariableState {
    global: BTreeMap<String, Value>,
    session: BTreeMap<String, Value>,
    loop_vars: BTreeMap<String, Value>,
}

impl VariableState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, scope: VariableScope, key: impl Into<String>, value: Value) {
        let key = key.into();
        match scope {
            VariableScope::Global => self.global.insert(key, value),
            VariableScope::Session => self.session.insert(key, value),
            VariableScope::Loop => self.loop_vars.insert(key, value),
        };
    }

    pub fn get(&self, scope: VariableScope, key: &str) -> Option<&Value> {
        match scope {
            VariableScope::Global => self.global.get(key),
            VariableScope::Session => self.session.get(key),
            VariableScope::Loop => self.loop_vars.get(key),
        }
    }

    /// Resolve a bare variable name across scopes, narrowest first.
    pub fn resolve(&self, key: &str) -> Option<&Value> {
        self.loop_vars
            .get(key)
            .or_else(|| self.session.get(key))
            .or_else(|| self.global.get(key))
    }

    pub fn clear_loop_scope(&mut self) {
        self.loop_vars.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_depth_strictly_increases() {
        let root = Arc::new(SafetyContext::root(SafetyLimits::default()));
        let child = SafetyContext::child(&root, SafetyLimits::default());
        assert_eq!(child.depth, root.depth + 1);
        assert!(child.parent.is_some());
    }

    #[test]
    fn ancestor_chain_is_root_to_self() {
        let root = Arc::new(SafetyContext::root(SafetyLimits::default()));
        let mid = Arc::new(SafetyContext::child(&root, SafetyLimits::default()));
        let leaf = SafetyContext::child(&mid, SafetyLimits::default());

        let chain = leaf.ancestor_chain();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0], root.pipeline_id);
        assert_eq!(chain[2], leaf.pipeline_id);
    }

    #[test]
    fn chain_contains_detects_cycle_candidate() {
        let root = Arc::new(SafetyContext::root(SafetyLimits::default()));
        let child = SafetyContext::child(&root, SafetyLimits::default());
        assert!(child.chain_contains(root.pipeline_id));
        assert!(!child.chain_contains(PipelineId::new()));
    }

    #[test]
    fn cumulative_step_count_sums_ancestor_chain() {
        let mut root = SafetyContext::root(SafetyLimits::default());
        root.step_count = 5;
        let root = Arc::new(root);
        let mut child = SafetyContext::child(&root, SafetyLimits::default());
        child.step_count = 3;
        assert_eq!(child.cumulative_step_count(), 8);
    }

    #[test]
    fn pipeline_id_from_path_is_deterministic() {
        assert_eq!(
            PipelineId::from_path("workflows/child.yaml"),
            PipelineId::from_path("workflows/child.yaml")
        );
        assert_ne!(
            PipelineId::from_path("workflows/child.yaml"),
            PipelineId::from_path("workflows/other.yaml")
        );
    }

    #[test]
    fn variable_resolution_prefers_narrowest_scope() {
        let mut state = VariableState::new();
        state.set(VariableScope::Global, "x", Value::from(1.0));
        state.set(VariableScope::Session, "x", Value::from(2.0));
        state.set(VariableScope::Loop, "x", Value::from(3.0));
        assert_eq!(state.resolve("x"), Some(&Value::from(3.0)));

        state.clear_loop_scope();
        assert_eq!(state.resolve("x"), Some(&Value::from(2.0)));
    }
}
