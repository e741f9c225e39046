//! ABOUTME: Safety Manager — enforces the Safety Context's depth, step
//! ABOUTME: count, timeout, memory, and recursion limits, and owns the
//! ABOUTME: workspace-directory lifecycle around a pipeline invocation.

use pipeline_core::{PipelineError, PipelineId, Result, SafetyContext};
use std::path::{Path, PathBuf};

/// Check `ctx` against its own limits before running the next step.
/// Called once per step, after `record_step` would push the cumulative
/// count over the limit — so the caller should check, then record.
pub fn check_before_step(ctx: &SafetyContext) -> Result<()> {
    if ctx.cumulative_step_count() >= ctx.limits.max_total_steps {
        return Err(PipelineError::Resource {
            message: format!(
                "pipeline exceeded max_total_steps ({})",
                ctx.limits.max_total_steps
            ),
        });
    }
    if ctx.elapsed().as_secs() >= ctx.limits.timeout_seconds {
        return Err(PipelineError::Timeout {
            message: format!(
                "pipeline exceeded timeout_seconds ({})",
                ctx.limits.timeout_seconds
            ),
            duration_ms: Some(ctx.elapsed().as_millis() as u64),
        });
    }
    let limit_bytes = ctx.limits.memory_limit_mb.saturating_mul(1024 * 1024);
    if ctx.bytes_used >= limit_bytes {
        return Err(PipelineError::Resource {
            message: format!(
                "pipeline exceeded memory_limit_mb ({})",
                ctx.limits.memory_limit_mb
            ),
        });
    }
    Ok(())
}

/// Check a `nested_pipeline` step before descending: depth must stay
/// within `max_depth`, and the child pipeline id must not already appear
/// on the ancestor chain.
pub fn check_before_descend(ctx: &SafetyContext, child_pipeline_id: PipelineId) -> Result<()> {
    if ctx.depth + 1 > ctx.limits.max_depth {
        return Err(PipelineError::Recursion {
            message: format!("pipeline exceeded max_depth ({})", ctx.limits.max_depth),
            ancestor_chain: ctx
                .ancestor_chain()
                .iter()
                .map(ToString::to_string)
                .collect(),
        });
    }
    if ctx.chain_contains(child_pipeline_id) {
        return Err(PipelineError::Recursion {
            message: "nested pipeline would re-enter an ancestor pipeline".to_string(),
            ancestor_chain: ctx
                .ancestor_chain()
                .iter()
                .map(ToString::to_string)
                .collect(),
        });
    }
    Ok(())
}

/// Holds the workspace directory a pipeline invocation is using for the
/// duration of its run. Dropping the guard cleans up an auto-created temp
/// directory; a caller-configured directory is left untouched.
pub struct WorkspaceGuard {
    path: PathBuf,
    _temp: Option<tempfile::TempDir>,
}

impl WorkspaceGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Enter a pipeline's workspace-directory lifecycle: use `configured` if
/// given (creating it if it doesn't exist yet), otherwise mint a fresh
/// temporary directory. Either way, `ctx.workspace_dir` is set so
/// `{{workspace_dir}}` and relative `file`/`pipeline_file` resolution see
/// the directory actually in use for this invocation.
pub fn enter_pipeline(
    ctx: &mut SafetyContext,
    configured: Option<&Path>,
) -> Result<WorkspaceGuard> {
    let guard = match configured {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|err| PipelineError::File {
                message: err.to_string(),
                path: Some(dir.display().to_string()),
            })?;
            WorkspaceGuard {
                path: dir.to_path_buf(),
                _temp: None,
            }
        }
        None => {
            let temp = tempfile::tempdir().map_err(|err| PipelineError::File {
                message: err.to_string(),
                path: None,
            })?;
            WorkspaceGuard {
                path: temp.path().to_path_buf(),
                _temp: Some(temp),
            }
        }
    };
    ctx.workspace_dir = Some(guard.path.clone());
    Ok(guard)
}

/// Leave a pipeline's workspace-directory lifecycle: clear `ctx.workspace_dir`
/// and drop `guard`, which removes an auto-created temp directory (a
/// caller-configured one is left on disk for the caller to manage).
pub fn exit_pipeline(ctx: &mut SafetyContext, guard: WorkspaceGuard) {
    ctx.workspace_dir = None;
    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::SafetyLimits;
    use std::sync::Arc;

    #[test]
    fn step_count_limit_is_enforced() {
        let mut ctx = SafetyContext::root(SafetyLimits {
            max_total_steps: 2,
            ..SafetyLimits::default()
        });
        ctx.step_count = 2;
        let err = check_before_step(&ctx).unwrap_err();
        assert_eq!(err.kind(), "resource");
    }

    #[test]
    fn memory_limit_is_enforced() {
        let mut ctx = SafetyContext::root(SafetyLimits {
            memory_limit_mb: 1,
            ..SafetyLimits::default()
        });
        ctx.bytes_used = 2 * 1024 * 1024;
        let err = check_before_step(&ctx).unwrap_err();
        assert_eq!(err.kind(), "resource");
    }

    #[test]
    fn depth_limit_is_enforced_before_descending() {
        let limits = SafetyLimits {
            max_depth: 1,
            ..SafetyLimits::default()
        };
        let root = Arc::new(SafetyContext::root(limits));
        let child = SafetyContext::child(&root, limits);
        let err = check_before_descend(&child, PipelineId::new()).unwrap_err();
        assert_eq!(err.kind(), "recursion");
    }

    #[test]
    fn cycle_back_to_an_ancestor_is_rejected() {
        let root = SafetyContext::root(SafetyLimits::default());
        let root_id = root.pipeline_id;
        let root = Arc::new(root);
        let child = SafetyContext::child(&root, SafetyLimits::default());
        let err = check_before_descend(&child, root_id).unwrap_err();
        assert_eq!(err.kind(), "recursion");
    }

    #[test]
    fn within_limits_is_ok() {
        let ctx = SafetyContext::root(SafetyLimits::default());
        assert!(check_before_step(&ctx).is_ok());
    }

    #[test]
    fn enter_pipeline_without_configured_dir_mints_a_temp_directory() {
        let mut ctx = SafetyContext::root(SafetyLimits::default());
        let guard = enter_pipeline(&mut ctx, None).unwrap();
        assert!(guard.path().exists());
        assert_eq!(ctx.workspace_dir.as_deref(), Some(guard.path()));
        let path = guard.path().to_path_buf();
        exit_pipeline(&mut ctx, guard);
        assert!(ctx.workspace_dir.is_none());
        assert!(!path.exists());
    }

    #[test]
    fn enter_pipeline_with_configured_dir_uses_it_and_leaves_it_on_disk() {
        let configured = tempfile::tempdir().unwrap();
        let mut ctx = SafetyContext::root(SafetyLimits::default());
        let guard = enter_pipeline(&mut ctx, Some(configured.path())).unwrap();
        assert_eq!(guard.path(), configured.path());
        exit_pipeline(&mut ctx, guard);
        assert!(configured.path().exists());
    }
}
