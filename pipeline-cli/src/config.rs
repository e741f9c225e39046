//! ABOUTME: CLI-level runtime configuration: the Safety Manager limits
//! ABOUTME: applied to every run, loaded from an optional YAML file.

use anyhow::{Context, Result};
use pipeline_core::SafetyLimits;
use serde::Deserialize;
use std::path::Path;

/// Runtime configuration independent of any single workflow document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_depth: u32,
    pub max_total_steps: u32,
    pub memory_limit_mb: u64,
    pub timeout_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let limits = SafetyLimits::default();
        Self {
            max_depth: limits.max_depth,
            max_total_steps: limits.max_total_steps,
            memory_limit_mb: limits.memory_limit_mb,
            timeout_seconds: limits.timeout_seconds,
        }
    }
}

impl RuntimeConfig {
    pub fn limits(&self) -> SafetyLimits {
        SafetyLimits {
            max_depth: self.max_depth,
            max_total_steps: self.max_total_steps,
            memory_limit_mb: self.memory_limit_mb,
            timeout_seconds: self.timeout_seconds,
        }
    }
}

/// Load runtime configuration from `path`, or fall back to defaults when
/// the caller didn't pass `--config`.
pub fn load_runtime_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    let Some(path) = path else {
        return Ok(RuntimeConfig::default());
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    let config: RuntimeConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("invalid config document '{}'", path.display()))?;
    Ok(config)
}
