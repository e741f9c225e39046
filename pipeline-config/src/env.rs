//! ABOUTME: Environment variable overrides — the closed set of
//! ABOUTME: `PIPELINE_*`/provider-key env vars this orchestrator reads,
//! ABOUTME: centralized into a single registry of env var definitions
//! ABOUTME: rather than scattering `env::var` calls through the codebase.

use std::collections::BTreeMap;
use std::env;

/// One entry in the environment override table: the var name, what it
/// overrides, and how to parse it.
#[derive(Debug, Clone, Copy)]
pub struct EnvVarDef {
    pub name: &'static str,
    pub description: &'static str,
}

/// The closed set of environment variables this orchestrator recognizes.
pub const ENV_VARS: &[EnvVarDef] = &[
    EnvVarDef {
        name: "PIPELINE_WORKSPACE_DIR",
        description: "root directory file_ops/codebase_query steps resolve relative paths against",
    },
    EnvVarDef {
        name: "PIPELINE_OUTPUT_DIR",
        description: "directory step output_to_file paths resolve relative to",
    },
    EnvVarDef {
        name: "PIPELINE_CHECKPOINT_DIR",
        description: "directory session checkpoints are written to when persist is set",
    },
    EnvVarDef {
        name: "PIPELINE_DEBUG",
        description: "when set to a truthy value, forces verbose/debug_mode on regardless of preset",
    },
    EnvVarDef {
        name: "TEST_MODE",
        description: "when set to a truthy value, routes claude*/gemini* steps to mock providers",
    },
    EnvVarDef {
        name: "GEMINI_API_KEY",
        description: "credential used by the Structured Provider's concrete transport",
    },
];

fn is_truthy(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Resolved environment overrides, read once at startup.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub workspace_dir: Option<String>,
    pub output_dir: Option<String>,
    pub checkpoint_dir: Option<String>,
    pub debug: bool,
    pub test_mode: bool,
    pub gemini_api_key: Option<String>,
}

impl EnvOverrides {
    /// Read the closed set of recognized env vars from the process
    /// environment. Unknown `PIPELINE_*` vars are not an error; this
    /// orchestrator only acts on the names it knows about.
    pub fn from_env() -> Self {
        Self::from_map(&env_snapshot())
    }

    /// Build overrides from an explicit map instead of the process
    /// environment, for deterministic tests.
    pub fn from_map(vars: &BTreeMap<String, String>) -> Self {
        EnvOverrides {
            workspace_dir: vars.get("PIPELINE_WORKSPACE_DIR").cloned(),
            output_dir: vars.get("PIPELINE_OUTPUT_DIR").cloned(),
            checkpoint_dir: vars.get("PIPELINE_CHECKPOINT_DIR").cloned(),
            debug: vars
                .get("PIPELINE_DEBUG")
                .map(|v| is_truthy(v))
                .unwrap_or(false),
            test_mode: vars
                .get("TEST_MODE")
                .map(|v| is_truthy(v))
                .unwrap_or(false),
            gemini_api_key: vars.get("GEMINI_API_KEY").cloned(),
        }
    }
}

fn env_snapshot() -> BTreeMap<String, String> {
    ENV_VARS
        .iter()
        .filter_map(|def| env::var(def.name).ok().map(|v| (def.name.to_string(), v)))
        .collect()
}
