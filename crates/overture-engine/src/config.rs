//! Engine configuration.
//!
//! One [`EngineConfig`] is built by the caller (usually from environment
//! variables) and handed to each [`crate::context::RunContext`]; stages and
//! tools reach configuration through the context, never through ambient
//! globals.

use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::cache::ModelResolver;
use crate::model::ModelConfig;

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default model connection settings, used for any scenario without an
    /// override.
    pub model: ModelConfig,

    /// Per-scenario overrides of the default model settings.
    #[serde(default)]
    pub model_overrides: HashMap<String, ModelConfig>,

    /// Upper bound on model/tool alternations in the direct stage loop.
    pub recursion_limit: u32,

    /// Upper bound on model/tool alternations in each per-step loop.
    pub executor_recursion_limit: u32,

    /// Maximum number of plan steps executed before the run ends normally.
    pub plan_max_steps: usize,

    /// Whether a committed plan must be approved before execution.
    pub plan_require_approval: bool,

    /// Whether the replanning evaluator runs at all.
    pub plan_revision_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            model_overrides: HashMap::new(),
            recursion_limit: 50,
            executor_recursion_limit: 30,
            plan_max_steps: 10,
            plan_require_approval: false,
            plan_revision_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// Recognized variables: `LLM_API_KEY` (or `OPENAI_API_KEY`),
    /// `LLM_API_BASE` (or `OPENAI_API_BASE`), `LLM_MODEL`,
    /// `LLM_TEMPERATURE`, `LLM_MAX_TOKENS`, `PLAN_MAX_STEPS`,
    /// `PLAN_REQUIRE_APPROVAL`, `PLAN_REVISION_ENABLED`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(key) = first_env(&["LLM_API_KEY", "OPENAI_API_KEY"]) {
            config.model.api_key = key;
        }
        if let Some(base) = first_env(&["LLM_API_BASE", "OPENAI_API_BASE"]) {
            config.model.api_base = base;
        }
        if let Ok(model) = env::var("LLM_MODEL") {
            config.model.model = model;
        }
        if let Ok(t) = env::var("LLM_TEMPERATURE") {
            if let Ok(t) = t.parse() {
                config.model.temperature = t;
            }
        }
        if let Ok(n) = env::var("LLM_MAX_TOKENS") {
            if let Ok(n) = n.parse() {
                config.model.max_tokens = n;
            }
        }
        if let Ok(n) = env::var("PLAN_MAX_STEPS") {
            if let Ok(n) = n.parse() {
                config.plan_max_steps = n;
            }
        }
        if let Ok(v) = env::var("PLAN_REQUIRE_APPROVAL") {
            config.plan_require_approval = is_truthy(&v);
        }
        if let Ok(v) = env::var("PLAN_REVISION_ENABLED") {
            config.plan_revision_enabled = is_truthy(&v);
        }

        Ok(config)
    }
}

impl ModelResolver for EngineConfig {
    fn resolve(&self, scenario: &str) -> Result<ModelConfig> {
        Ok(self
            .model_overrides
            .get(scenario)
            .cloned()
            .unwrap_or_else(|| self.model.clone()))
    }
}

fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| env::var(name).ok())
        .find(|v| !v.is_empty())
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
