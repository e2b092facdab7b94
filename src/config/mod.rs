//! Engine configuration: execution options and the AI subsystem config.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::ai::cost::{BudgetLimits, ModelPricing};

/// How AI steps and `@ai` blocks are resolved for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AiMode {
    /// Call a provider HTTP API.
    Api,
    /// Pipe the prompt through a configured command.
    Command,
    /// Print the assembled prompt document and defer (Pass 1).
    Stdout,
    /// Alias of `stdout` for now.
    Off,
    /// `api` if an API key is present, else `command` if one is
    /// configured, else `stdout`.
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    Openai,
    Google,
}

impl Provider {
    pub fn default_api_key_env(&self) -> &'static str {
        match self {
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::Openai => "OPENAI_API_KEY",
            Provider::Google => "GOOGLE_GENERATIVE_AI_API_KEY",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Anthropic => "claude-sonnet-4-20250514",
            Provider::Openai => "gpt-4o-mini",
            Provider::Google => "gemini-2.0-flash",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Some(Provider::Anthropic),
            "openai" => Some(Provider::Openai),
            "google" | "gemini" => Some(Provider::Google),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AiConfig {
    #[serde(default)]
    pub mode: AiMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Overrides the provider's default API key environment variable.
    #[serde(default, rename = "apiKeyEnvVar", skip_serializing_if = "Option::is_none")]
    pub api_key_env_var: Option<String>,
    /// Command template for the `command` transport; `{prompt}` expands
    /// to the assembled prompt, otherwise the prompt is piped to stdin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Global system prompt prepended to every ai step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub pricing: HashMap<String, ModelPricing>,
    #[serde(default)]
    pub budget: BudgetLimits,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl AiConfig {
    pub fn api_key_env(&self, provider: Provider) -> String {
        self.api_key_env_var
            .clone()
            .unwrap_or_else(|| provider.default_api_key_env().to_string())
    }
}

/// Per-run execution options, shared by every step.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub project_root: PathBuf,
    /// Root for resolving template paths; defaults to the recipe's
    /// directory.
    pub template_root: PathBuf,
    pub dry_run: bool,
    pub force: bool,
    pub non_interactive: bool,
    /// Pass-1: render templates without writing, collecting `@ai`
    /// blocks.
    pub collect_mode: bool,
    /// Pass-2 answers map, keyed by `@ai` block key.
    pub answers: Option<BTreeMap<String, String>>,
    pub ai_mode: Option<AiMode>,
    /// How this run was invoked; echoed in the Pass-1 prompt document's
    /// re-run instructions.
    pub invocation: Option<String>,
}

impl ExecutionOptions {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        Self {
            template_root: project_root.clone(),
            project_root,
            force: std::env::var("HYPERGEN_OVERWRITE").map(|v| v == "1").unwrap_or(false),
            ..Default::default()
        }
    }

    pub fn template_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.template_root = root.into();
        self
    }
}
