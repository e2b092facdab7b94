//! Recipe data model.
//!
//! A recipe is a declarative process definition: named variables, a list
//! of steps forming a dependency graph, and optional completion messages.
//! Steps are a tagged union over the `tool` key; the tag decides which
//! tool-specific fields are valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub mod loader;
pub mod variables;

pub use loader::{load_recipe_file, load_recipe_str, Diagnostic, LoadedRecipe};
pub use variables::bind_variables;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<RecipeRef>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, rename = "onSuccess", skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,
    #[serde(default, rename = "onError", skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
}

/// Reference to an imported sub-recipe, by path relative to the importing
/// recipe's directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeRef {
    pub path: String,
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    #[default]
    String,
    Boolean,
    Number,
    Enum,
    Array,
    Object,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VariableDef {
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One unit of work within a recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, rename = "dependsOn", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, rename = "continueOnError")]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, serde_json::Value>,
    #[serde(flatten)]
    pub action: ToolSpec,
}

/// Tool-specific step payloads, tagged by the `tool` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "kebab-case")]
pub enum ToolSpec {
    Template(TemplateStep),
    Ai(AiStep),
    Shell(ShellStep),
    Query(QueryStep),
    Patch(PatchStep),
    Install(InstallStep),
    EnsureDirs(EnsureDirsStep),
    Prompt(PromptStep),
    Recipe(RecipeStep),
    Sequence(SequenceStep),
    Parallel(ParallelStep),
    Conditional(ConditionalStep),
}

impl ToolSpec {
    pub fn tool_name(&self) -> &'static str {
        match self {
            ToolSpec::Template(_) => "template",
            ToolSpec::Ai(_) => "ai",
            ToolSpec::Shell(_) => "shell",
            ToolSpec::Query(_) => "query",
            ToolSpec::Patch(_) => "patch",
            ToolSpec::Install(_) => "install",
            ToolSpec::EnsureDirs(_) => "ensure-dirs",
            ToolSpec::Prompt(_) => "prompt",
            ToolSpec::Recipe(_) => "recipe",
            ToolSpec::Sequence(_) => "sequence",
            ToolSpec::Parallel(_) => "parallel",
            ToolSpec::Conditional(_) => "conditional",
        }
    }

    /// Grouping tools run nested steps through the executor instead of a
    /// registry dispatch.
    pub fn is_grouping(&self) -> bool {
        matches!(
            self,
            ToolSpec::Recipe(_)
                | ToolSpec::Sequence(_)
                | ToolSpec::Parallel(_)
                | ToolSpec::Conditional(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateStep {
    pub template: TemplateRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateRef {
    Path(String),
    Detailed {
        path: String,
        #[serde(default)]
        variables: BTreeMap<String, serde_json::Value>,
    },
}

impl TemplateRef {
    pub fn path(&self) -> &str {
        match self {
            TemplateRef::Path(path) => path,
            TemplateRef::Detailed { path, .. } => path,
        }
    }

    pub fn variables(&self) -> Option<&BTreeMap<String, serde_json::Value>> {
        match self {
            TemplateRef::Path(_) => None,
            TemplateRef::Detailed { variables, .. } => Some(variables),
        }
    }
}

/// Insertion anchor shared by template frontmatter, the patch tool, and
/// the ai tool's inject output. Exactly one strategy may be set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnchorSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<AtPosition>,
    #[serde(default, rename = "atLine", skip_serializing_if = "Option::is_none")]
    pub at_line: Option<usize>,
}

impl AnchorSpec {
    pub fn strategy_count(&self) -> usize {
        [
            self.after.is_some(),
            self.before.is_some(),
            self.at.is_some(),
            self.at_line.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    pub fn is_empty(&self) -> bool {
        self.strategy_count() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtPosition {
    Start,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiStep {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<crate::ai::context::ContextSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<AiExample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, rename = "maxTokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrails: Option<crate::ai::validation::GuardrailConfig>,
    pub output: OutputSpec,
    #[serde(default, rename = "retryOnFailure")]
    pub retry_on_failure: u32,
    #[serde(default, rename = "onFailure")]
    pub on_failure: AiFailureAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiExample {
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AiFailureAction {
    #[default]
    Error,
    Fallback,
    Retry,
}

/// Where an ai step's answer goes. Exactly one of the variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputSpec {
    Variable {
        variable: String,
    },
    File {
        to: String,
    },
    Inject {
        into: String,
        #[serde(flatten)]
        anchor: AnchorSpec,
    },
    Stdout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellStep {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default = "default_true", rename = "captureOutput")]
    pub capture_output: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryFormat {
    Json,
    Yaml,
    Toml,
    Env,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStep {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<QueryFormat>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<QueryCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCheck {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<String>,
    #[serde(default, rename = "exportExists", skip_serializing_if = "Option::is_none")]
    pub export_exists: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchStep {
    pub file: String,
    /// Literal text inserted at the anchor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub anchor: AnchorSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<String>,
    /// Regex substitution alternative to anchor insertion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallStep {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(default)]
    pub dev: bool,
    #[serde(default, rename = "packageManager", skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureDirsStep {
    pub dirs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptStep {
    pub message: String,
    pub variable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
}

/// Sub-recipe invocation. Values for the sub-recipe come from the
/// step-local `variables` map plus the parent environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeStep {
    pub recipe: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelStep {
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalStep {
    #[serde(rename = "if")]
    pub condition: String,
    pub then: Vec<Step>,
    #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<Vec<Step>>,
}
