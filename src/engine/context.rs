//! Execution state shared with tools: the layered variable environment,
//! per-step results, and the per-step execution context handle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::ai::{AiCollector, CostReport, CostTracker};
use crate::config::{AiConfig, ExecutionOptions};
use crate::error::{EngineError, ErrorCode, Result};
use crate::interaction::UserInteraction;
use crate::subprocess::ProcessRunner;

/// Layered variable map used to render step inputs.
///
/// Precedence, highest first: step-local overrides, previous step
/// outputs (under `steps.<name>`), bound recipe variables.
#[derive(Debug, Clone, Default)]
pub struct VariableEnvironment {
    recipe_vars: Map<String, Value>,
    overrides: Map<String, Value>,
    steps: Map<String, Value>,
    recipe_meta: Map<String, Value>,
}

impl VariableEnvironment {
    pub fn new(recipe_name: &str, recipe_version: Option<&str>, bound: Map<String, Value>) -> Self {
        let mut recipe_meta = Map::new();
        recipe_meta.insert("name".to_string(), Value::String(recipe_name.to_string()));
        if let Some(version) = recipe_version {
            recipe_meta.insert("version".to_string(), Value::String(version.to_string()));
        }
        Self {
            recipe_vars: bound,
            overrides: Map::new(),
            steps: Map::new(),
            recipe_meta,
        }
    }

    pub fn set_override(&mut self, name: impl Into<String>, value: Value) {
        self.overrides.insert(name.into(), value);
    }

    pub fn merge_overrides(&mut self, values: &BTreeMap<String, Value>) {
        for (key, value) in values {
            self.overrides.insert(key.clone(), value.clone());
        }
    }

    /// Promote a variable into the recipe layer, where later steps see
    /// it without a step-local override. Used for `provide()` and the
    /// prompt tool.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.recipe_vars.insert(name.into(), value);
    }

    pub fn record_step(&mut self, step_name: &str, summary: Value) {
        self.steps.insert(step_name.to_string(), summary);
    }

    pub fn step_outputs(&self) -> &Map<String, Value> {
        &self.steps
    }

    /// The plain variable layer (recipe variables with overrides
    /// applied), without `steps` or `recipe`. Used as the input set for
    /// sub-recipe invocations.
    pub fn flat_variables(&self) -> std::collections::BTreeMap<String, Value> {
        let mut flat: std::collections::BTreeMap<String, Value> = self
            .recipe_vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in &self.overrides {
            flat.insert(key.clone(), value.clone());
        }
        flat
    }

    /// Resolve a dotted path such as `steps.probe.output.pkgName`.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let root = parts.next()?;
        let base = match root {
            "steps" => {
                let step = parts.next()?;
                self.steps.get(step)?.clone()
            }
            "recipe" => Value::Object(self.recipe_meta.clone()),
            _ => self
                .overrides
                .get(root)
                .or_else(|| self.recipe_vars.get(root))?
                .clone(),
        };
        let mut current = base;
        for part in parts {
            current = current.get(part)?.clone();
        }
        Some(current)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// Render context for tera: variables at the root, plus `steps` and
    /// `recipe` objects.
    pub fn to_render_value(&self) -> Map<String, Value> {
        let mut root = self.recipe_vars.clone();
        for (key, value) in &self.overrides {
            root.insert(key.clone(), value.clone());
        }
        root.insert("steps".to_string(), Value::Object(self.steps.clone()));
        root.insert("recipe".to_string(), Value::Object(self.recipe_meta.clone()));
        root
    }

    pub fn to_tera_context(&self) -> tera::Context {
        tera::Context::from_value(Value::Object(self.to_render_value()))
            .expect("object root always converts")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepError {
    pub code: crate::error::ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_name: String,
    pub tool_type: String,
    pub status: StepStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,
    pub files_created: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub retry_count: u32,
}

impl StepResult {
    /// Summary object exposed to later steps as `steps.<name>`.
    pub fn summary(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "status".to_string(),
            serde_json::to_value(self.status).expect("status serializes"),
        );
        map.insert(
            "success".to_string(),
            Value::Bool(self.status == StepStatus::Completed),
        );
        if let Some(output) = &self.output {
            map.insert("output".to_string(), output.clone());
        }
        if let Some(tool_result) = &self.tool_result {
            map.insert("toolResult".to_string(), tool_result.clone());
        }
        map.insert(
            "filesCreated".to_string(),
            serde_json::to_value(&self.files_created).expect("paths serialize"),
        );
        map.insert(
            "filesModified".to_string(),
            serde_json::to_value(&self.files_modified).expect("paths serialize"),
        );
        Value::Object(map)
    }
}

/// Aggregate result of one recipe run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    pub step_results: Vec<StepResult>,
    pub files_created: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_report: Option<CostReport>,
    /// Pass-1 deferral: the assembled prompt document to print. The
    /// surrounding CLI exits with code 2 when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deferred_prompt: Option<String>,
}

impl RunResult {
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_name == name)
    }
}

/// Per-step handle passed to tools. Tools read from it and return a
/// result; only the group executor commits state.
#[derive(Clone)]
pub struct ExecutionContext {
    pub recipe_name: String,
    pub recipe_version: Option<String>,
    pub step_name: String,
    pub env: VariableEnvironment,
    pub options: ExecutionOptions,
    pub ai: AiConfig,
    pub step_results: Arc<BTreeMap<String, StepResult>>,
    pub collector: Arc<Mutex<AiCollector>>,
    pub cost: Arc<Mutex<CostTracker>>,
    pub runner: Arc<dyn ProcessRunner>,
    pub interaction: Arc<dyn UserInteraction>,
}

impl ExecutionContext {
    pub fn evaluate_condition(&self, expr: &str) -> Result<bool> {
        super::expression::evaluate(expr, &self.env).map_err(|e| {
            EngineError::new(
                ErrorCode::RecipeSchemaInvalid,
                format!("invalid condition `{expr}`: {e}"),
            )
        })
    }

    /// Writes are suppressed in dry runs and during Pass-1 collection.
    pub fn writes_suppressed(&self) -> bool {
        self.options.dry_run || self.options.collect_mode
    }

    /// Resolve a path against the project root.
    pub fn project_path(&self, relative: &str) -> PathBuf {
        let path = PathBuf::from(relative);
        if path.is_absolute() {
            path
        } else {
            self.options.project_root.join(path)
        }
    }

    /// Resolve a template path against the template root.
    pub fn template_path(&self, relative: &str) -> PathBuf {
        let path = PathBuf::from(relative);
        if path.is_absolute() {
            path
        } else {
            self.options.template_root.join(path)
        }
    }
}
