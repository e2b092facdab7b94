//! Recipe loading: parse, schema-validate, resolve imports, and collect
//! diagnostics.
//!
//! Loading never writes to the filesystem; it only reads imported
//! sub-recipes.

use serde_yaml::Value as YamlValue;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::{Recipe, Step, ToolSpec};
use crate::error::{EngineError, ErrorCode, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct LoadedRecipe {
    pub recipe: Recipe,
    pub diagnostics: Vec<Diagnostic>,
    /// Directory the recipe was loaded from; template paths resolve
    /// against it.
    pub dir: PathBuf,
}

pub fn load_recipe_file(path: &Path) -> Result<LoadedRecipe> {
    let mut visited = HashSet::new();
    load_file_inner(path, &mut visited)
}

/// Load from in-memory text; imports resolve against `base_dir`.
pub fn load_recipe_str(text: &str, base_dir: &Path) -> Result<LoadedRecipe> {
    let mut visited = HashSet::new();
    load_str_inner(text, base_dir, &mut visited)
}

fn load_file_inner(path: &Path, visited: &mut HashSet<PathBuf>) -> Result<LoadedRecipe> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canonical.clone()) {
        return Err(EngineError::new(
            ErrorCode::CompositionCycle,
            format!("recipe imports form a cycle through `{}`", path.display()),
        ));
    }

    let text = std::fs::read_to_string(path).map_err(|e| {
        EngineError::new(
            ErrorCode::IoError,
            format!("cannot read recipe `{}`", path.display()),
        )
        .with_source(e)
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let loaded = load_str_inner(&text, &base_dir, visited);
    visited.remove(&canonical);
    loaded
}

fn load_str_inner(
    text: &str,
    base_dir: &Path,
    visited: &mut HashSet<PathBuf>,
) -> Result<LoadedRecipe> {
    let raw: YamlValue = serde_yaml::from_str(text).map_err(|e| {
        EngineError::new(
            ErrorCode::RecipeParseError,
            format!("malformed recipe YAML: {e}"),
        )
        .with_source(e)
    })?;

    let mut diagnostics = Vec::new();
    scan_unknown_fields(&raw, &mut diagnostics);

    let mut recipe: Recipe = serde_yaml::from_value(raw).map_err(|e| {
        EngineError::new(
            ErrorCode::RecipeSchemaInvalid,
            format!("recipe does not match the schema: {e}"),
        )
        .with_source(e)
    })?;

    // Resolve composition before validating, so dependsOn may target
    // imported steps. Imported steps are namespaced under the import
    // alias and run before the recipe's own steps; imported variable
    // definitions fill gaps but never override the parent's.
    let imports = std::mem::take(&mut recipe.imports);
    let mut merged_steps = Vec::new();
    for import in &imports {
        let import_path = base_dir.join(&import.path);
        let imported = load_file_inner(&import_path, visited)?;
        diagnostics.extend(imported.diagnostics);

        let alias = import.alias.clone().unwrap_or_else(|| {
            Path::new(&import.path)
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_else(|| import.path.clone())
        });

        for (name, def) in imported.recipe.variables {
            recipe.variables.entry(name).or_insert(def);
        }
        let mut steps = imported.recipe.steps;
        namespace_steps(&mut steps, &alias);
        merged_steps.extend(steps);
    }
    merged_steps.append(&mut recipe.steps);
    recipe.steps = merged_steps;

    validate_recipe(&recipe)?;

    Ok(LoadedRecipe {
        recipe,
        diagnostics,
        dir: base_dir.to_path_buf(),
    })
}

fn namespace_steps(steps: &mut [Step], alias: &str) {
    let names: HashSet<String> = steps.iter().map(|s| s.name.clone()).collect();
    for step in steps {
        step.name = format!("{alias}/{}", step.name);
        for dep in &mut step.depends_on {
            if names.contains(dep) {
                *dep = format!("{alias}/{dep}");
            }
        }
    }
}

fn validate_recipe(recipe: &Recipe) -> Result<()> {
    if recipe.name.trim().is_empty() {
        return Err(EngineError::new(
            ErrorCode::RecipeSchemaInvalid,
            "recipe name must not be empty",
        ));
    }

    validate_step_list(&recipe.steps)?;

    for (field, text) in [("onSuccess", &recipe.on_success), ("onError", &recipe.on_error)] {
        if let Some(text) = text {
            // Pre-parse only; rendering happens after the run.
            let mut tera = tera::Tera::default();
            tera.add_raw_template(field, text).map_err(|e| {
                EngineError::new(
                    ErrorCode::RecipeSchemaInvalid,
                    format!("`{field}` is not a valid template: {e}"),
                )
                .with_source(e)
            })?;
        }
    }

    Ok(())
}

/// Step names must be unique within their list, and `dependsOn` must
/// point at a sibling. Applied recursively to grouping tools.
fn validate_step_list(steps: &[Step]) -> Result<()> {
    let mut seen = HashSet::new();
    for step in steps {
        if step.name.trim().is_empty() {
            return Err(EngineError::new(
                ErrorCode::RecipeSchemaInvalid,
                "step name must not be empty",
            ));
        }
        if !seen.insert(step.name.clone()) {
            return Err(EngineError::new(
                ErrorCode::DuplicateStepName,
                format!("step name `{}` is used more than once", step.name),
            ));
        }
    }

    let names: HashSet<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    for step in steps {
        for dep in &step.depends_on {
            if dep == &step.name {
                return Err(EngineError::new(
                    ErrorCode::UnknownStepReference,
                    format!("step `{}` depends on itself", step.name),
                ));
            }
            if !names.contains(dep.as_str()) {
                return Err(EngineError::new(
                    ErrorCode::UnknownStepReference,
                    format!("step `{}` depends on unknown step `{dep}`", step.name),
                )
                .with_suggestion("check the dependsOn list for typos"));
            }
        }

        match &step.action {
            ToolSpec::Sequence(spec) => validate_step_list(&spec.steps)?,
            ToolSpec::Parallel(spec) => validate_step_list(&spec.steps)?,
            ToolSpec::Conditional(spec) => {
                validate_step_list(&spec.then)?;
                if let Some(otherwise) = &spec.otherwise {
                    validate_step_list(otherwise)?;
                }
            }
            _ => {}
        }
    }

    Ok(())
}

const RECIPE_KEYS: &[&str] = &[
    "name",
    "version",
    "variables",
    "imports",
    "steps",
    "onSuccess",
    "onError",
];

const COMMON_STEP_KEYS: &[&str] = &[
    "name",
    "tool",
    "when",
    "dependsOn",
    "retries",
    "continueOnError",
    "variables",
];

fn tool_keys(tool: &str) -> Option<&'static [&'static str]> {
    Some(match tool {
        "template" => &["template"],
        "ai" => &[
            "prompt",
            "context",
            "examples",
            "system",
            "provider",
            "model",
            "temperature",
            "maxTokens",
            "guardrails",
            "output",
            "retryOnFailure",
            "onFailure",
            "fallback",
            "timeout",
        ],
        "shell" => &["command", "cwd", "env", "timeout", "captureOutput"],
        "query" => &["file", "format", "checks", "expression"],
        "patch" => &[
            "file", "content", "after", "before", "at", "atLine", "skip_if", "pattern", "replace",
        ],
        "install" => &["packages", "dev", "packageManager"],
        "ensure-dirs" => &["dirs"],
        "prompt" => &["message", "variable", "default", "choices"],
        "recipe" => &["recipe"],
        "sequence" => &["steps"],
        "parallel" => &["steps"],
        "conditional" => &["if", "then", "else"],
        _ => return None,
    })
}

/// Unknown fields are a warning, not an error.
fn scan_unknown_fields(raw: &YamlValue, diagnostics: &mut Vec<Diagnostic>) {
    let Some(root) = raw.as_mapping() else { return };
    for key in root.keys() {
        if let Some(key) = key.as_str() {
            if !RECIPE_KEYS.contains(&key) {
                diagnostics.push(warning(key, format!("unknown recipe field `{key}`")));
            }
        }
    }

    if let Some(steps) = raw.get("steps").and_then(|s| s.as_sequence()) {
        scan_step_fields(steps, diagnostics);
    }
}

fn scan_step_fields(steps: &[YamlValue], diagnostics: &mut Vec<Diagnostic>) {
    for step in steps {
        let Some(map) = step.as_mapping() else { continue };
        let name = step
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("<unnamed>");
        let Some(tool) = step.get("tool").and_then(|t| t.as_str()) else {
            continue;
        };
        let Some(specific) = tool_keys(tool) else {
            continue;
        };
        for key in map.keys() {
            if let Some(key) = key.as_str() {
                if !COMMON_STEP_KEYS.contains(&key) && !specific.contains(&key) {
                    diagnostics.push(warning(
                        key,
                        format!("step `{name}`: field `{key}` is not used by the {tool} tool"),
                    ));
                }
            }
        }

        for nested_key in ["steps", "then", "else"] {
            if let Some(nested) = step.get(nested_key).and_then(|s| s.as_sequence()) {
                scan_step_fields(nested, diagnostics);
            }
        }
    }
}

fn warning(field: &str, message: String) -> Diagnostic {
    Diagnostic {
        severity: Severity::Warning,
        field: field.to_string(),
        message,
    }
}
