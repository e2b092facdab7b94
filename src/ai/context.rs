//! Context bundle assembly for ai steps.
//!
//! Gathers globbed project files, explicit includes, a small project
//! config subset, and prior step outputs into one markdown bundle,
//! bounded by an approximate token budget.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::cost::estimate_tokens;
use crate::error::{EngineError, ErrorCode, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    #[default]
    Truncate,
    Summarize,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextSpec {
    /// Glob patterns resolved against the project root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    /// Explicit file paths, included verbatim.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    /// Include name/version/dependency keys of `package.json` when
    /// present.
    #[serde(default, rename = "projectConfig")]
    pub project_config: bool,
    /// Names of prior steps whose outputs are included.
    #[serde(default, rename = "stepOutputs", skip_serializing_if = "Vec::is_empty")]
    pub step_outputs: Vec<String>,
    #[serde(default, rename = "maxContextTokens", skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<u64>,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

/// Build the `## Context` bundle text. Returns an empty string when the
/// spec selects nothing.
pub fn gather(
    spec: &ContextSpec,
    project_root: &Path,
    step_outputs: &serde_json::Map<String, serde_json::Value>,
) -> Result<String> {
    let mut sections: Vec<(String, String)> = Vec::new();

    for pattern in &spec.files {
        let absolute = project_root.join(pattern);
        let pattern_str = absolute.to_string_lossy().to_string();
        let paths = glob::glob(&pattern_str).map_err(|e| {
            EngineError::new(
                ErrorCode::AiGenerationFailed,
                format!("invalid context glob `{pattern}`: {e}"),
            )
        })?;
        for path in paths.flatten() {
            if path.is_file() {
                push_file_section(&mut sections, project_root, &path)?;
            }
        }
    }

    for include in &spec.include {
        let path = project_root.join(include);
        if path.is_dir() {
            for entry in walkdir::WalkDir::new(&path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if entry.file_type().is_file() {
                    push_file_section(&mut sections, project_root, entry.path())?;
                }
            }
        } else if path.is_file() {
            push_file_section(&mut sections, project_root, &path)?;
        } else {
            return Err(EngineError::new(
                ErrorCode::AiGenerationFailed,
                format!("context include `{include}` does not exist"),
            ));
        }
    }

    if spec.project_config {
        if let Some(section) = project_config_section(project_root) {
            sections.push(("project configuration".to_string(), section));
        }
    }

    for step in &spec.step_outputs {
        if let Some(value) = step_outputs.get(step) {
            let rendered = serde_json::to_string_pretty(value)
                .unwrap_or_else(|_| value.to_string());
            sections.push((format!("output of step `{step}`"), rendered));
        }
    }

    if sections.is_empty() {
        return Ok(String::new());
    }

    let mut bundle = String::new();
    for (title, body) in &sections {
        bundle.push_str(&format!("### {title}\n\n```\n{}\n```\n\n", body.trim_end()));
    }

    if let Some(budget) = spec.max_context_tokens {
        let used = estimate_tokens(&bundle);
        if used > budget {
            bundle = match spec.overflow {
                OverflowPolicy::Error => {
                    return Err(EngineError::new(
                        ErrorCode::AiGenerationFailed,
                        format!("context bundle is ~{used} tokens, over the {budget} budget"),
                    )
                    .with_suggestion("narrow the context globs")
                    .with_suggestion("raise maxContextTokens or set overflow: truncate"));
                }
                OverflowPolicy::Truncate => truncate_to_budget(&bundle, budget),
                // Without a model call available here, summarize keeps
                // the head and tail of the bundle.
                OverflowPolicy::Summarize => {
                    let half = budget / 2;
                    let head = truncate_to_budget(&bundle, half);
                    let tail_chars = (half * 4) as usize;
                    let tail: String = bundle
                        .chars()
                        .skip(bundle.chars().count().saturating_sub(tail_chars))
                        .collect();
                    format!("{head}\n\n[... context elided ...]\n\n{tail}")
                }
            };
        }
    }

    Ok(bundle)
}

fn push_file_section(
    sections: &mut Vec<(String, String)>,
    project_root: &Path,
    path: &Path,
) -> Result<()> {
    let content = std::fs::read_to_string(path).map_err(EngineError::from)?;
    let label = path
        .strip_prefix(project_root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string();
    sections.push((label, content));
    Ok(())
}

fn project_config_section(project_root: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(project_root.join("package.json")).ok()?;
    let parsed: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let mut subset = serde_json::Map::new();
    for key in ["name", "version", "type", "dependencies", "devDependencies"] {
        if let Some(value) = parsed.get(key) {
            subset.insert(key.to_string(), value.clone());
        }
    }
    serde_json::to_string_pretty(&serde_json::Value::Object(subset)).ok()
}

fn truncate_to_budget(text: &str, budget_tokens: u64) -> String {
    let max_chars = (budget_tokens * 4) as usize;
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str("\n[... truncated ...]");
    truncated
}
