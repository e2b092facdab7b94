//! Patch tool: anchor insertion or regex substitution on an existing
//! file, without rendering a template body.

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use super::{inject, Tool, ToolOutput};
use crate::engine::context::ExecutionContext;
use crate::error::{EngineError, ErrorCode, Result};
use crate::recipe::{Step, ToolSpec};
use crate::template;

pub struct PatchTool;

#[async_trait]
impl Tool for PatchTool {
    fn name(&self) -> &'static str {
        "patch"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<ToolOutput> {
        let ToolSpec::Patch(spec) = &step.action else {
            return Err(EngineError::internal("patch tool got a non-patch step"));
        };

        let file = template::render_plain(&spec.file, &ctx.env)?;
        let path = ctx.project_path(&file);
        let existing = std::fs::read_to_string(&path).map_err(|e| {
            EngineError::new(
                ErrorCode::PatchFailed,
                format!("patch target `{file}` cannot be read"),
            )
            .with_context("resolved_path", path.display().to_string())
            .with_source(e)
        })?;

        let patched = if let (Some(pattern), Some(replace)) = (&spec.pattern, &spec.replace) {
            let re = Regex::new(pattern).map_err(|e| {
                EngineError::new(
                    ErrorCode::PatchFailed,
                    format!("invalid pattern /{pattern}/: {e}"),
                )
            })?;
            if !re.is_match(&existing) {
                return Err(EngineError::new(
                    ErrorCode::PatchFailed,
                    format!("pattern /{pattern}/ matched nothing in `{file}`"),
                ));
            }
            let replace = template::render_plain(replace, &ctx.env)?;
            Some(re.replace_all(&existing, replace.as_str()).into_owned())
        } else if let Some(content) = &spec.content {
            match inject::inject(&existing, content, &spec.anchor, spec.skip_if.as_deref())
                .map_err(|e| match e.code {
                    // Anchor semantics mirror template injection but
                    // surface under the patch domain.
                    ErrorCode::InjectAnchorNotFound => e,
                    _ => EngineError::new(ErrorCode::PatchFailed, e.message.clone()),
                })? {
                inject::InjectOutcome::Skipped => None,
                inject::InjectOutcome::Injected(content) => Some(content),
            }
        } else {
            return Err(EngineError::new(
                ErrorCode::PatchFailed,
                "patch step needs either pattern+replace or content with an anchor",
            ));
        };

        let mut result = ToolOutput::default();
        match patched {
            None => {
                result.tool_result = Some(json!({"skipped": "skip_if"}));
            }
            Some(content) => {
                if !ctx.writes_suppressed() {
                    std::fs::write(&path, content).map_err(EngineError::from)?;
                }
                result.files_modified.push(path);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{AnchorSpec, PatchStep};
    use crate::testing::{test_context_in, write_file};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn patch_step(spec: PatchStep) -> Step {
        Step {
            name: "patch".to_string(),
            when: None,
            depends_on: vec![],
            retries: 0,
            continue_on_error: false,
            variables: BTreeMap::new(),
            action: ToolSpec::Patch(spec),
        }
    }

    #[tokio::test]
    async fn regex_substitution_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "version.ts", "export const VERSION = '0.1.0';\n");
        let ctx = test_context_in(dir.path(), json!({"next": "0.2.0"}));

        PatchTool
            .execute(
                &patch_step(PatchStep {
                    file: "version.ts".to_string(),
                    content: None,
                    anchor: AnchorSpec::default(),
                    skip_if: None,
                    pattern: Some(r"'\d+\.\d+\.\d+'".to_string()),
                    replace: Some("'{{ next }}'".to_string()),
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("version.ts")).unwrap(),
            "export const VERSION = '0.2.0';\n"
        );
    }

    #[tokio::test]
    async fn anchor_insertion_mirrors_inject() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "list.txt", "alpha\nomega\n");
        let ctx = test_context_in(dir.path(), json!({}));

        PatchTool
            .execute(
                &patch_step(PatchStep {
                    file: "list.txt".to_string(),
                    content: Some("middle".to_string()),
                    anchor: AnchorSpec {
                        after: Some("^alpha$".to_string()),
                        ..Default::default()
                    },
                    skip_if: None,
                    pattern: None,
                    replace: None,
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("list.txt")).unwrap(),
            "alpha\nmiddle\nomega\n"
        );
    }

    #[tokio::test]
    async fn missing_anchor_keeps_inject_code() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "list.txt", "alpha\n");
        let ctx = test_context_in(dir.path(), json!({}));

        let err = PatchTool
            .execute(
                &patch_step(PatchStep {
                    file: "list.txt".to_string(),
                    content: Some("x".to_string()),
                    anchor: AnchorSpec {
                        after: Some("^EXPORTS$".to_string()),
                        ..Default::default()
                    },
                    skip_if: None,
                    pattern: None,
                    replace: None,
                }),
                &ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InjectAnchorNotFound);
    }

    #[tokio::test]
    async fn unmatched_pattern_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.txt", "nothing\n");
        let ctx = test_context_in(dir.path(), json!({}));

        let err = PatchTool
            .execute(
                &patch_step(PatchStep {
                    file: "a.txt".to_string(),
                    content: None,
                    anchor: AnchorSpec::default(),
                    skip_if: None,
                    pattern: Some("^MISSING$".to_string()),
                    replace: Some("x".to_string()),
                }),
                &ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PatchFailed);
    }

    #[tokio::test]
    async fn skip_if_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.txt", "already patched\n");
        let ctx = test_context_in(dir.path(), json!({}));

        let output = PatchTool
            .execute(
                &patch_step(PatchStep {
                    file: "a.txt".to_string(),
                    content: Some("already patched".to_string()),
                    anchor: AnchorSpec {
                        at: Some(crate::recipe::AtPosition::End),
                        ..Default::default()
                    },
                    skip_if: Some("already patched".to_string()),
                    pattern: None,
                    replace: None,
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert!(output.files_modified.is_empty());
        assert_eq!(output.tool_result, Some(json!({"skipped": "skip_if"})));
    }
}
