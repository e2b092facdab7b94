//! Template tool: render a template file into the project, either
//! creating the target or injecting into an existing file.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{inject, Tool, ToolOutput};
use crate::engine::context::ExecutionContext;
use crate::error::{EngineError, ErrorCode, Result};
use crate::recipe::{Step, ToolSpec};
use crate::template::{self, frontmatter};

pub struct TemplateTool;

#[async_trait]
impl Tool for TemplateTool {
    fn name(&self) -> &'static str {
        "template"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<ToolOutput> {
        let ToolSpec::Template(spec) = &step.action else {
            return Err(EngineError::internal("template tool got a non-template step"));
        };

        let template_path = ctx.template_path(spec.template.path());
        let raw = std::fs::read_to_string(&template_path).map_err(|e| {
            EngineError::new(
                ErrorCode::TemplateNotFound,
                format!("template `{}` not found", spec.template.path()),
            )
            .with_context("resolved_path", template_path.display().to_string())
            .with_source(e)
        })?;

        // Template-ref variables layer over the step environment for
        // this render only.
        let mut ctx = ctx.clone();
        if let Some(variables) = spec.template.variables() {
            ctx.env.merge_overrides(variables);
        }

        let file = frontmatter::split(&raw);
        let rendered_frontmatter = template::render_plain(&file.frontmatter_raw, &ctx.env)?;
        let fm = frontmatter::parse(&rendered_frontmatter)?;
        fm.validate()?;

        if let Some(condition) = &fm.condition {
            if !ctx.evaluate_condition(condition)? {
                tracing::debug!("template `{}` condition is false, skipping", step.name);
                return Ok(ToolOutput {
                    tool_result: Some(json!({"skipped": "condition"})),
                    ..Default::default()
                });
            }
        }

        // Rendering drives @ai collection; in collect mode that is the
        // whole job and nothing is written.
        let outcome = template::render_body(&file.body, &ctx)?;
        if ctx.options.collect_mode {
            return Ok(ToolOutput {
                output: provided_output(&outcome.provided),
                provided: outcome.provided,
                ..Default::default()
            });
        }

        let to = fm.to.clone().ok_or_else(|| {
            EngineError::new(
                ErrorCode::TemplateRenderFailed,
                format!("template `{}` has no `to:` in its frontmatter", spec.template.path()),
            )
        })?;
        let target = ctx.project_path(&to);

        let mut result = ToolOutput {
            output: provided_output(&outcome.provided),
            provided: outcome.provided.clone(),
            ..Default::default()
        };

        if fm.inject {
            let existing = std::fs::read_to_string(&target).map_err(|e| {
                EngineError::new(
                    ErrorCode::IoError,
                    format!("inject target `{to}` cannot be read"),
                )
                .with_context("resolved_path", target.display().to_string())
                .with_source(e)
            })?;
            match inject::inject(
                &existing,
                &outcome.text,
                &fm.anchor,
                fm.skip_if.as_deref(),
            )? {
                inject::InjectOutcome::Skipped => {
                    result.tool_result = Some(json!({"skipped": "skip_if"}));
                }
                inject::InjectOutcome::Injected(content) => {
                    if !ctx.options.dry_run {
                        std::fs::write(&target, content).map_err(EngineError::from)?;
                    }
                    result.files_modified.push(target);
                }
            }
        } else {
            let exists = target.exists();
            if exists && fm.unless_exists {
                tracing::debug!("target `{to}` exists, skipping (unless_exists)");
                result.tool_result = Some(json!({"skipped": "unless_exists"}));
                return Ok(result);
            }
            if exists && !ctx.options.force {
                return Err(EngineError::new(
                    ErrorCode::TargetExists,
                    format!("target `{to}` already exists"),
                )
                .with_suggestion("pass --force (or HYPERGEN_OVERWRITE=1) to overwrite")
                .with_suggestion("set unless_exists: true to skip existing targets"));
            }
            if !ctx.options.dry_run {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(EngineError::from)?;
                }
                std::fs::write(&target, &outcome.text).map_err(EngineError::from)?;
            }
            if exists {
                result.files_modified.push(target);
            } else {
                result.files_created.push(target);
            }
        }

        Ok(result)
    }
}

fn provided_output(provided: &std::collections::BTreeMap<String, Value>) -> Option<Value> {
    if provided.is_empty() {
        None
    } else {
        Some(Value::Object(provided.clone().into_iter().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context_in, write_file};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn template_step(path: &str) -> Step {
        Step {
            name: "tpl".to_string(),
            when: None,
            depends_on: vec![],
            retries: 0,
            continue_on_error: false,
            variables: BTreeMap::new(),
            action: ToolSpec::Template(crate::recipe::TemplateStep {
                template: crate::recipe::TemplateRef::Path(path.to_string()),
            }),
        }
    }

    #[tokio::test]
    async fn creates_file_with_parents() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "hello.t",
            "---\nto: out/hello.txt\n---\nHi {{ name }}\n",
        );
        let ctx = test_context_in(dir.path(), json!({"name": "World"}));

        let output = TemplateTool
            .execute(&template_step("hello.t"), &ctx)
            .await
            .unwrap();

        let written = std::fs::read_to_string(dir.path().join("out/hello.txt")).unwrap();
        assert_eq!(written, "Hi World\n");
        assert_eq!(output.files_created.len(), 1);
        assert!(output.files_modified.is_empty());
    }

    #[tokio::test]
    async fn missing_template_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context_in(dir.path(), json!({}));
        let err = TemplateTool
            .execute(&template_step("absent.t"), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TemplateNotFound);
    }

    #[tokio::test]
    async fn existing_target_fails_without_force() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "hello.t", "---\nto: hello.txt\n---\nnew\n");
        write_file(dir.path(), "hello.txt", "old\n");
        let ctx = test_context_in(dir.path(), json!({}));

        let err = TemplateTool
            .execute(&template_step("hello.t"), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TargetExists);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hello.txt")).unwrap(),
            "old\n"
        );
    }

    #[tokio::test]
    async fn unless_exists_skips_and_preserves_bytes() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "hello.t",
            "---\nto: hello.txt\nunless_exists: true\n---\nv{{ n }}\n",
        );
        let ctx = test_context_in(dir.path(), json!({"n": 1}));

        TemplateTool
            .execute(&template_step("hello.t"), &ctx)
            .await
            .unwrap();
        let first = std::fs::read(dir.path().join("hello.txt")).unwrap();

        let ctx2 = test_context_in(dir.path(), json!({"n": 2}));
        let output = TemplateTool
            .execute(&template_step("hello.t"), &ctx2)
            .await
            .unwrap();
        let second = std::fs::read(dir.path().join("hello.txt")).unwrap();

        assert_eq!(first, second);
        assert_eq!(output.tool_result, Some(json!({"skipped": "unless_exists"})));
    }

    #[tokio::test]
    async fn force_overwrites_and_reports_modified() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "hello.t", "---\nto: hello.txt\n---\nnew\n");
        write_file(dir.path(), "hello.txt", "old\n");
        let mut ctx = test_context_in(dir.path(), json!({}));
        ctx.options.force = true;

        let output = TemplateTool
            .execute(&template_step("hello.t"), &ctx)
            .await
            .unwrap();
        assert_eq!(output.files_modified.len(), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hello.txt")).unwrap(),
            "new\n"
        );
    }

    #[tokio::test]
    async fn injects_after_anchor() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "add.t",
            "---\nto: index.ts\ninject: true\nafter: \"^// EXPORTS$\"\n---\nexport * from './new';\n",
        );
        write_file(dir.path(), "index.ts", "// EXPORTS\nexport * from './old';\n");
        let ctx = test_context_in(dir.path(), json!({}));

        let output = TemplateTool
            .execute(&template_step("add.t"), &ctx)
            .await
            .unwrap();
        assert_eq!(output.files_modified.len(), 1);
        let content = std::fs::read_to_string(dir.path().join("index.ts")).unwrap();
        assert_eq!(
            content,
            "// EXPORTS\nexport * from './new';\nexport * from './old';\n"
        );
    }

    #[tokio::test]
    async fn inject_missing_anchor_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "add.t",
            "---\nto: index.ts\ninject: true\nafter: \"^EXPORTS$\"\n---\nline\n",
        );
        write_file(dir.path(), "index.ts", "nothing here\n");
        let ctx = test_context_in(dir.path(), json!({}));

        let err = TemplateTool
            .execute(&template_step("add.t"), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InjectAnchorNotFound);
    }

    #[tokio::test]
    async fn collect_mode_renders_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "gen.t",
            "---\nto: out.ts\n---\n@ai(key=handler)@prompt()Write X@end@end\n",
        );
        let mut ctx = test_context_in(dir.path(), json!({}));
        ctx.options.collect_mode = true;

        TemplateTool
            .execute(&template_step("gen.t"), &ctx)
            .await
            .unwrap();
        assert!(!dir.path().join("out.ts").exists());
        assert!(ctx.collector.lock().unwrap().has_entries());
    }

    #[tokio::test]
    async fn frontmatter_interpolates_variables() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "mod.t",
            "---\nto: \"src/{{ module }}.ts\"\n---\n// {{ module }}\n",
        );
        let ctx = test_context_in(dir.path(), json!({"module": "users"}));

        TemplateTool
            .execute(&template_step("mod.t"), &ctx)
            .await
            .unwrap();
        assert!(dir.path().join("src/users.ts").exists());
    }

    #[tokio::test]
    async fn condition_false_skips() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "opt.t",
            "---\nto: opt.txt\ncondition: \"${enabled}\"\n---\nbody\n",
        );
        let ctx = test_context_in(dir.path(), json!({"enabled": false}));

        let output = TemplateTool
            .execute(&template_step("opt.t"), &ctx)
            .await
            .unwrap();
        assert!(!dir.path().join("opt.txt").exists());
        assert_eq!(output.tool_result, Some(json!({"skipped": "condition"})));
    }

    #[tokio::test]
    async fn provide_flows_into_output() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "p.t",
            "---\nto: p.txt\n---\n{{ provide(key=\"port\", value=8080) }}done\n",
        );
        let ctx = test_context_in(dir.path(), json!({}));

        let output = TemplateTool
            .execute(&template_step("p.t"), &ctx)
            .await
            .unwrap();
        assert_eq!(output.provided.get("port"), Some(&json!(8080)));
        assert_eq!(output.output, Some(json!({"port": 8080})));
    }
}
