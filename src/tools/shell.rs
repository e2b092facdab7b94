//! Shell tool: run a command through the subprocess layer.

use async_trait::async_trait;
use serde_json::json;

use super::{Tool, ToolOutput};
use crate::engine::context::ExecutionContext;
use crate::error::{EngineError, ErrorCode, Result};
use crate::recipe::{Step, ToolSpec};
use crate::subprocess::{CommandSpec, ExitKind};
use crate::template;

pub struct ShellTool;

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<ToolOutput> {
        let ToolSpec::Shell(spec) = &step.action else {
            return Err(EngineError::internal("shell tool got a non-shell step"));
        };

        let command = template::render_plain(&spec.command, &ctx.env)?;
        if ctx.writes_suppressed() {
            tracing::info!("dry run: would execute `{command}`");
            return Ok(ToolOutput {
                tool_result: Some(json!({"skipped": "dry_run", "command": command})),
                ..Default::default()
            });
        }

        let cwd = match &spec.cwd {
            Some(cwd) => ctx.project_path(&template::render_plain(cwd, &ctx.env)?),
            None => ctx.options.project_root.clone(),
        };

        let mut request = CommandSpec::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(cwd)
            .timeout(spec.timeout);
        for (key, value) in &spec.env {
            request
                .env
                .insert(key.clone(), template::render_plain(value, &ctx.env)?);
        }

        let output = ctx.runner.run(request).await?;
        match output.exit {
            ExitKind::TimedOut => Err(EngineError::new(
                ErrorCode::ShellTimeout,
                format!("`{command}` timed out"),
            )
            .with_context("timeout", format!("{:?}", spec.timeout))),
            ExitKind::Success => Ok(ToolOutput {
                output: spec.capture_output.then(|| {
                    json!({
                        "stdout": output.stdout,
                        "stderr": output.stderr,
                        "exitCode": 0,
                    })
                }),
                ..Default::default()
            }),
            ExitKind::Code(code) => Err(EngineError::new(
                ErrorCode::ShellNonzeroExit,
                format!("`{command}` exited with code {code}"),
            )
            .with_context("exit_code", code.to_string())
            .with_context("stderr", output.stderr.trim().to_string())),
            ExitKind::Signal(signal) => Err(EngineError::new(
                ErrorCode::ShellNonzeroExit,
                format!("`{command}` was killed by signal {signal}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::ShellStep;
    use crate::testing::test_context_in;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn shell_step(command: &str) -> Step {
        Step {
            name: "sh".to_string(),
            when: None,
            depends_on: vec![],
            retries: 0,
            continue_on_error: false,
            variables: BTreeMap::new(),
            action: ToolSpec::Shell(ShellStep {
                command: command.to_string(),
                cwd: None,
                env: BTreeMap::new(),
                timeout: None,
                capture_output: true,
            }),
        }
    }

    #[tokio::test]
    async fn captures_interpolated_command_output() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context_in(dir.path(), json!({"greeting": "hello"}));
        let output = ShellTool
            .execute(&shell_step("echo {{ greeting }}"), &ctx)
            .await
            .unwrap();
        let captured = output.output.unwrap();
        assert_eq!(captured["stdout"].as_str().unwrap().trim(), "hello");
        assert_eq!(captured["exitCode"], json!(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context_in(dir.path(), json!({}));
        let err = ShellTool
            .execute(&shell_step("exit 7"), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ShellNonzeroExit);
        assert_eq!(err.context.get("exit_code").map(String::as_str), Some("7"));
    }

    #[tokio::test]
    async fn timeout_maps_to_shell_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context_in(dir.path(), json!({}));
        let mut step = shell_step("sleep 5");
        if let ToolSpec::Shell(spec) = &mut step.action {
            spec.timeout = Some(Duration::from_millis(50));
        }
        let err = ShellTool.execute(&step, &ctx).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ShellTimeout);
    }

    #[tokio::test]
    async fn dry_run_skips_execution() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context_in(dir.path(), json!({}));
        ctx.options.dry_run = true;
        let output = ShellTool
            .execute(&shell_step("touch should-not-exist"), &ctx)
            .await
            .unwrap();
        assert!(!dir.path().join("should-not-exist").exists());
        assert_eq!(output.tool_result.unwrap()["skipped"], json!("dry_run"));
    }

    #[tokio::test]
    async fn runs_in_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context_in(dir.path(), json!({}));
        ShellTool
            .execute(&shell_step("pwd > here.txt"), &ctx)
            .await
            .unwrap();
        let recorded = std::fs::read_to_string(dir.path().join("here.txt")).unwrap();
        let recorded = std::path::PathBuf::from(recorded.trim()).canonicalize().unwrap();
        assert_eq!(recorded, dir.path().canonicalize().unwrap());
    }
}
