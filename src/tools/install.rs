//! Install tool: run the project's package manager.
//!
//! The manager is detected from the lockfile present in the project
//! root; `bun` is the default when no lockfile exists.

use async_trait::async_trait;
use serde_json::json;
use std::path::Path;

use super::{Tool, ToolOutput};
use crate::engine::context::ExecutionContext;
use crate::error::{EngineError, ErrorCode, Result};
use crate::recipe::{Step, ToolSpec};
use crate::subprocess::CommandSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Bun,
    Pnpm,
    Yarn,
    Npm,
}

impl PackageManager {
    pub fn detect(project_root: &Path) -> Self {
        if project_root.join("bun.lock").exists() || project_root.join("bun.lockb").exists() {
            PackageManager::Bun
        } else if project_root.join("pnpm-lock.yaml").exists() {
            PackageManager::Pnpm
        } else if project_root.join("yarn.lock").exists() {
            PackageManager::Yarn
        } else if project_root.join("package-lock.json").exists() {
            PackageManager::Npm
        } else {
            PackageManager::Bun
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "bun" => Some(PackageManager::Bun),
            "pnpm" => Some(PackageManager::Pnpm),
            "yarn" => Some(PackageManager::Yarn),
            "npm" => Some(PackageManager::Npm),
            _ => None,
        }
    }

    pub fn program(&self) -> &'static str {
        match self {
            PackageManager::Bun => "bun",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
            PackageManager::Npm => "npm",
        }
    }

    /// Arguments for installing `packages`, or a bare install when the
    /// list is empty.
    pub fn install_args(&self, packages: &[String], dev: bool) -> Vec<String> {
        if packages.is_empty() {
            return vec!["install".to_string()];
        }
        let mut args = match self {
            PackageManager::Npm => vec!["install".to_string()],
            _ => vec!["add".to_string()],
        };
        if dev {
            args.push(
                match self {
                    PackageManager::Bun => "-d",
                    PackageManager::Npm => "--save-dev",
                    _ => "-D",
                }
                .to_string(),
            );
        }
        args.extend(packages.iter().cloned());
        args
    }
}

pub struct InstallTool;

#[async_trait]
impl Tool for InstallTool {
    fn name(&self) -> &'static str {
        "install"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<ToolOutput> {
        let ToolSpec::Install(spec) = &step.action else {
            return Err(EngineError::internal("install tool got a non-install step"));
        };

        let manager = match &spec.package_manager {
            Some(name) => PackageManager::parse(name).ok_or_else(|| {
                EngineError::new(
                    ErrorCode::InstallFailed,
                    format!("unknown package manager `{name}`"),
                )
            })?,
            None => PackageManager::detect(&ctx.options.project_root),
        };
        let args = manager.install_args(&spec.packages, spec.dev);

        if ctx.writes_suppressed() {
            tracing::info!(
                "dry run: would execute `{} {}`",
                manager.program(),
                args.join(" ")
            );
            return Ok(ToolOutput {
                tool_result: Some(json!({
                    "skipped": "dry_run",
                    "packageManager": manager.program(),
                })),
                ..Default::default()
            });
        }

        let output = ctx
            .runner
            .run(
                CommandSpec::new(manager.program())
                    .args(args.clone())
                    .current_dir(ctx.options.project_root.clone()),
            )
            .await?;

        if !output.exit.success() {
            return Err(EngineError::new(
                ErrorCode::InstallFailed,
                format!(
                    "`{} {}` failed: {}",
                    manager.program(),
                    args.join(" "),
                    output.stderr.trim()
                ),
            ));
        }

        Ok(ToolOutput {
            output: Some(json!({
                "packageManager": manager.program(),
                "packages": spec.packages,
            })),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::write_file;

    #[test]
    fn detects_manager_from_lockfile() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PackageManager::detect(dir.path()), PackageManager::Bun);

        write_file(dir.path(), "package-lock.json", "{}");
        assert_eq!(PackageManager::detect(dir.path()), PackageManager::Npm);

        write_file(dir.path(), "yarn.lock", "");
        assert_eq!(PackageManager::detect(dir.path()), PackageManager::Yarn);

        write_file(dir.path(), "pnpm-lock.yaml", "");
        assert_eq!(PackageManager::detect(dir.path()), PackageManager::Pnpm);

        write_file(dir.path(), "bun.lock", "");
        assert_eq!(PackageManager::detect(dir.path()), PackageManager::Bun);
    }

    #[test]
    fn install_args_per_manager() {
        let packages = vec!["zod".to_string()];
        assert_eq!(
            PackageManager::Bun.install_args(&packages, false),
            vec!["add", "zod"]
        );
        assert_eq!(
            PackageManager::Bun.install_args(&packages, true),
            vec!["add", "-d", "zod"]
        );
        assert_eq!(
            PackageManager::Npm.install_args(&packages, true),
            vec!["install", "--save-dev", "zod"]
        );
        assert_eq!(
            PackageManager::Pnpm.install_args(&[], false),
            vec!["install"]
        );
    }
}
