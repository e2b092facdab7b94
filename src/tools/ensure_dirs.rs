//! Ensure-dirs tool: idempotent directory creation.

use async_trait::async_trait;

use super::{Tool, ToolOutput};
use crate::engine::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::recipe::{Step, ToolSpec};
use crate::template;

pub struct EnsureDirsTool;

#[async_trait]
impl Tool for EnsureDirsTool {
    fn name(&self) -> &'static str {
        "ensure-dirs"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<ToolOutput> {
        let ToolSpec::EnsureDirs(spec) = &step.action else {
            return Err(EngineError::internal("ensure-dirs tool got a wrong step"));
        };

        let mut result = ToolOutput::default();
        for dir in &spec.dirs {
            let rendered = template::render_plain(dir, &ctx.env)?;
            let path = ctx.project_path(&rendered);
            if path.is_dir() {
                continue;
            }
            if !ctx.writes_suppressed() {
                std::fs::create_dir_all(&path).map_err(EngineError::from)?;
            }
            result.files_created.push(path);
        }
        Ok(result)
    }
}
