//! Prompt tool: ask the user and bind the answer to a variable.

use async_trait::async_trait;
use serde_json::Value;

use super::{Tool, ToolOutput};
use crate::engine::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::recipe::{Step, ToolSpec};
use crate::template;

pub struct PromptTool;

#[async_trait]
impl Tool for PromptTool {
    fn name(&self) -> &'static str {
        "prompt"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<ToolOutput> {
        let ToolSpec::Prompt(spec) = &step.action else {
            return Err(EngineError::internal("prompt tool got a non-prompt step"));
        };

        let message = template::render_plain(&spec.message, &ctx.env)?;
        let answer = if spec.choices.is_empty() {
            ctx.interaction
                .prompt_text(&message, spec.default.as_deref())
                .await?
        } else {
            ctx.interaction.prompt_choice(&message, &spec.choices).await?
        };

        let mut bound = serde_json::Map::new();
        bound.insert(spec.variable.clone(), Value::String(answer.clone()));
        let mut result = ToolOutput::with_output(Value::Object(bound));
        result
            .provided
            .insert(spec.variable.clone(), Value::String(answer));
        Ok(result)
    }
}
