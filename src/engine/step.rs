//! Step execution: `when` gating, tool dispatch, and retry with
//! exponential backoff.

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use super::context::{ExecutionContext, StepError, StepResult, StepStatus};
use super::flow;
use super::RecipeEngine;
use crate::error::{EngineError, Result};
use crate::recipe::Step;
use crate::template;
use crate::tools::ToolOutput;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// A step's own result plus the flattened results of any nested steps
/// it ran (grouping tools), already namespaced `<parent>/<child>`.
#[derive(Debug)]
pub struct StepExecution {
    pub result: StepResult,
    pub nested: Vec<StepResult>,
    pub provided: BTreeMap<String, Value>,
}

/// Boxed explicitly (rather than a plain `async fn`) because this
/// function and `flow::run_group` are mutually recursive for grouping
/// tools (sequence/parallel/conditional/recipe); without an explicit
/// trait-object boundary the compiler cannot prove the resulting
/// future is `Send`.
pub(crate) fn execute_step<'a>(
    engine: &'a RecipeEngine,
    step: &'a Step,
    ctx: ExecutionContext,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = StepExecution> + Send + 'a>> {
    Box::pin(execute_step_inner(engine, step, ctx))
}

async fn execute_step_inner(
    engine: &RecipeEngine,
    step: &Step,
    mut ctx: ExecutionContext,
) -> StepExecution {
    let start_time = Utc::now();
    let started = std::time::Instant::now();

    let finish = |status: StepStatus,
                  output: Option<ToolOutput>,
                  error: Option<&EngineError>,
                  nested: Vec<StepResult>,
                  retry_count: u32,
                  elapsed: Duration| {
        let output = output.unwrap_or_default();
        StepExecution {
            result: StepResult {
                step_name: step.name.clone(),
                tool_type: step.action.tool_name().to_string(),
                status,
                start_time,
                end_time: Utc::now(),
                duration_ms: elapsed.as_millis() as u64,
                output: output.output.clone(),
                tool_result: output.tool_result.clone(),
                files_created: output.files_created.clone(),
                files_modified: output.files_modified.clone(),
                error: error.map(|e| StepError {
                    code: e.code,
                    message: e.message.clone(),
                }),
                retry_count,
            },
            nested,
            provided: output.provided,
        }
    };

    // `when` gates the step before anything else, including before its
    // dependencies' failures are considered.
    if let Some(when) = &step.when {
        match ctx.evaluate_condition(when) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("step `{}` skipped: when is false", step.name);
                return finish(StepStatus::Skipped, None, None, vec![], 0, started.elapsed());
            }
            Err(error) => {
                return finish(
                    StepStatus::Failed,
                    None,
                    Some(&error),
                    vec![],
                    0,
                    started.elapsed(),
                );
            }
        }
    }

    if let Err(error) = merge_step_variables(step, &mut ctx) {
        return finish(
            StepStatus::Failed,
            None,
            Some(&error),
            vec![],
            0,
            started.elapsed(),
        );
    }

    let mut attempt = 0u32;
    loop {
        tracing::debug!("running step `{}` ({})", step.name, step.action.tool_name());
        let (outcome, nested) = dispatch(engine, step, &ctx).await;

        match outcome {
            Ok(output) => {
                tracing::debug!(
                    "step `{}` completed in {:?} (retries: {attempt})",
                    step.name,
                    started.elapsed()
                );
                return finish(
                    StepStatus::Completed,
                    Some(output),
                    None,
                    nested,
                    attempt,
                    started.elapsed(),
                );
            }
            Err(error) => {
                if attempt < step.retries {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        "step `{}` failed ({}), retry {}/{} in {delay:?}",
                        step.name,
                        error.message,
                        attempt + 1,
                        step.retries
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    continue;
                }
                tracing::warn!("step `{}` failed: {}", step.name, error);
                return finish(
                    StepStatus::Failed,
                    None,
                    Some(&error),
                    nested,
                    attempt,
                    started.elapsed(),
                );
            }
        }
    }
}

/// Base 100ms, doubling, capped at 30s.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(16);
    (RETRY_BASE_DELAY * factor as u32).min(RETRY_MAX_DELAY)
}

fn merge_step_variables(step: &Step, ctx: &mut ExecutionContext) -> Result<()> {
    if step.variables.is_empty() {
        return Ok(());
    }
    let mut rendered = BTreeMap::new();
    for (key, value) in &step.variables {
        let value = match value {
            Value::String(text) => {
                Value::String(template::render_plain(text, &ctx.env)?)
            }
            other => other.clone(),
        };
        rendered.insert(key.clone(), value);
    }
    ctx.env.merge_overrides(&rendered);
    Ok(())
}

async fn dispatch(
    engine: &RecipeEngine,
    step: &Step,
    ctx: &ExecutionContext,
) -> (Result<ToolOutput>, Vec<StepResult>) {
    if step.action.is_grouping() {
        return flow::run_group(engine, step, ctx).await;
    }
    let tool = match engine.registry().get(step.action.tool_name()) {
        Ok(tool) => tool,
        Err(error) => return (Err(error), vec![]),
    };
    (tool.execute(step, ctx).await, vec![])
}
