//! Grouping tools: recipe, sequence, parallel, and conditional steps.
//!
//! These re-enter the step executor for their children. Nested results
//! are flattened under the parent step's name as `<parent>/<child>`.

use futures::future::FutureExt;
use serde_json::json;
use std::collections::BTreeMap;

use super::context::{ExecutionContext, StepResult, StepStatus};
use super::step::{self, StepExecution};
use super::RecipeEngine;
use crate::error::{EngineError, Result};
use crate::recipe::{loader, Step, ToolSpec};
use crate::tools::ToolOutput;

pub(crate) async fn run_group(
    engine: &RecipeEngine,
    step: &Step,
    ctx: &ExecutionContext,
) -> (Result<ToolOutput>, Vec<StepResult>) {
    let (outcome, mut nested) = match &step.action {
        ToolSpec::Sequence(spec) => run_inline(engine, &spec.steps, ctx, true).await,
        ToolSpec::Parallel(spec) => run_inline(engine, &spec.steps, ctx, false).await,
        ToolSpec::Conditional(spec) => {
            match ctx.evaluate_condition(&spec.condition) {
                Ok(true) => run_inline(engine, &spec.then, ctx, true).await,
                Ok(false) => match &spec.otherwise {
                    Some(otherwise) => run_inline(engine, otherwise, ctx, true).await,
                    None => (
                        Ok(ToolOutput {
                            tool_result: Some(json!({"branch": "none"})),
                            ..Default::default()
                        }),
                        vec![],
                    ),
                },
                Err(error) => (Err(error), vec![]),
            }
        }
        ToolSpec::Recipe(spec) => run_sub_recipe(engine, &spec.recipe, ctx).await,
        _ => (
            Err(EngineError::internal("run_group got a leaf tool")),
            vec![],
        ),
    };

    for result in &mut nested {
        result.step_name = format!("{}/{}", step.name, result.step_name);
    }
    (outcome, nested)
}

/// Run inline sub-steps. Sequential children observe earlier children's
/// outputs; parallel children each get an immutable snapshot.
async fn run_inline(
    engine: &RecipeEngine,
    steps: &[Step],
    ctx: &ExecutionContext,
    sequential: bool,
) -> (Result<ToolOutput>, Vec<StepResult>) {
    let mut nested: Vec<StepResult> = Vec::new();
    let mut aggregate = ToolOutput::default();
    let mut failure: Option<EngineError> = None;

    if sequential {
        let mut env = ctx.env.clone();
        for child in steps {
            let mut child_ctx = ctx.clone();
            child_ctx.env = env.clone();
            child_ctx.step_name = child.name.clone();
            // Boxing erases the future type; the executor and the
            // grouping tools are mutually recursive.
            let execution = step::execute_step(engine, child, child_ctx).boxed().await;
            env.record_step(&child.name, execution.result.summary());
            for (key, value) in &execution.provided {
                env.bind(key.clone(), value.clone());
            }
            let stop = commit_child(&mut aggregate, &mut nested, &mut failure, child, execution);
            if stop {
                break;
            }
        }
    } else {
        let futures = steps.iter().map(|child| {
            let mut child_ctx = ctx.clone();
            child_ctx.step_name = child.name.clone();
            step::execute_step(engine, child, child_ctx).boxed()
        });
        for (child, execution) in steps.iter().zip(futures::future::join_all(futures).await) {
            commit_child(&mut aggregate, &mut nested, &mut failure, child, execution);
        }
    }

    match failure {
        Some(error) => (Err(error), nested),
        None => {
            aggregate.tool_result = Some(json!({"steps": nested.len()}));
            (Ok(aggregate), nested)
        }
    }
}

/// Fold one child execution into the aggregate. Returns true when a
/// sequential group must stop.
fn commit_child(
    aggregate: &mut ToolOutput,
    nested: &mut Vec<StepResult>,
    failure: &mut Option<EngineError>,
    child: &Step,
    execution: StepExecution,
) -> bool {
    aggregate
        .files_created
        .extend(execution.result.files_created.clone());
    aggregate
        .files_modified
        .extend(execution.result.files_modified.clone());
    for (key, value) in execution.provided {
        aggregate.provided.insert(key, value);
    }

    let failed = execution.result.status == StepStatus::Failed;
    let error = execution.result.error.clone();
    nested.push(execution.result);
    nested.extend(execution.nested);

    if failed && !child.continue_on_error && failure.is_none() {
        let error = error.expect("failed step carries an error");
        *failure = Some(EngineError::new(error.code, error.message));
        return true;
    }
    false
}

async fn run_sub_recipe(
    engine: &RecipeEngine,
    recipe_path: &str,
    ctx: &ExecutionContext,
) -> (Result<ToolOutput>, Vec<StepResult>) {
    let path = ctx.template_path(recipe_path);
    let loaded = match loader::load_recipe_file(&path) {
        Ok(loaded) => loaded,
        Err(error) => return (Err(error), vec![]),
    };
    for diagnostic in &loaded.diagnostics {
        tracing::warn!("{}", diagnostic.message);
    }

    // Parent variables (including step-local overrides) act as the
    // caller inputs of the sub-recipe.
    let inputs: BTreeMap<String, serde_json::Value> = ctx.env.flat_variables();
    let bound = match crate::recipe::variables::bind_variables(
        &loaded.recipe.variables,
        &inputs,
        &*ctx.interaction,
        ctx.options.non_interactive,
    )
    .await
    {
        Ok(bound) => bound,
        Err(error) => return (Err(error), vec![]),
    };

    let mut sub_ctx = ctx.clone();
    sub_ctx.recipe_name = loaded.recipe.name.clone();
    sub_ctx.recipe_version = loaded.recipe.version.clone();
    sub_ctx.env = super::context::VariableEnvironment::new(
        &loaded.recipe.name,
        loaded.recipe.version.as_deref(),
        bound,
    );
    sub_ctx.options.template_root = loaded.dir.clone();

    let graph = match engine
        .run_graph(&loaded.recipe.steps, sub_ctx)
        .boxed()
        .await
    {
        Ok(graph) => graph,
        Err(error) => return (Err(error), vec![]),
    };

    let output = ToolOutput {
        output: Some(json!({"success": !graph.aborted})),
        files_created: graph.files_created,
        files_modified: graph.files_modified,
        ..Default::default()
    };
    if graph.aborted {
        let error = graph
            .results
            .iter()
            .rev()
            .find_map(|r| r.error.clone())
            .map(|e| EngineError::new(e.code, e.message))
            .unwrap_or_else(|| EngineError::internal("sub-recipe aborted without an error"));
        return (Err(error), graph.results);
    }
    (Ok(output), graph.results)
}
