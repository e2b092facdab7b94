//! Recipe engine: dependency graph construction, batched execution, and
//! the two-pass AI entry point.

use petgraph::graph::{DiGraph, NodeIndex};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::ai::{assembler, AiCollector, AssembleOptions, CostTracker};
use crate::config::{AiConfig, ExecutionOptions};
use crate::error::{EngineError, ErrorCode, Result};
use crate::interaction::{NonInteractive, StdioInteraction, UserInteraction};
use crate::recipe::{Recipe, Step};
use crate::subprocess::{ProcessRunner, TokioProcessRunner};
use crate::template;
use crate::tools::ToolRegistry;

pub mod context;
pub mod expression;
pub mod flow;
pub mod step;

pub use context::{
    ExecutionContext, RunResult, StepResult, StepStatus, VariableEnvironment,
};

pub struct RecipeEngine {
    registry: ToolRegistry,
    runner: Arc<dyn ProcessRunner>,
    ai: AiConfig,
}

impl RecipeEngine {
    pub fn new(ai: AiConfig) -> Self {
        Self {
            registry: ToolRegistry::standard(),
            runner: Arc::new(TokioProcessRunner),
            ai,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub(crate) fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Two-pass entry point.
    ///
    /// With answers supplied this is Pass 2: a normal run with answers
    /// substituted. Without answers, when the AI transport resolves to
    /// stdout, templates are first rendered in collect mode; if any
    /// `@ai` blocks surface, the run defers with the assembled prompt
    /// document instead of writing files.
    pub async fn execute_two_pass(
        &self,
        recipe: &Recipe,
        options: ExecutionOptions,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<RunResult> {
        if options.answers.is_some() {
            return self.execute(recipe, options, inputs).await;
        }

        let mode = options.ai_mode.unwrap_or(self.ai.mode);
        let defers = matches!(
            crate::ai::transport::resolve(mode, &self.ai, self.runner.clone())?,
            crate::ai::Transport::Stdout
        );
        if defers {
            let mut collect_options = options.clone();
            collect_options.collect_mode = true;
            let pass1 = self.execute(recipe, collect_options, inputs).await?;
            if pass1.deferred_prompt.is_some() {
                return Ok(pass1);
            }
            // Nothing to ask; replay for real.
        }
        self.execute(recipe, options, inputs).await
    }

    /// Run a recipe once with the given options.
    ///
    /// Recipe and variable validation failures return `Err` before any
    /// step executes; step failures produce `Ok` with `success: false`.
    pub async fn execute(
        &self,
        recipe: &Recipe,
        options: ExecutionOptions,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<RunResult> {
        let started = std::time::Instant::now();

        let interaction: Arc<dyn UserInteraction> = if options.non_interactive {
            Arc::new(NonInteractive)
        } else {
            Arc::new(StdioInteraction)
        };

        let bound = crate::recipe::bind_variables(
            &recipe.variables,
            inputs,
            &*interaction,
            options.non_interactive,
        )
        .await?;

        let collector = Arc::new(Mutex::new(AiCollector::new()));
        collector
            .lock()
            .expect("collector lock")
            .set_collect_mode(options.collect_mode);
        let cost = Arc::new(Mutex::new(CostTracker::new(
            self.ai.pricing.clone(),
            self.ai.budget.clone(),
        )));

        let proto = ExecutionContext {
            recipe_name: recipe.name.clone(),
            recipe_version: recipe.version.clone(),
            step_name: String::new(),
            env: VariableEnvironment::new(&recipe.name, recipe.version.as_deref(), bound),
            options: options.clone(),
            ai: self.ai.clone(),
            step_results: Arc::new(BTreeMap::new()),
            collector: Arc::clone(&collector),
            cost: Arc::clone(&cost),
            runner: Arc::clone(&self.runner),
            interaction,
        };

        let graph = self.run_graph(&recipe.steps, proto.clone()).await?;
        let success = !graph.aborted;

        let deferred_prompt = if options.collect_mode {
            let collector = collector.lock().expect("collector lock");
            collector.has_entries().then(|| {
                assembler::assemble(
                    &collector,
                    &AssembleOptions {
                        original_command: options
                            .invocation
                            .clone()
                            .unwrap_or_else(|| format!("hypergen run {}", recipe.name)),
                        ..Default::default()
                    },
                )
            })
        } else {
            None
        };

        let cost_report = {
            let cost = cost.lock().expect("cost lock");
            let report = cost.report();
            (!report.steps.is_empty()).then(|| report.clone())
        };

        let result = RunResult {
            success,
            step_results: graph.results,
            files_created: graph.files_created,
            files_modified: graph.files_modified,
            duration_ms: started.elapsed().as_millis() as u64,
            cost_report,
            deferred_prompt,
        };

        // Completion messages are the final observable action; never on
        // the Pass-1 stdout path, and rendering failures never change
        // the run status.
        if result.deferred_prompt.is_none() {
            let message = if success {
                recipe.on_success.as_ref()
            } else {
                recipe.on_error.as_ref()
            };
            if let Some(message) = message {
                match render_completion(message, &graph.env, &result) {
                    Ok(rendered) => println!("{rendered}"),
                    Err(error) => {
                        tracing::debug!("completion message failed to render: {error}")
                    }
                }
            }
        }

        Ok(result)
    }

    /// Execute a step list as a DAG: topological batches, each batch
    /// joined before the next starts.
    ///
    /// Boxed explicitly (rather than a plain `async fn`) because this
    /// function and `flow::run_group` are mutually recursive through
    /// sub-recipes; without an explicit trait-object boundary the
    /// compiler cannot prove the resulting future is `Send`.
    pub(crate) fn run_graph<'a>(
        &'a self,
        steps: &'a [Step],
        mut proto: ExecutionContext,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<GraphRun>> + Send + 'a>> {
        Box::pin(async move {
        let batches = compute_batches(steps, &proto.options.template_root)?;

        let mut results: Vec<StepResult> = Vec::new();
        let mut results_map: BTreeMap<String, StepResult> = BTreeMap::new();
        let mut files_created = Vec::new();
        let mut files_modified = Vec::new();
        let mut aborted = false;

        'batches: for batch in batches {
            let snapshot = Arc::new(results_map.clone());
            let futures: Vec<_> = batch
                .iter()
                .map(|&index| {
                    let step = &steps[index];
                    let mut ctx = proto.clone();
                    ctx.step_name = step.name.clone();
                    ctx.step_results = Arc::clone(&snapshot);
                    step::execute_step(self, step, ctx)
                })
                .collect();
            let executions = futures::future::join_all(futures).await;

            let mut batch_failed = false;
            for (&index, execution) in batch.iter().zip(executions) {
                let step = &steps[index];
                proto
                    .env
                    .record_step(&step.name, execution.result.summary());
                for (key, value) in &execution.provided {
                    proto.env.bind(key.clone(), value.clone());
                }
                files_created.extend(execution.result.files_created.clone());
                files_modified.extend(execution.result.files_modified.clone());
                for nested in &execution.nested {
                    files_created.extend(nested.files_created.clone());
                    files_modified.extend(nested.files_modified.clone());
                }

                if execution.result.status == StepStatus::Failed && !step.continue_on_error {
                    batch_failed = true;
                }
                results_map.insert(step.name.clone(), execution.result.clone());
                results.push(execution.result);
                results.extend(execution.nested);
            }

            if batch_failed {
                aborted = true;
                break 'batches;
            }
        }

        // Grouping tools aggregate their children's files, so the same
        // path can arrive twice; report each once, in first-seen order.
        Ok(GraphRun {
            results,
            env: proto.env,
            files_created: dedupe_paths(files_created),
            files_modified: dedupe_paths(files_modified),
            aborted,
        })
        })
    }
}

fn dedupe_paths(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::new();
    paths
        .into_iter()
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

pub(crate) struct GraphRun {
    pub results: Vec<StepResult>,
    pub env: VariableEnvironment,
    pub files_created: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub aborted: bool,
}

fn render_completion(
    message: &str,
    env: &VariableEnvironment,
    result: &RunResult,
) -> Result<String> {
    let mut env = env.clone();
    env.bind(
        "result",
        serde_json::json!({
            "success": result.success,
            "filesCreated": result.files_created,
            "filesModified": result.files_modified,
            "durationMs": result.duration_ms,
        }),
    );
    template::render_plain(message, &env)
}

/// Kahn-style layering over explicit `dependsOn` edges plus implicit
/// edges from `steps.<name>` references to earlier steps.
fn compute_batches(steps: &[Step], template_root: &std::path::Path) -> Result<Vec<Vec<usize>>> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..steps.len()).map(|i| graph.add_node(i)).collect();
    let index_of: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let Some(&j) = index_of.get(dep.as_str()) else {
                return Err(EngineError::new(
                    ErrorCode::UnknownStepReference,
                    format!("step `{}` depends on unknown step `{dep}`", step.name),
                ));
            };
            graph.update_edge(nodes[j], nodes[i], ());
        }
        for referenced in referenced_steps(step, template_root) {
            if let Some(&j) = index_of.get(referenced.as_str()) {
                // Output references only order against earlier steps;
                // forward references are left to explicit dependsOn.
                if j < i {
                    graph.update_edge(nodes[j], nodes[i], ());
                }
            }
        }
    }

    if petgraph::algo::toposort(&graph, None).is_err() {
        return Err(EngineError::new(
            ErrorCode::DependencyCycle,
            "step dependencies form a cycle",
        )
        .with_suggestion("check dependsOn entries for mutual references"));
    }

    let mut indegree: Vec<usize> = nodes
        .iter()
        .map(|&n| {
            graph
                .neighbors_directed(n, petgraph::Direction::Incoming)
                .count()
        })
        .collect();
    let mut remaining: Vec<bool> = vec![true; steps.len()];
    let mut batches = Vec::new();

    while remaining.iter().any(|&r| r) {
        let batch: Vec<usize> = (0..steps.len())
            .filter(|&i| remaining[i] && indegree[i] == 0)
            .collect();
        debug_assert!(!batch.is_empty(), "toposort guaranteed acyclicity");
        for &i in &batch {
            remaining[i] = false;
            for neighbor in graph.neighbors_directed(nodes[i], petgraph::Direction::Outgoing) {
                indegree[graph[neighbor]] -= 1;
            }
        }
        batches.push(batch);
    }

    Ok(batches)
}

/// Step names mentioned as `steps.<name>` anywhere in the step's
/// templated fields. Template steps are scanned through their template
/// file as well, where output references usually live.
fn referenced_steps(step: &Step, template_root: &std::path::Path) -> Vec<String> {
    static PATTERN: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
        Regex::new(r"steps\.([A-Za-z0-9_/-]+)").expect("static pattern")
    });
    let mut haystack = serde_json::to_string(&step.action).unwrap_or_default();
    if let Some(when) = &step.when {
        haystack.push_str(when);
    }
    for value in step.variables.values() {
        haystack.push_str(&value.to_string());
    }
    if let crate::recipe::ToolSpec::Template(spec) = &step.action {
        if let Ok(body) = std::fs::read_to_string(template_root.join(spec.template.path())) {
            haystack.push_str(&body);
        }
    }
    PATTERN
        .captures_iter(&haystack)
        .map(|cap| cap[1].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{ShellStep, ToolSpec};

    fn shell(name: &str, command: &str, depends_on: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            when: None,
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
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

    #[test]
    fn independent_steps_share_a_batch() {
        let steps = vec![
            shell("a", "echo a", &[]),
            shell("b", "echo b", &[]),
            shell("c", "echo c", &["a", "b"]),
        ];
        let batches = compute_batches(&steps, std::path::Path::new(".")).unwrap();
        assert_eq!(batches, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn output_reference_creates_implicit_edge() {
        let steps = vec![
            shell("probe", "cat package.json", &[]),
            shell("use", "echo {{ steps.probe.output.stdout }}", &[]),
        ];
        let batches = compute_batches(&steps, std::path::Path::new(".")).unwrap();
        assert_eq!(batches, vec![vec![0], vec![1]]);
    }

    #[test]
    fn unreferenced_steps_stay_parallel() {
        let steps = vec![shell("a", "echo a", &[]), shell("b", "echo b", &[])];
        let batches = compute_batches(&steps, std::path::Path::new(".")).unwrap();
        assert_eq!(batches, vec![vec![0, 1]]);
    }

    #[test]
    fn dependency_cycles_are_detected() {
        let steps = vec![shell("a", "echo", &["b"]), shell("b", "echo", &["a"])];
        let err = compute_batches(&steps, std::path::Path::new(".")).unwrap_err();
        assert_eq!(err.code, ErrorCode::DependencyCycle);
    }

    #[test]
    fn chains_form_one_step_batches() {
        let steps = vec![
            shell("a", "echo", &[]),
            shell("b", "echo", &["a"]),
            shell("c", "echo", &["b"]),
        ];
        let batches = compute_batches(&steps, std::path::Path::new(".")).unwrap();
        assert_eq!(batches.len(), 3);
    }
}
