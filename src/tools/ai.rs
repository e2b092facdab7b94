//! AI tool: ask a model for text and route the answer.
//!
//! Pipeline: gather context, build the system prompt, build the user
//! prompt, generate, then validate with retry-on-feedback. In `stdout`
//! mode the step defers into the collector instead (Pass 1) and resolves
//! from the answers map in Pass 2.

use async_trait::async_trait;
use serde_json::json;

use super::{inject, Tool, ToolOutput};
use crate::ai::transport::{self, AiTransport, GenerationRequest, Transport};
use crate::ai::{context as ai_context, validation};
use crate::config::Provider;
use crate::engine::context::ExecutionContext;
use crate::error::{EngineError, ErrorCode, Result};
use crate::recipe::{AiFailureAction, AiStep, OutputSpec, Step, ToolSpec};
use crate::template;

pub struct AiTool;

#[async_trait]
impl Tool for AiTool {
    fn name(&self) -> &'static str {
        "ai"
    }

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<ToolOutput> {
        let ToolSpec::Ai(spec) = &step.action else {
            return Err(EngineError::internal("ai tool got a non-ai step"));
        };

        // Pass-2: a supplied answer short-circuits generation entirely.
        if let Some(answers) = &ctx.options.answers {
            if let Some(answer) = answers.get(&step.name) {
                return route_output(answer.clone(), spec, ctx);
            }
        }

        let user_prompt = build_user_prompt(spec, ctx)?;

        let mode = ctx.options.ai_mode.unwrap_or(ctx.ai.mode);
        let transport = transport::resolve(mode, &ctx.ai, ctx.runner.clone())?;

        let transport: Box<dyn AiTransport> = match transport {
            Transport::Stdout => {
                // Pass-1 deferral: the step contributes a prompt entry
                // and produces no output this run.
                let mut collector = ctx
                    .collector
                    .lock()
                    .map_err(|_| EngineError::internal("ai collector lock poisoned"))?;
                collector.register_ai_block(
                    &step.name,
                    user_prompt,
                    output_description(&spec.output),
                    spec.examples.iter().map(|e| e.output.clone()).collect(),
                );
                return Ok(ToolOutput {
                    tool_result: Some(json!({"deferred": true})),
                    ..Default::default()
                });
            }
            Transport::Api(api) => Box::new(api),
            Transport::Command(command) => Box::new(command),
        };

        let system_prompt = build_system_prompt(spec, ctx);
        let model = spec
            .model
            .clone()
            .or_else(|| ctx.ai.model.clone())
            .unwrap_or_else(|| default_model(spec, ctx));

        let guardrails = spec.guardrails.clone().unwrap_or_default();
        let mut prompt = user_prompt.clone();
        let mut attempts = 0u32;
        let answer = loop {
            ctx.cost
                .lock()
                .map_err(|_| EngineError::internal("cost tracker lock poisoned"))?
                .check_budget()?;

            let request = GenerationRequest {
                system: system_prompt.clone(),
                prompt: prompt.clone(),
                model: model.clone(),
                temperature: spec.temperature,
                max_tokens: spec.max_tokens.unwrap_or(4096),
            };
            let response = match spec.timeout {
                Some(limit) => tokio::time::timeout(limit, transport.generate(&request))
                    .await
                    .map_err(|_| {
                        EngineError::new(
                            ErrorCode::AiGenerationFailed,
                            format!("generation timed out after {limit:?}"),
                        )
                    })??,
                None => transport.generate(&request).await?,
            };

            ctx.cost
                .lock()
                .map_err(|_| EngineError::internal("cost tracker lock poisoned"))?
                .record(
                    &step.name,
                    &response.model,
                    response.input_tokens,
                    response.output_tokens,
                    attempts,
                );

            let errors = validation::validate(&response.content, &guardrails);
            if errors.is_empty() {
                break response.content;
            }

            if attempts < spec.retry_on_failure {
                attempts += 1;
                tracing::debug!(
                    "ai step `{}` failed validation ({} errors), retrying",
                    step.name,
                    errors.len()
                );
                prompt = format!(
                    "{user_prompt}{}",
                    validation::retry_feedback(&response.content, &errors)
                );
                continue;
            }

            match spec.on_failure {
                AiFailureAction::Fallback => {
                    let fallback = spec
                        .fallback
                        .clone()
                        .or_else(|| spec.examples.first().map(|e| e.output.clone()));
                    match fallback {
                        Some(fallback) => break fallback,
                        None => {
                            return Err(generation_failed(&step.name, &errors)
                                .with_suggestion("set `fallback` or an example output"));
                        }
                    }
                }
                AiFailureAction::Error | AiFailureAction::Retry => {
                    return Err(generation_failed(&step.name, &errors));
                }
            }
        };

        route_output(answer, spec, ctx)
    }
}

fn generation_failed(step_name: &str, errors: &[String]) -> EngineError {
    let mut err = EngineError::new(
        ErrorCode::AiGenerationFailed,
        format!("ai step `{step_name}` output failed validation"),
    );
    for (index, error) in errors.iter().enumerate() {
        err = err.with_context(format!("violation_{index}"), error.clone());
    }
    err
}

fn default_model(spec: &AiStep, ctx: &ExecutionContext) -> String {
    let provider = spec
        .provider
        .as_deref()
        .and_then(Provider::parse)
        .or(ctx.ai.provider)
        .unwrap_or(Provider::Anthropic);
    provider.default_model().to_string()
}

fn build_system_prompt(spec: &AiStep, ctx: &ExecutionContext) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(global) = &ctx.ai.system {
        parts.push(global.clone());
    }
    if let Some(system) = &spec.system {
        parts.push(system.clone());
    }
    if let Some(guardrails) = &spec.guardrails {
        for rule in &guardrails.rules {
            parts.push(format!("Rule: {rule}"));
        }
    }
    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

/// `## Context` → `## Examples` → `## Task`, suppressing empty sections.
fn build_user_prompt(spec: &AiStep, ctx: &ExecutionContext) -> Result<String> {
    let task = template::render_plain(&spec.prompt, &ctx.env)?;
    let mut prompt = String::new();

    if let Some(context_spec) = &spec.context {
        let bundle = ai_context::gather(
            context_spec,
            &ctx.options.project_root,
            ctx.env.step_outputs(),
        )?;
        if !bundle.is_empty() {
            prompt.push_str("## Context\n\n");
            prompt.push_str(&bundle);
            prompt.push('\n');
        }
    }

    if !spec.examples.is_empty() {
        prompt.push_str("## Examples\n\n");
        for example in &spec.examples {
            prompt.push_str(&format!(
                "Input:\n```\n{}\n```\nOutput:\n```\n{}\n```\n\n",
                example.input.trim_end(),
                example.output.trim_end()
            ));
        }
    }

    prompt.push_str("## Task\n\n");
    prompt.push_str(&task);
    Ok(prompt)
}

fn output_description(output: &OutputSpec) -> Option<String> {
    match output {
        OutputSpec::Variable { variable } => {
            Some(format!("Text bound to the `{variable}` variable."))
        }
        OutputSpec::File { to } => Some(format!("Full contents of the file `{to}`.")),
        OutputSpec::Inject { into, .. } => {
            Some(format!("A fragment injected into `{into}`."))
        }
        OutputSpec::Stdout => None,
    }
}

fn route_output(answer: String, spec: &AiStep, ctx: &ExecutionContext) -> Result<ToolOutput> {
    let mut result = ToolOutput::default();
    match &spec.output {
        OutputSpec::Variable { variable } => {
            let mut bound = serde_json::Map::new();
            bound.insert(variable.clone(), json!(answer));
            result.provided.insert(variable.clone(), json!(answer));
            result.output = Some(serde_json::Value::Object(bound));
        }
        OutputSpec::File { to } => {
            let to = template::render_plain(to, &ctx.env)?;
            let target = ctx.project_path(&to);
            let existed = target.exists();
            if !ctx.writes_suppressed() {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(EngineError::from)?;
                }
                std::fs::write(&target, &answer).map_err(EngineError::from)?;
            }
            if existed {
                result.files_modified.push(target);
            } else {
                result.files_created.push(target);
            }
            result.output = Some(json!({"text": answer}));
        }
        OutputSpec::Inject { into, anchor } => {
            let target = ctx.project_path(into);
            let existing = std::fs::read_to_string(&target).map_err(|e| {
                EngineError::new(
                    ErrorCode::IoError,
                    format!("inject target `{into}` cannot be read"),
                )
                .with_source(e)
            })?;
            if let inject::InjectOutcome::Injected(content) =
                inject::inject(&existing, &answer, anchor, None)?
            {
                if !ctx.writes_suppressed() {
                    std::fs::write(&target, content).map_err(EngineError::from)?;
                }
                result.files_modified.push(target);
            }
            result.output = Some(json!({"text": answer}));
        }
        OutputSpec::Stdout => {
            println!("{answer}");
            result.output = Some(json!({"text": answer}));
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AiMode;
    use crate::recipe::AiExample;
    use crate::testing::{test_context_in, write_file};
    use std::collections::BTreeMap;

    fn ai_step(spec: AiStep) -> Step {
        Step {
            name: "gen".to_string(),
            when: None,
            depends_on: vec![],
            retries: 0,
            continue_on_error: false,
            variables: BTreeMap::new(),
            action: ToolSpec::Ai(spec),
        }
    }

    fn variable_spec() -> AiStep {
        AiStep {
            prompt: "Describe {{ name }}".to_string(),
            context: None,
            examples: vec![],
            system: None,
            provider: None,
            model: None,
            temperature: None,
            max_tokens: None,
            guardrails: None,
            output: OutputSpec::Variable {
                variable: "description".to_string(),
            },
            retry_on_failure: 0,
            on_failure: AiFailureAction::Error,
            fallback: None,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn stdout_mode_defers_into_collector() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context_in(dir.path(), json!({"name": "the API"}));
        ctx.options.ai_mode = Some(AiMode::Stdout);

        let output = AiTool
            .execute(&ai_step(variable_spec()), &ctx)
            .await
            .unwrap();
        assert_eq!(output.tool_result.unwrap()["deferred"], json!(true));

        let collector = ctx.collector.lock().unwrap();
        assert_eq!(collector.entries().len(), 1);
        assert_eq!(collector.entries()[0].key, "gen");
        assert!(collector.entries()[0].prompt.contains("Describe the API"));
    }

    #[tokio::test]
    async fn answers_short_circuit_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context_in(dir.path(), json!({}));
        ctx.options.ai_mode = Some(AiMode::Stdout);
        ctx.options.answers = Some(
            [("gen".to_string(), "the answer".to_string())]
                .into_iter()
                .collect(),
        );

        let output = AiTool
            .execute(&ai_step(variable_spec()), &ctx)
            .await
            .unwrap();
        assert_eq!(output.provided.get("description"), Some(&json!("the answer")));
    }

    #[tokio::test]
    async fn command_transport_routes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context_in(dir.path(), json!({}));
        ctx.options.ai_mode = Some(AiMode::Command);
        ctx.ai.command = Some("printf generated".to_string());

        let mut spec = variable_spec();
        spec.output = OutputSpec::File {
            to: "out/gen.txt".to_string(),
        };
        let output = AiTool.execute(&ai_step(spec), &ctx).await.unwrap();
        assert_eq!(output.files_created.len(), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/gen.txt")).unwrap(),
            "generated"
        );
    }

    #[tokio::test]
    async fn validation_failure_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context_in(dir.path(), json!({}));
        ctx.options.ai_mode = Some(AiMode::Command);
        ctx.ai.command = Some("printf {nope".to_string());

        let mut spec = variable_spec();
        spec.guardrails = Some(crate::ai::validation::GuardrailConfig {
            syntax: Some(crate::ai::validation::SyntaxKind::Json),
            ..Default::default()
        });
        spec.on_failure = AiFailureAction::Fallback;
        spec.examples = vec![AiExample {
            input: "x".to_string(),
            output: "{}".to_string(),
        }];

        let output = AiTool.execute(&ai_step(spec), &ctx).await.unwrap();
        assert_eq!(output.provided.get("description"), Some(&json!("{}")));
    }

    #[tokio::test]
    async fn validation_failure_errors_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context_in(dir.path(), json!({}));
        ctx.options.ai_mode = Some(AiMode::Command);
        ctx.ai.command = Some("printf {nope".to_string());

        let mut spec = variable_spec();
        spec.guardrails = Some(crate::ai::validation::GuardrailConfig {
            syntax: Some(crate::ai::validation::SyntaxKind::Json),
            ..Default::default()
        });
        let err = AiTool.execute(&ai_step(spec), &ctx).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AiGenerationFailed);
    }

    #[tokio::test]
    async fn examples_render_into_user_prompt() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "src/a.ts", "const a = 1;");
        let ctx = test_context_in(dir.path(), json!({"name": "x"}));
        let mut spec = variable_spec();
        spec.examples = vec![AiExample {
            input: "in".to_string(),
            output: "out".to_string(),
        }];
        spec.context = Some(crate::ai::context::ContextSpec {
            files: vec!["src/*.ts".to_string()],
            ..Default::default()
        });

        let prompt = build_user_prompt(&spec, &ctx).unwrap();
        let context_at = prompt.find("## Context").unwrap();
        let examples_at = prompt.find("## Examples").unwrap();
        let task_at = prompt.find("## Task").unwrap();
        assert!(context_at < examples_at && examples_at < task_at);
        assert!(prompt.contains("const a = 1;"));
    }
}
