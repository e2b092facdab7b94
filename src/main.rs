use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use hypergen::config::{AiMode, ExecutionOptions};
use hypergen::engine::RecipeEngine;
use hypergen::error::EngineError;
use hypergen::{load_recipe_file, AiConfig};

#[derive(Parser)]
#[command(name = "hypergen", version, about = "Recipe-driven code generation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a recipe against the current project.
    Run {
        /// Path to the recipe file.
        recipe: PathBuf,
        /// Variable inputs as name=value pairs.
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
        /// Answers file for Pass-2 AI resolution.
        #[arg(long)]
        answers: Option<PathBuf>,
        /// AI mode override: api, command, stdout, off, auto.
        #[arg(long = "ai-mode")]
        ai_mode: Option<String>,
        /// Project root to generate into.
        #[arg(long, default_value = ".")]
        project_root: PathBuf,
        /// Log intended changes without writing.
        #[arg(long)]
        dry_run: bool,
        /// Overwrite existing files.
        #[arg(long)]
        force: bool,
        /// Fail instead of prompting for missing variables.
        #[arg(long)]
        non_interactive: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            recipe,
            vars,
            answers,
            ai_mode,
            project_root,
            dry_run,
            force,
            non_interactive,
        } => {
            match run(
                recipe,
                vars,
                answers,
                ai_mode,
                project_root,
                dry_run,
                force,
                non_interactive,
            )
            .await
            {
                Ok(code) => code,
                Err(error) => {
                    if std::env::var("DEBUG").is_ok() {
                        eprintln!("{}", error.developer_message());
                    } else {
                        eprintln!("{}", error.user_message());
                    }
                    ExitCode::from(1)
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    recipe_path: PathBuf,
    vars: Vec<String>,
    answers: Option<PathBuf>,
    ai_mode: Option<String>,
    project_root: PathBuf,
    dry_run: bool,
    force: bool,
    non_interactive: bool,
) -> Result<ExitCode, EngineError> {
    let loaded = load_recipe_file(&recipe_path)?;
    for diagnostic in &loaded.diagnostics {
        tracing::warn!("{}", diagnostic.message);
    }

    let mut options = ExecutionOptions::new(project_root).template_root(loaded.dir.clone());
    options.dry_run = dry_run;
    options.force = options.force || force;
    options.non_interactive = non_interactive;
    options.ai_mode = ai_mode.as_deref().map(parse_ai_mode).transpose()?;
    options.invocation = Some(format!("hypergen run {}", recipe_path.display()));

    if let Some(path) = answers {
        let raw = std::fs::read_to_string(&path).map_err(EngineError::from)?;
        let parsed: BTreeMap<String, String> = serde_json::from_str(&raw).map_err(|e| {
            EngineError::new(
                hypergen::ErrorCode::RecipeSchemaInvalid,
                format!("answers file is not a JSON string map: {e}"),
            )
        })?;
        options.answers = Some(parsed);
    }

    let mut inputs = BTreeMap::new();
    for pair in vars {
        let Some((name, value)) = pair.split_once('=') else {
            return Err(EngineError::new(
                hypergen::ErrorCode::VariableValidationFailed,
                format!("--var `{pair}` is not in name=value form"),
            ));
        };
        inputs.insert(
            name.to_string(),
            serde_json::Value::String(value.to_string()),
        );
    }

    let engine = RecipeEngine::new(AiConfig::default());
    // SIGINT aborts the current batch; in-flight tools are cancelled at
    // their next suspension point, with no mid-step rollback.
    let result = tokio::select! {
        result = engine.execute_two_pass(&loaded.recipe, options, &inputs) => result?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            return Ok(ExitCode::from(1));
        }
    };

    if let Some(prompt) = &result.deferred_prompt {
        // Pass-1 deferral: stdout carries only the prompt document.
        print!("{prompt}");
        return Ok(ExitCode::from(2));
    }

    if result.success {
        tracing::info!(
            "recipe `{}` completed: {} created, {} modified in {}ms",
            loaded.recipe.name,
            result.files_created.len(),
            result.files_modified.len(),
            result.duration_ms
        );
        Ok(ExitCode::from(0))
    } else {
        if let Some(failed) = result
            .step_results
            .iter()
            .rev()
            .find(|r| r.error.is_some())
        {
            let error = failed.error.as_ref().expect("checked above");
            eprintln!("step `{}` failed - {}: {}", failed.step_name, error.code, error.message);
        }
        Ok(ExitCode::from(1))
    }
}

fn parse_ai_mode(raw: &str) -> Result<AiMode, EngineError> {
    match raw {
        "api" => Ok(AiMode::Api),
        "command" => Ok(AiMode::Command),
        "stdout" => Ok(AiMode::Stdout),
        "off" => Ok(AiMode::Off),
        "auto" => Ok(AiMode::Auto),
        other => Err(EngineError::new(
            hypergen::ErrorCode::RecipeSchemaInvalid,
            format!("unknown ai mode `{other}`"),
        )),
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let default = if std::env::var("DEBUG").is_ok() {
        "hypergen=debug"
    } else {
        "hypergen=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(std::env::var("NO_COLOR").is_err())
        .with_writer(std::io::stderr)
        .init();
}
