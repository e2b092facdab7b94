//! AI transports: provider HTTP APIs, a configurable subprocess, or
//! stdout deferral.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AiConfig, AiMode, Provider, RetrySettings};
use crate::error::{EngineError, ErrorCode, Result};
use crate::subprocess::{CommandSpec, ProcessRunner};

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
}

#[async_trait]
pub trait AiTransport: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse>;
}

/// The transport selected for a run.
#[derive(Debug)]
pub enum Transport {
    /// Pass-1 deferral; the caller routes prompts into the collector
    /// instead of generating.
    Stdout,
    Api(ApiTransport),
    Command(CommandTransport),
}

/// Resolve the transport per the configured mode. `auto` picks `api`
/// when an API key env var is set, then `command` when one is
/// configured, then `stdout`.
pub fn resolve(
    mode: AiMode,
    config: &AiConfig,
    runner: Arc<dyn ProcessRunner>,
) -> Result<Transport> {
    match mode {
        AiMode::Stdout | AiMode::Off => Ok(Transport::Stdout),
        AiMode::Api => {
            let provider = config.provider.ok_or_else(|| {
                EngineError::new(
                    ErrorCode::AiProviderUnavailable,
                    "ai mode is `api` but no provider is configured",
                )
                .with_suggestion("set ai.provider to anthropic, openai, or google")
            })?;
            Ok(Transport::Api(ApiTransport::new(provider, config)?))
        }
        AiMode::Command => {
            let command = config.command.clone().ok_or_else(|| {
                EngineError::new(
                    ErrorCode::AiTransportFailed,
                    "ai mode is `command` but no command is configured",
                )
            })?;
            Ok(Transport::Command(CommandTransport::new(command, runner)))
        }
        AiMode::Auto => {
            let candidates = match config.provider {
                Some(provider) => vec![provider],
                None => vec![Provider::Anthropic, Provider::Openai, Provider::Google],
            };
            for provider in candidates {
                let env_var = config.api_key_env(provider);
                if std::env::var(&env_var).map(|v| !v.is_empty()).unwrap_or(false) {
                    return Ok(Transport::Api(ApiTransport::new(provider, config)?));
                }
            }
            if let Some(command) = &config.command {
                return Ok(Transport::Command(CommandTransport::new(
                    command.clone(),
                    runner,
                )));
            }
            Ok(Transport::Stdout)
        }
    }
}

/// HTTP transport over a provider's generation endpoint. Provider and
/// API key presence are validated at construction.
#[derive(Debug)]
pub struct ApiTransport {
    client: reqwest::Client,
    provider: Provider,
    api_key: String,
    retry: RetrySettings,
}

impl ApiTransport {
    pub fn new(provider: Provider, config: &AiConfig) -> Result<Self> {
        let env_var = config.api_key_env(provider);
        let api_key = std::env::var(&env_var)
            .ok()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                EngineError::new(
                    ErrorCode::AiApiKeyMissing,
                    format!("environment variable {env_var} is not set"),
                )
                .with_context("provider", format!("{provider:?}"))
                .with_suggestion(format!("export {env_var}=<key>"))
                .with_suggestion("or switch ai.mode to stdout for two-pass generation")
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| {
                EngineError::new(
                    ErrorCode::AiTransportFailed,
                    format!("failed to build HTTP client: {e}"),
                )
                .with_source(e)
            })?;

        Ok(Self {
            client,
            provider,
            api_key,
            retry: config.retry.clone(),
        })
    }

    async fn request_once(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let response = match self.provider {
            Provider::Anthropic => {
                let mut body = json!({
                    "model": request.model,
                    "max_tokens": request.max_tokens,
                    "messages": [{"role": "user", "content": request.prompt}],
                });
                if let Some(system) = &request.system {
                    body["system"] = json!(system);
                }
                if let Some(temperature) = request.temperature {
                    body["temperature"] = json!(temperature);
                }
                self.client
                    .post("https://api.anthropic.com/v1/messages")
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body)
                    .send()
                    .await
            }
            Provider::Openai => {
                let mut messages = Vec::new();
                if let Some(system) = &request.system {
                    messages.push(json!({"role": "system", "content": system}));
                }
                messages.push(json!({"role": "user", "content": request.prompt}));
                let mut body = json!({
                    "model": request.model,
                    "max_tokens": request.max_tokens,
                    "messages": messages,
                });
                if let Some(temperature) = request.temperature {
                    body["temperature"] = json!(temperature);
                }
                self.client
                    .post("https://api.openai.com/v1/chat/completions")
                    .bearer_auth(&self.api_key)
                    .json(&body)
                    .send()
                    .await
            }
            Provider::Google => {
                let mut body = json!({
                    "contents": [{"parts": [{"text": request.prompt}]}],
                });
                if let Some(system) = &request.system {
                    body["systemInstruction"] = json!({"parts": [{"text": system}]});
                }
                let url = format!(
                    "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
                    request.model, self.api_key
                );
                self.client.post(url).json(&body).send().await
            }
        };

        let response = response.map_err(|e| {
            EngineError::new(ErrorCode::AiTransportFailed, format!("request failed: {e}"))
                .with_source(e)
        })?;

        let status = response.status();
        match status {
            StatusCode::OK => {
                let payload: serde_json::Value = response.json().await.map_err(|e| {
                    EngineError::new(
                        ErrorCode::AiTransportFailed,
                        format!("failed to decode response: {e}"),
                    )
                    .with_source(e)
                })?;
                self.parse_response(&payload, &request.model)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                let mut err =
                    EngineError::new(ErrorCode::AiTransportFailed, "rate limited (HTTP 429)");
                if let Some(seconds) = retry_after {
                    err = err.with_context("retry_after_secs", seconds.to_string());
                }
                Err(err)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(EngineError::new(
                ErrorCode::AiApiKeyMissing,
                format!("provider rejected the API key (HTTP {status})"),
            )),
            _ => {
                let detail = response.text().await.unwrap_or_default();
                Err(EngineError::new(
                    ErrorCode::AiGenerationFailed,
                    format!("provider returned HTTP {status}: {detail}"),
                ))
            }
        }
    }

    fn parse_response(
        &self,
        payload: &serde_json::Value,
        model: &str,
    ) -> Result<GenerationResponse> {
        let (content, input_tokens, output_tokens) = match self.provider {
            Provider::Anthropic => (
                payload["content"][0]["text"].as_str().map(str::to_string),
                payload["usage"]["input_tokens"].as_u64(),
                payload["usage"]["output_tokens"].as_u64(),
            ),
            Provider::Openai => (
                payload["choices"][0]["message"]["content"]
                    .as_str()
                    .map(str::to_string),
                payload["usage"]["prompt_tokens"].as_u64(),
                payload["usage"]["completion_tokens"].as_u64(),
            ),
            Provider::Google => (
                payload["candidates"][0]["content"]["parts"][0]["text"]
                    .as_str()
                    .map(str::to_string),
                payload["usageMetadata"]["promptTokenCount"].as_u64(),
                payload["usageMetadata"]["candidatesTokenCount"].as_u64(),
            ),
        };

        let content = content.ok_or_else(|| {
            EngineError::new(
                ErrorCode::AiGenerationFailed,
                "provider response contained no text content",
            )
        })?;

        Ok(GenerationResponse {
            content,
            input_tokens: input_tokens.unwrap_or(0),
            output_tokens: output_tokens.unwrap_or(0),
            model: model.to_string(),
        })
    }

    fn is_retryable(err: &EngineError) -> bool {
        err.code == ErrorCode::AiTransportFailed
    }
}

#[async_trait]
impl AiTransport for ApiTransport {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let mut attempt = 0;
        loop {
            match self.request_once(request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if attempt >= self.retry.max_attempts || !Self::is_retryable(&err) {
                        return Err(err);
                    }
                    // Honor Retry-After when the provider sent one.
                    let delay = err
                        .context
                        .get("retry_after_secs")
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| {
                            Duration::from_millis(self.retry.base_delay_ms << attempt)
                        });
                    attempt += 1;
                    tracing::debug!(
                        "transport error ({}), retrying in {:?} (attempt {attempt})",
                        err.message,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Spawns a configured command, substituting `{prompt}` into arguments
/// or piping the prompt to stdin.
#[derive(Debug)]
pub struct CommandTransport {
    command: String,
    runner: Arc<dyn ProcessRunner>,
}

impl CommandTransport {
    pub fn new(command: String, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { command, runner }
    }
}

#[async_trait]
impl AiTransport for CommandTransport {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let words = shell_words::split(&self.command).map_err(|e| {
            EngineError::new(
                ErrorCode::AiTransportFailed,
                format!("invalid ai command: {e}"),
            )
        })?;
        let (program, args) = words.split_first().ok_or_else(|| {
            EngineError::new(ErrorCode::AiTransportFailed, "ai command is empty")
        })?;

        let uses_placeholder = args.iter().any(|arg| arg.contains("{prompt}"));
        let mut spec = CommandSpec::new(program).args(
            args.iter()
                .map(|arg| arg.replace("{prompt}", &request.prompt)),
        );
        if !uses_placeholder {
            spec = spec.stdin(request.prompt.clone());
        }

        let output = self.runner.run(spec).await?;
        if !output.exit.success() {
            return Err(EngineError::new(
                ErrorCode::AiTransportFailed,
                format!(
                    "ai command exited with {:?}: {}",
                    output.exit,
                    output.stderr.trim()
                ),
            ));
        }

        let output_tokens = super::cost::estimate_tokens(&output.stdout);
        Ok(GenerationResponse {
            content: output.stdout,
            input_tokens: super::cost::estimate_tokens(&request.prompt),
            output_tokens,
            model: request.model.clone(),
        })
    }
}
