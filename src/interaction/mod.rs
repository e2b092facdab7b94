//! User interaction for interactive variable prompts.

use async_trait::async_trait;
use std::io::Write;

use crate::error::{EngineError, ErrorCode, Result};

/// Prompting seam between the variable resolver / prompt tool and the
/// terminal. Non-interactive runs install [`NonInteractive`], which fails
/// instead of blocking on stdin.
#[async_trait]
pub trait UserInteraction: Send + Sync {
    async fn prompt_text(&self, message: &str, default: Option<&str>) -> Result<String>;

    async fn prompt_choice(&self, message: &str, choices: &[String]) -> Result<String>;

    async fn confirm(&self, message: &str, default: bool) -> Result<bool>;
}

/// Reads answers from stdin, one line per prompt.
pub struct StdioInteraction;

#[async_trait]
impl UserInteraction for StdioInteraction {
    async fn prompt_text(&self, message: &str, default: Option<&str>) -> Result<String> {
        let message = message.to_string();
        let default = default.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            match &default {
                Some(value) => print!("{message} [{value}]: "),
                None => print!("{message}: "),
            }
            std::io::stdout().flush().map_err(EngineError::from)?;

            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .map_err(EngineError::from)?;
            let answer = line.trim_end_matches(['\n', '\r']).to_string();
            if answer.is_empty() {
                if let Some(value) = default {
                    return Ok(value);
                }
            }
            Ok(answer)
        })
        .await
        .map_err(|e| EngineError::internal(format!("prompt task failed: {e}")))?
    }

    async fn prompt_choice(&self, message: &str, choices: &[String]) -> Result<String> {
        loop {
            let rendered = format!("{message} ({})", choices.join("/"));
            let answer = self.prompt_text(&rendered, None).await?;
            if choices.iter().any(|choice| choice == &answer) {
                return Ok(answer);
            }
            eprintln!("please answer one of: {}", choices.join(", "));
        }
    }

    async fn confirm(&self, message: &str, default: bool) -> Result<bool> {
        let hint = if default { "Y/n" } else { "y/N" };
        let answer = self.prompt_text(&format!("{message} [{hint}]"), None).await?;
        match answer.to_lowercase().as_str() {
            "" => Ok(default),
            "y" | "yes" => Ok(true),
            "n" | "no" => Ok(false),
            _ => Ok(default),
        }
    }
}

/// Installed for `--non-interactive` runs and CI.
pub struct NonInteractive;

fn noninteractive_error(message: &str) -> EngineError {
    EngineError::new(
        ErrorCode::PromptRequiredButNoninteractive,
        format!("prompt required but running non-interactively: {message}"),
    )
    .with_suggestion("pass the value with --var name=value")
    .with_suggestion("drop --non-interactive to answer prompts")
}

#[async_trait]
impl UserInteraction for NonInteractive {
    async fn prompt_text(&self, message: &str, default: Option<&str>) -> Result<String> {
        match default {
            Some(value) => Ok(value.to_string()),
            None => Err(noninteractive_error(message)),
        }
    }

    async fn prompt_choice(&self, message: &str, _choices: &[String]) -> Result<String> {
        Err(noninteractive_error(message))
    }

    async fn confirm(&self, _message: &str, default: bool) -> Result<bool> {
        Ok(default)
    }
}

pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Test double fed with canned answers.
    pub struct ScriptedInteraction {
        answers: Mutex<VecDeque<String>>,
    }

    impl ScriptedInteraction {
        pub fn new<I, S>(answers: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            }
        }

        fn next(&self) -> Result<String> {
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| EngineError::internal("scripted interaction ran out of answers"))
        }
    }

    #[async_trait]
    impl UserInteraction for ScriptedInteraction {
        async fn prompt_text(&self, _message: &str, default: Option<&str>) -> Result<String> {
            let answer = self.next()?;
            if answer.is_empty() {
                if let Some(value) = default {
                    return Ok(value.to_string());
                }
            }
            Ok(answer)
        }

        async fn prompt_choice(&self, _message: &str, _choices: &[String]) -> Result<String> {
            self.next()
        }

        async fn confirm(&self, _message: &str, default: bool) -> Result<bool> {
            match self.next() {
                Ok(answer) => Ok(matches!(answer.as_str(), "y" | "yes" | "true")),
                Err(_) => Ok(default),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noninteractive_uses_default_when_present() {
        let ui = NonInteractive;
        let answer = ui.prompt_text("project name", Some("demo")).await.unwrap();
        assert_eq!(answer, "demo");
    }

    #[tokio::test]
    async fn noninteractive_fails_without_default() {
        let ui = NonInteractive;
        let err = ui.prompt_text("project name", None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PromptRequiredButNoninteractive);
    }
}
