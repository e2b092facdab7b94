//! Engine error system.
//!
//! Every failure surfaced by the engine carries a stable [`ErrorCode`], a
//! user-readable message, an optional context map, and suggested next
//! actions. Tool implementations convert lower-level failures into
//! [`EngineError`] at the tool boundary; the step executor never sees raw
//! I/O or HTTP errors.

use std::collections::BTreeMap;
use std::fmt;

/// Stable error codes, grouped by domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Configuration
    RecipeParseError,
    RecipeSchemaInvalid,
    CompositionCycle,
    DuplicateStepName,
    UnknownStepReference,
    UnknownTool,
    DependencyCycle,
    // Variables
    VariableValidationFailed,
    MissingRequiredVariable,
    PromptRequiredButNoninteractive,
    // Template
    TemplateNotFound,
    TemplateRenderFailed,
    InjectAnchorNotFound,
    TargetExists,
    // Shell / install / query / patch
    ShellNonzeroExit,
    ShellTimeout,
    InstallFailed,
    QueryFailed,
    PatchFailed,
    // AI
    AiProviderUnavailable,
    AiApiKeyMissing,
    AiGenerationFailed,
    AiBudgetExceeded,
    AiTransportFailed,
    AiAnswerMissing,
    // General
    FsPermissionDenied,
    IoError,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RecipeParseError => "RECIPE_PARSE_ERROR",
            ErrorCode::RecipeSchemaInvalid => "RECIPE_SCHEMA_INVALID",
            ErrorCode::CompositionCycle => "COMPOSITION_CYCLE",
            ErrorCode::DuplicateStepName => "DUPLICATE_STEP_NAME",
            ErrorCode::UnknownStepReference => "UNKNOWN_STEP_REFERENCE",
            ErrorCode::UnknownTool => "UNKNOWN_TOOL",
            ErrorCode::DependencyCycle => "DEPENDENCY_CYCLE",
            ErrorCode::VariableValidationFailed => "VARIABLE_VALIDATION_FAILED",
            ErrorCode::MissingRequiredVariable => "MISSING_REQUIRED_VARIABLE",
            ErrorCode::PromptRequiredButNoninteractive => "PROMPT_REQUIRED_BUT_NONINTERACTIVE",
            ErrorCode::TemplateNotFound => "TEMPLATE_NOT_FOUND",
            ErrorCode::TemplateRenderFailed => "TEMPLATE_RENDER_FAILED",
            ErrorCode::InjectAnchorNotFound => "INJECT_ANCHOR_NOT_FOUND",
            ErrorCode::TargetExists => "TARGET_EXISTS",
            ErrorCode::ShellNonzeroExit => "SHELL_NONZERO_EXIT",
            ErrorCode::ShellTimeout => "SHELL_TIMEOUT",
            ErrorCode::InstallFailed => "INSTALL_FAILED",
            ErrorCode::QueryFailed => "QUERY_FAILED",
            ErrorCode::PatchFailed => "PATCH_FAILED",
            ErrorCode::AiProviderUnavailable => "AI_PROVIDER_UNAVAILABLE",
            ErrorCode::AiApiKeyMissing => "AI_API_KEY_MISSING",
            ErrorCode::AiGenerationFailed => "AI_GENERATION_FAILED",
            ErrorCode::AiBudgetExceeded => "AI_BUDGET_EXCEEDED",
            ErrorCode::AiTransportFailed => "AI_TRANSPORT_FAILED",
            ErrorCode::AiAnswerMissing => "AI_ANSWER_MISSING",
            ErrorCode::FsPermissionDenied => "FS_PERMISSION_DENIED",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified engine error.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
    pub context: BTreeMap<String, String>,
    pub suggestions: Vec<String>,
    pub cause: Option<anyhow::Error>,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: BTreeMap::new(),
            suggestions: Vec::new(),
            cause: None,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_source(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Short form printed on run abort: code, message, and up to three
    /// suggestions.
    pub fn user_message(&self) -> String {
        let mut out = format!("{}: {}", self.code, self.message);
        for suggestion in self.suggestions.iter().take(3) {
            out.push_str("\n  hint: ");
            out.push_str(suggestion);
        }
        out
    }

    /// Full diagnostic form, including the context map and the source
    /// chain. Emitted when `DEBUG` is set.
    pub fn developer_message(&self) -> String {
        let mut out = self.user_message();
        for (key, value) in &self.context {
            out.push_str(&format!("\n  {key}: {value}"));
        }
        if let Some(cause) = &self.cause {
            for link in cause.chain() {
                out.push_str(&format!("\n  caused by: {link}"));
            }
        }
        out
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::PermissionDenied => ErrorCode::FsPermissionDenied,
            _ => ErrorCode::IoError,
        };
        EngineError::new(code, err.to_string()).with_source(err)
    }
}

impl From<tera::Error> for EngineError {
    fn from(err: tera::Error) -> Self {
        EngineError::new(ErrorCode::TemplateRenderFailed, err.to_string()).with_source(err)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_strings_are_stable() {
        assert_eq!(ErrorCode::RecipeParseError.as_str(), "RECIPE_PARSE_ERROR");
        assert_eq!(ErrorCode::AiAnswerMissing.as_str(), "AI_ANSWER_MISSING");
        assert_eq!(
            ErrorCode::PromptRequiredButNoninteractive.as_str(),
            "PROMPT_REQUIRED_BUT_NONINTERACTIVE"
        );
    }

    #[test]
    fn user_message_caps_suggestions_at_three() {
        let err = EngineError::new(ErrorCode::TemplateNotFound, "missing template")
            .with_suggestion("one")
            .with_suggestion("two")
            .with_suggestion("three")
            .with_suggestion("four");
        let message = err.user_message();
        assert!(message.contains("three"));
        assert!(!message.contains("four"));
    }

    #[test]
    fn io_permission_denied_maps_to_fs_code() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = EngineError::from(io);
        assert_eq!(err.code, ErrorCode::FsPermissionDenied);
    }
}
