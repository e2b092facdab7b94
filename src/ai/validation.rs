//! Generated-output validation and retry feedback.

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyntaxKind {
    Json,
    Yaml,
    Ts,
    Js,
    Css,
    Html,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GuardrailConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syntax: Option<SyntaxKind>,
    #[serde(default, rename = "allowedImports", skip_serializing_if = "Vec::is_empty")]
    pub allowed_imports: Vec<String>,
    #[serde(default, rename = "blockedImports", skip_serializing_if = "Vec::is_empty")]
    pub blocked_imports: Vec<String>,
    #[serde(default, rename = "maxLength", skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Free-text rules appended to the system prompt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<String>,
}

/// Validate `output` against the guardrails. Returns the list of
/// violations; empty means the output is acceptable.
pub fn validate(output: &str, config: &GuardrailConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if let Some(limit) = config.max_length {
        if output.len() > limit {
            errors.push(format!(
                "output is {} bytes, exceeding the {limit} byte limit",
                output.len()
            ));
        }
    }

    if let Some(kind) = config.syntax {
        if let Some(error) = check_syntax(output, kind) {
            errors.push(error);
        }
    }

    if !config.allowed_imports.is_empty() || !config.blocked_imports.is_empty() {
        for module in extract_imports(output) {
            if config.blocked_imports.iter().any(|b| module_matches(&module, b)) {
                errors.push(format!("import of blocked module `{module}`"));
            } else if !config.allowed_imports.is_empty()
                && !config.allowed_imports.iter().any(|a| module_matches(&module, a))
            {
                errors.push(format!("import of `{module}` is not in the allowed list"));
            }
        }
    }

    errors
}

fn check_syntax(output: &str, kind: SyntaxKind) -> Option<String> {
    match kind {
        SyntaxKind::Json => serde_json::from_str::<serde_json::Value>(output)
            .err()
            .map(|e| format!("invalid JSON: {e}")),
        SyntaxKind::Yaml => serde_yaml::from_str::<serde_yaml::Value>(output)
            .err()
            .map(|e| format!("invalid YAML: {e}")),
        // Full parsing is out of scope for code outputs; catch the
        // common truncation failure of unbalanced delimiters.
        SyntaxKind::Ts | SyntaxKind::Js | SyntaxKind::Css => {
            check_balanced(output, &[('{', '}'), ('(', ')'), ('[', ']')])
        }
        SyntaxKind::Html => {
            let opens = output.matches('<').count();
            let closes = output.matches('>').count();
            (opens != closes).then(|| "unbalanced angle brackets".to_string())
        }
    }
}

fn check_balanced(output: &str, pairs: &[(char, char)]) -> Option<String> {
    for &(open, close) in pairs {
        let mut depth: i64 = 0;
        let mut in_string: Option<char> = None;
        let mut prev = '\0';
        for ch in output.chars() {
            match in_string {
                Some(quote) => {
                    if ch == quote && prev != '\\' {
                        in_string = None;
                    }
                }
                None => {
                    if ch == '"' || ch == '\'' || ch == '`' {
                        in_string = Some(ch);
                    } else if ch == open {
                        depth += 1;
                    } else if ch == close {
                        depth -= 1;
                    }
                }
            }
            prev = ch;
        }
        if depth != 0 {
            return Some(format!("unbalanced `{open}{close}` delimiters"));
        }
    }
    None
}

/// Module specifiers from `import ... from '...'`, `import('...')`, and
/// `require('...')` forms.
fn extract_imports(output: &str) -> Vec<String> {
    static PATTERNS: &[&str] = &[
        r#"import\s+[^;]*?from\s+['"]([^'"]+)['"]"#,
        r#"import\s*\(\s*['"]([^'"]+)['"]\s*\)"#,
        r#"require\s*\(\s*['"]([^'"]+)['"]\s*\)"#,
        r#"import\s+['"]([^'"]+)['"]"#,
    ];
    let mut modules = Vec::new();
    for pattern in PATTERNS {
        let re = Regex::new(pattern).expect("static import pattern");
        for cap in re.captures_iter(output) {
            let module = cap[1].to_string();
            if !modules.contains(&module) {
                modules.push(module);
            }
        }
    }
    modules
}

fn module_matches(module: &str, rule: &str) -> bool {
    module == rule || module.starts_with(&format!("{rule}/"))
}

/// Feedback block appended to the prompt on a validation retry.
pub fn retry_feedback(previous_output: &str, errors: &[String]) -> String {
    let mut feedback = String::from(
        "\n\nYour previous answer failed validation. Previous answer:\n\n```\n",
    );
    feedback.push_str(previous_output.trim_end());
    feedback.push_str("\n```\n\nValidation errors:\n");
    for error in errors {
        feedback.push_str(&format!("- {error}\n"));
    }
    feedback.push_str("\nProduce a corrected answer that fixes every error.");
    feedback
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_syntax_is_checked() {
        let config = GuardrailConfig {
            syntax: Some(SyntaxKind::Json),
            ..Default::default()
        };
        assert!(validate(r#"{"ok": true}"#, &config).is_empty());
        assert!(!validate("{nope", &config).is_empty());
    }

    #[test]
    fn max_length_is_enforced() {
        let config = GuardrailConfig {
            max_length: Some(5),
            ..Default::default()
        };
        assert!(!validate("too long for sure", &config).is_empty());
        assert!(validate("tiny", &config).is_empty());
    }

    #[test]
    fn blocked_imports_are_flagged() {
        let config = GuardrailConfig {
            blocked_imports: vec!["fs".to_string()],
            ..Default::default()
        };
        let output = "import { readFile } from 'fs';";
        let errors = validate(output, &config);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("fs"));
    }

    #[test]
    fn allowed_imports_reject_others() {
        let config = GuardrailConfig {
            allowed_imports: vec!["react".to_string()],
            ..Default::default()
        };
        assert!(validate("import React from 'react';", &config).is_empty());
        assert!(validate("import React from 'react/jsx-runtime';", &config).is_empty());
        assert!(!validate("import _ from 'lodash';", &config).is_empty());
    }

    #[test]
    fn unbalanced_braces_fail_code_syntax() {
        let config = GuardrailConfig {
            syntax: Some(SyntaxKind::Ts),
            ..Default::default()
        };
        assert!(validate("function f() { return 1; }", &config).is_empty());
        assert!(!validate("function f() { return 1;", &config).is_empty());
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let config = GuardrailConfig {
            syntax: Some(SyntaxKind::Js),
            ..Default::default()
        };
        assert!(validate(r#"const s = "{{{";"#, &config).is_empty());
    }

    #[test]
    fn retry_feedback_lists_errors() {
        let feedback = retry_feedback("bad output", &["invalid JSON: eof".to_string()]);
        assert!(feedback.contains("bad output"));
        assert!(feedback.contains("invalid JSON"));
    }
}
