//! Anchor-based insertion into existing files, shared by the template
//! tool's inject mode, the patch tool, and the ai tool's inject output.

use regex::Regex;

use crate::error::{EngineError, ErrorCode, Result};
use crate::recipe::{AnchorSpec, AtPosition};

#[derive(Debug, Clone, PartialEq)]
pub enum InjectOutcome {
    /// New content for the target file.
    Injected(String),
    /// `skip_if` matched; the file is left untouched.
    Skipped,
}

/// Insert `payload` into `content` at the anchor. The anchor must carry
/// exactly one strategy (the frontmatter/step validation enforces this).
pub fn inject(
    content: &str,
    payload: &str,
    anchor: &AnchorSpec,
    skip_if: Option<&str>,
) -> Result<InjectOutcome> {
    if let Some(pattern) = skip_if {
        let re = compile(pattern, "skip_if")?;
        if re.is_match(content) {
            return Ok(InjectOutcome::Skipped);
        }
    }

    let had_trailing_newline = content.ends_with('\n');
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let payload_lines: Vec<String> = payload
        .strip_suffix('\n')
        .unwrap_or(payload)
        .lines()
        .map(str::to_string)
        .collect();

    let insert_at = if let Some(pattern) = &anchor.after {
        let re = compile(pattern, "after")?;
        match lines.iter().position(|line| re.is_match(line)) {
            Some(index) => index + 1,
            None => return Err(anchor_not_found("after", pattern)),
        }
    } else if let Some(pattern) = &anchor.before {
        let re = compile(pattern, "before")?;
        match lines.iter().position(|line| re.is_match(line)) {
            Some(index) => index,
            None => return Err(anchor_not_found("before", pattern)),
        }
    } else if let Some(position) = anchor.at {
        match position {
            AtPosition::Start => 0,
            AtPosition::End => lines.len(),
        }
    } else if let Some(line) = anchor.at_line {
        // 1-indexed; inserting at line N makes the payload line N.
        if line == 0 || line > lines.len() + 1 {
            return Err(EngineError::new(
                ErrorCode::InjectAnchorNotFound,
                format!("atLine {line} is outside the file ({} lines)", lines.len()),
            ));
        }
        line - 1
    } else {
        return Err(EngineError::new(
            ErrorCode::InjectAnchorNotFound,
            "no injection anchor given",
        ));
    };

    lines.splice(insert_at..insert_at, payload_lines);
    let mut result = lines.join("\n");
    if had_trailing_newline || content.is_empty() {
        result.push('\n');
    }
    Ok(InjectOutcome::Injected(result))
}

fn compile(pattern: &str, field: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| {
        EngineError::new(
            ErrorCode::RecipeSchemaInvalid,
            format!("invalid {field} pattern `{pattern}`: {e}"),
        )
    })
}

fn anchor_not_found(field: &str, pattern: &str) -> EngineError {
    EngineError::new(
        ErrorCode::InjectAnchorNotFound,
        format!("{field} anchor /{pattern}/ matched no line in the target"),
    )
    .with_suggestion("check the anchor pattern against the target file")
    .with_suggestion("use at: end to append without an anchor")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor_after(pattern: &str) -> AnchorSpec {
        AnchorSpec {
            after: Some(pattern.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn inserts_after_matching_line() {
        let content = "one\nEXPORTS\nthree\n";
        let result = inject(content, "two", &anchor_after("^EXPORTS$"), None).unwrap();
        assert_eq!(
            result,
            InjectOutcome::Injected("one\nEXPORTS\ntwo\nthree\n".to_string())
        );
    }

    #[test]
    fn inserts_before_matching_line() {
        let anchor = AnchorSpec {
            before: Some("^three$".to_string()),
            ..Default::default()
        };
        let result = inject("one\nthree\n", "two", &anchor, None).unwrap();
        assert_eq!(
            result,
            InjectOutcome::Injected("one\ntwo\nthree\n".to_string())
        );
    }

    #[test]
    fn at_start_and_end() {
        let start = AnchorSpec {
            at: Some(AtPosition::Start),
            ..Default::default()
        };
        let end = AnchorSpec {
            at: Some(AtPosition::End),
            ..Default::default()
        };
        assert_eq!(
            inject("b\n", "a", &start, None).unwrap(),
            InjectOutcome::Injected("a\nb\n".to_string())
        );
        assert_eq!(
            inject("a\n", "b", &end, None).unwrap(),
            InjectOutcome::Injected("a\nb\n".to_string())
        );
    }

    #[test]
    fn at_line_is_one_indexed() {
        let anchor = AnchorSpec {
            at_line: Some(2),
            ..Default::default()
        };
        let result = inject("one\nthree\n", "two", &anchor, None).unwrap();
        assert_eq!(
            result,
            InjectOutcome::Injected("one\ntwo\nthree\n".to_string())
        );
    }

    #[test]
    fn at_line_out_of_range_is_anchor_error() {
        let anchor = AnchorSpec {
            at_line: Some(10),
            ..Default::default()
        };
        let err = inject("one\n", "x", &anchor, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::InjectAnchorNotFound);
    }

    #[test]
    fn missing_anchor_is_reported() {
        let err = inject("nothing here\n", "x", &anchor_after("^EXPORTS$"), None).unwrap_err();
        assert_eq!(err.code, ErrorCode::InjectAnchorNotFound);
    }

    #[test]
    fn skip_if_short_circuits() {
        let content = "one\ntwo\n";
        let result = inject(content, "two", &anchor_after("^one$"), Some("two")).unwrap();
        assert_eq!(result, InjectOutcome::Skipped);
    }

    #[test]
    fn skip_if_makes_reinjection_idempotent() {
        let anchor = anchor_after("^EXPORTS$");
        let first = inject("EXPORTS\n", "export x;", &anchor, Some("export x;")).unwrap();
        let InjectOutcome::Injected(content) = first else {
            panic!("expected injection")
        };
        let second = inject(&content, "export x;", &anchor, Some("export x;")).unwrap();
        assert_eq!(second, InjectOutcome::Skipped);
    }

    #[test]
    fn multiline_payload_keeps_line_structure() {
        let result = inject("a\nz\n", "b\nc", &anchor_after("^a$"), None).unwrap();
        assert_eq!(
            result,
            InjectOutcome::Injected("a\nb\nc\nz\n".to_string())
        );
    }
}
