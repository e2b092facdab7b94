//! `@ai` block scanning.
//!
//! The rendering engine has no user-definable block tags, so template
//! bodies are pre-scanned for `@ai(...) ... @end` and `@context(...) ...
//! @end` blocks before rendering. Block syntax:
//!
//! ```text
//! @ai(key=handler)
//!   @context()Routes live in src/routes.@end
//!   @prompt()Write the GET handler for {{ name }}.@end
//!   @output()An async arrow function.
//!     @example()export const get = async () => {};@end
//!   @end
//! @end
//! ```
//!
//! Exactly one `@prompt` is required per block. `@context` at the top
//! level of a template contributes global context.

use crate::error::{EngineError, ErrorCode, Result};

/// One extracted `@ai` block, bodies still unrendered.
#[derive(Debug, Clone, PartialEq)]
pub struct AiBlock {
    pub key: String,
    pub prompt: String,
    pub contexts: Vec<String>,
    pub output_description: Option<String>,
    pub examples: Vec<String>,
}

/// A template body split around its AI-related blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Ai(AiBlock),
    GlobalContext(String),
}

#[derive(Debug)]
struct Tag {
    name: String,
    args: Vec<(String, String)>,
    children: Vec<Node>,
}

#[derive(Debug)]
enum Node {
    Text(String),
    Tag(Tag),
}

/// Split a template body into literal text and AI blocks.
pub fn scan(body: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let bytes = body.as_bytes();
    let mut pos = 0;
    let mut text_start = 0;

    while pos < bytes.len() {
        if bytes[pos] == b'@' {
            if let Some(name) = tag_name_at(body, pos) {
                if name == "ai" || name == "context" {
                    if text_start < pos {
                        segments.push(Segment::Text(body[text_start..pos].to_string()));
                    }
                    let (tag, end) = parse_tag(body, pos)?;
                    segments.push(if tag.name == "ai" {
                        Segment::Ai(build_ai_block(&tag)?)
                    } else {
                        Segment::GlobalContext(text_of(&tag))
                    });
                    pos = end;
                    text_start = end;
                    continue;
                }
            }
        }
        pos += 1;
    }
    if text_start < body.len() {
        segments.push(Segment::Text(body[text_start..].to_string()));
    }

    Ok(segments)
}

/// The tag name if `pos` points at `@word(`.
fn tag_name_at(body: &str, pos: usize) -> Option<&str> {
    let rest = &body[pos + 1..];
    let name_len = rest
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
        .count();
    if name_len == 0 {
        return None;
    }
    let name = &rest[..name_len];
    rest[name_len..].starts_with('(').then_some(name)
}

/// Parse the tag starting at `pos` (which points at `@`). Returns the
/// tag and the byte offset just past its `@end`.
fn parse_tag(body: &str, pos: usize) -> Result<(Tag, usize)> {
    let name = tag_name_at(body, pos)
        .ok_or_else(|| render_error("expected a tag at this position"))?
        .to_string();
    let args_start = pos + 1 + name.len() + 1;
    let args_end = body[args_start..]
        .find(')')
        .map(|i| args_start + i)
        .ok_or_else(|| render_error(format!("unterminated argument list in @{name}")))?;
    let args = parse_args(&body[args_start..args_end]);

    let mut children = Vec::new();
    let mut cursor = args_end + 1;
    let mut text_start = cursor;
    let bytes = body.as_bytes();

    while cursor < bytes.len() {
        if bytes[cursor] == b'@' {
            if is_end_at(body, cursor) {
                if text_start < cursor {
                    children.push(Node::Text(body[text_start..cursor].to_string()));
                }
                return Ok((Tag { name, args, children }, cursor + "@end".len()));
            }
            if tag_name_at(body, cursor).is_some() {
                if text_start < cursor {
                    children.push(Node::Text(body[text_start..cursor].to_string()));
                }
                let (child, end) = parse_tag(body, cursor)?;
                children.push(Node::Tag(child));
                cursor = end;
                text_start = end;
                continue;
            }
        }
        cursor += 1;
    }

    Err(render_error(format!("@{name} block is missing its @end")))
}

fn is_end_at(body: &str, pos: usize) -> bool {
    let rest = &body[pos + 1..];
    if !rest.starts_with("end") {
        return false;
    }
    // `@end` must not be the prefix of a longer word like `@ending(`.
    !rest["end".len()..]
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric() || c == '_')
        .unwrap_or(false)
}

fn parse_args(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn text_of(tag: &Tag) -> String {
    let mut out = String::new();
    for child in &tag.children {
        if let Node::Text(text) = child {
            out.push_str(text);
        }
    }
    out.trim().to_string()
}

fn build_ai_block(tag: &Tag) -> Result<AiBlock> {
    let key = tag
        .args
        .iter()
        .find(|(name, _)| name == "key")
        .map(|(_, value)| value.clone())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| render_error("@ai block requires a key argument"))?;

    let mut prompt = None;
    let mut contexts = Vec::new();
    let mut output_description = None;
    let mut examples = Vec::new();

    for child in &tag.children {
        let Node::Tag(child) = child else { continue };
        match child.name.as_str() {
            "prompt" => {
                if prompt.is_some() {
                    return Err(render_error(format!(
                        "@ai block `{key}` has more than one @prompt"
                    )));
                }
                prompt = Some(text_of(child));
            }
            "context" => contexts.push(text_of(child)),
            "example" => examples.push(text_of(child)),
            "output" => {
                let description = text_of(child);
                if !description.is_empty() {
                    output_description = Some(description);
                }
                for grandchild in &child.children {
                    if let Node::Tag(grandchild) = grandchild {
                        if grandchild.name == "example" {
                            examples.push(text_of(grandchild));
                        }
                    }
                }
            }
            other => {
                return Err(render_error(format!(
                    "unknown @{other} tag inside @ai block `{key}`"
                )))
            }
        }
    }

    let prompt = prompt.ok_or_else(|| {
        render_error(format!("@ai block `{key}` is missing its @prompt"))
    })?;

    Ok(AiBlock {
        key,
        prompt,
        contexts,
        output_description,
        examples,
    })
}

fn render_error(message: impl Into<String>) -> EngineError {
    EngineError::new(ErrorCode::TemplateRenderFailed, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_one_segment() {
        let segments = scan("no blocks here, not even an @ sign issue").unwrap();
        assert_eq!(segments.len(), 1);
        assert!(matches!(&segments[0], Segment::Text(t) if t.contains("@ sign")));
    }

    #[test]
    fn extracts_full_block() {
        let body = "before @ai(key=handler) @prompt()Write X@end @output() @example()FOO@end @end @end after";
        let segments = scan(body).unwrap();
        assert_eq!(segments.len(), 3);
        assert!(matches!(&segments[0], Segment::Text(t) if t == "before "));
        assert!(matches!(&segments[2], Segment::Text(t) if t == " after"));
        match &segments[1] {
            Segment::Ai(block) => {
                assert_eq!(block.key, "handler");
                assert_eq!(block.prompt, "Write X");
                assert_eq!(block.examples, vec!["FOO".to_string()]);
                assert!(block.output_description.is_none());
            }
            other => panic!("expected ai block, got {other:?}"),
        }
    }

    #[test]
    fn output_description_and_nested_example() {
        let body = "@ai(key=k)@prompt()P@end@output()A function.\n@example()f()@end@end@end";
        let segments = scan(body).unwrap();
        match &segments[0] {
            Segment::Ai(block) => {
                assert_eq!(block.output_description.as_deref(), Some("A function."));
                assert_eq!(block.examples, vec!["f()".to_string()]);
            }
            other => panic!("expected ai block, got {other:?}"),
        }
    }

    #[test]
    fn keyed_and_global_context() {
        let body = "@context()global info@end\n@ai(key=k)@context()local info@end@prompt()P@end@end";
        let segments = scan(body).unwrap();
        assert!(matches!(&segments[0], Segment::GlobalContext(t) if t == "global info"));
        match &segments[2] {
            Segment::Ai(block) => assert_eq!(block.contexts, vec!["local info".to_string()]),
            other => panic!("expected ai block, got {other:?}"),
        }
    }

    #[test]
    fn missing_prompt_is_an_error() {
        let err = scan("@ai(key=k)@end").unwrap_err();
        assert_eq!(err.code, ErrorCode::TemplateRenderFailed);
        assert!(err.message.contains("@prompt"));
    }

    #[test]
    fn missing_key_is_an_error() {
        let err = scan("@ai()@prompt()P@end@end").unwrap_err();
        assert!(err.message.contains("key"));
    }

    #[test]
    fn two_prompts_are_an_error() {
        let err = scan("@ai(key=k)@prompt()A@end@prompt()B@end@end").unwrap_err();
        assert!(err.message.contains("more than one"));
    }

    #[test]
    fn unterminated_block_is_an_error() {
        let err = scan("@ai(key=k)@prompt()P@end").unwrap_err();
        assert!(err.message.contains("@end"));
    }

    #[test]
    fn template_syntax_in_prompt_is_preserved_raw() {
        let body = "@ai(key=k)@prompt()Describe {{ name }}@end@end";
        let segments = scan(body).unwrap();
        match &segments[0] {
            Segment::Ai(block) => assert_eq!(block.prompt, "Describe {{ name }}"),
            other => panic!("expected ai block, got {other:?}"),
        }
    }
}
