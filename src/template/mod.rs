//! Template rendering.
//!
//! Wraps the rendering engine with the engine's explicit context
//! contract: variables, `steps.*` outputs, and `recipe` metadata at the
//! root, a `provide(key=, value=)` capability for pushing values to
//! later steps, and the two-pass `@ai` block behavior.

pub mod ai_tag;
pub mod frontmatter;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::engine::context::{ExecutionContext, VariableEnvironment};
use crate::error::{EngineError, ErrorCode, Result};

pub use frontmatter::{Frontmatter, TemplateFile};

/// Rendered body text plus any variables pushed via `provide()`.
#[derive(Debug, Clone, Default)]
pub struct RenderOutcome {
    pub text: String,
    pub provided: BTreeMap<String, serde_json::Value>,
}

/// Render a template string with no `@ai` handling. Used for
/// frontmatter, `onSuccess`/`onError`, and the bodies of `@ai` child
/// blocks.
pub fn render_plain(text: &str, env: &VariableEnvironment) -> Result<String> {
    let mut tera = new_engine();
    let context = env.to_tera_context();
    tera.render_str(text, &context).map_err(EngineError::from)
}

/// Render a template body with full `@ai` semantics.
///
/// In collect mode, blocks register with the collector and contribute
/// nothing to the output. In answers mode, each block is replaced by its
/// answer, falling back to the first `@example` body; a block with
/// neither fails with `AI_ANSWER_MISSING`.
pub fn render_body(body: &str, ctx: &ExecutionContext) -> Result<RenderOutcome> {
    let segments = ai_tag::scan(body)?;

    // Replace each block with a placeholder so surrounding template
    // constructs still render as one document, then splice the
    // resolutions into the rendered text.
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let mut skeleton = String::new();
    let mut replacements: Vec<(String, String)> = Vec::new();

    for (index, segment) in segments.iter().enumerate() {
        match segment {
            ai_tag::Segment::Text(text) => skeleton.push_str(text),
            ai_tag::Segment::GlobalContext(raw) => {
                if ctx.options.collect_mode {
                    let rendered = render_plain(raw, &ctx.env)?;
                    lock_collector(ctx)?.add_context(None, rendered);
                }
            }
            ai_tag::Segment::Ai(block) => {
                let placeholder = format!("[[hypergen-{nonce}-{index}]]");
                let resolution = resolve_block(block, ctx)?;
                replacements.push((placeholder.clone(), resolution));
                skeleton.push_str(&placeholder);
            }
        }
    }

    let provided: Arc<Mutex<BTreeMap<String, serde_json::Value>>> = Arc::default();
    let mut tera = new_engine();
    register_provide(&mut tera, Arc::clone(&provided));
    let context = ctx.env.to_tera_context();
    let mut rendered = tera.render_str(&skeleton, &context).map_err(EngineError::from)?;

    for (placeholder, resolution) in replacements {
        rendered = rendered.replacen(&placeholder, &resolution, 1);
    }

    let provided = std::mem::take(&mut *provided.lock().expect("provide map lock"));
    Ok(RenderOutcome {
        text: rendered,
        provided,
    })
}

/// Decide what an `@ai` block renders to, collecting it when in Pass 1.
fn resolve_block(block: &ai_tag::AiBlock, ctx: &ExecutionContext) -> Result<String> {
    let prompt = render_plain(&block.prompt, &ctx.env)?;
    let contexts = block
        .contexts
        .iter()
        .map(|raw| render_plain(raw, &ctx.env))
        .collect::<Result<Vec<_>>>()?;
    let output_description = block
        .output_description
        .as_ref()
        .map(|raw| render_plain(raw, &ctx.env))
        .transpose()?;
    let examples = block
        .examples
        .iter()
        .map(|raw| render_plain(raw, &ctx.env))
        .collect::<Result<Vec<_>>>()?;

    if ctx.options.collect_mode {
        let mut collector = lock_collector(ctx)?;
        collector.register_ai_block(&block.key, prompt, output_description, examples);
        for context in contexts {
            collector.add_context(Some(&block.key), context);
        }
        return Ok(String::new());
    }

    if let Some(answers) = &ctx.options.answers {
        if let Some(answer) = answers.get(&block.key) {
            return Ok(answer.clone());
        }
    }

    match examples.into_iter().next() {
        Some(example) => Ok(example),
        None => Err(EngineError::new(
            ErrorCode::AiAnswerMissing,
            format!("no answer supplied for @ai block `{}`", block.key),
        )
        .with_suggestion("run with ai mode `stdout` to produce the prompt document")
        .with_suggestion("pass --answers with a JSON object containing this key")),
    }
}

fn new_engine() -> tera::Tera {
    let mut tera = tera::Tera::default();
    // Rendered output is code, not markup.
    tera.autoescape_on(vec![]);
    tera
}

fn register_provide(
    tera: &mut tera::Tera,
    sink: Arc<Mutex<BTreeMap<String, serde_json::Value>>>,
) {
    tera.register_function(
        "provide",
        move |args: &std::collections::HashMap<String, tera::Value>| {
            let key = args
                .get("key")
                .and_then(|v| v.as_str())
                .ok_or_else(|| tera::Error::msg("provide() requires a string `key`"))?;
            let value = args
                .get("value")
                .cloned()
                .ok_or_else(|| tera::Error::msg("provide() requires a `value`"))?;
            sink.lock()
                .expect("provide map lock")
                .insert(key.to_string(), value);
            Ok(tera::Value::String(String::new()))
        },
    );
}

fn lock_collector(
    ctx: &ExecutionContext,
) -> Result<std::sync::MutexGuard<'_, crate::ai::AiCollector>> {
    ctx.collector
        .lock()
        .map_err(|_| EngineError::internal("ai collector lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_context;
    use serde_json::json;

    #[test]
    fn renders_variables_and_steps() {
        let ctx = test_context(json!({"name": "World"}));
        let outcome = render_body("Hi {{ name }}", &ctx).unwrap();
        assert_eq!(outcome.text, "Hi World");
    }

    #[test]
    fn provide_pushes_variables_and_renders_empty() {
        let ctx = test_context(json!({}));
        let outcome = render_body("a{{ provide(key=\"port\", value=8080) }}b", &ctx).unwrap();
        assert_eq!(outcome.text, "ab");
        assert_eq!(outcome.provided.get("port"), Some(&json!(8080)));
    }

    #[test]
    fn collect_mode_elides_blocks_and_registers() {
        let mut ctx = test_context(json!({"name": "api"}));
        ctx.options.collect_mode = true;
        let body = "head\n@ai(key=handler)@prompt()Write {{ name }}@end@end\ntail";
        let outcome = render_body(body, &ctx).unwrap();
        assert_eq!(outcome.text, "head\n\ntail");

        let collector = ctx.collector.lock().unwrap();
        assert_eq!(collector.entries().len(), 1);
        assert_eq!(collector.entries()[0].key, "handler");
        assert_eq!(collector.entries()[0].prompt, "Write api");
    }

    #[test]
    fn collect_output_is_byte_identical_to_elision() {
        let mut ctx = test_context(json!({}));
        ctx.options.collect_mode = true;
        let with_block = render_body("A@ai(key=k)@prompt()P@end@endB", &ctx).unwrap();
        let without_block = render_body("AB", &ctx).unwrap();
        assert_eq!(with_block.text, without_block.text);
    }

    #[test]
    fn answers_mode_substitutes_exactly_once() {
        let mut ctx = test_context(json!({}));
        ctx.options.answers = Some(
            [("handler".to_string(), "FINAL".to_string())]
                .into_iter()
                .collect(),
        );
        let body = "start @ai(key=handler)@prompt()P@end@example()FOO@end@end end";
        let outcome = render_body(body, &ctx).unwrap();
        assert_eq!(outcome.text, "start FINAL end");
        assert_eq!(outcome.text.matches("FINAL").count(), 1);
    }

    #[test]
    fn missing_answer_falls_back_to_example() {
        let mut ctx = test_context(json!({}));
        ctx.options.answers = Some(BTreeMap::new());
        let body = "@ai(key=k)@prompt()P@end@example()FOO@end@end";
        let outcome = render_body(body, &ctx).unwrap();
        assert_eq!(outcome.text, "FOO");
    }

    #[test]
    fn missing_answer_without_example_errors() {
        let mut ctx = test_context(json!({}));
        ctx.options.answers = Some(BTreeMap::new());
        let err = render_body("@ai(key=k)@prompt()P@end@end", &ctx).unwrap_err();
        assert_eq!(err.code, ErrorCode::AiAnswerMissing);
    }

    #[test]
    fn global_context_is_always_elided() {
        let ctx = test_context(json!({}));
        let outcome = render_body("x@context()notes@end y", &ctx).unwrap();
        assert_eq!(outcome.text, "x y");
    }

    #[test]
    fn render_error_has_template_code() {
        let ctx = test_context(json!({}));
        let err = render_body("{{ missing_filter | nope }}", &ctx).unwrap_err();
        assert_eq!(err.code, ErrorCode::TemplateRenderFailed);
    }
}
