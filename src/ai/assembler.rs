//! Pass-1 prompt document assembly.
//!
//! Turns the collector state into a self-contained markdown document the
//! user (or another model) can answer offline. The document is the only
//! thing written to stdout on a deferred run.

use super::collector::AiCollector;

#[derive(Debug, Clone)]
pub struct AssembleOptions {
    /// The invocation to repeat once answers exist, without the
    /// `--answers` flag.
    pub original_command: String,
    /// Where the answers file should be saved.
    pub answers_path: String,
    /// Custom document template; the default markdown layout is used
    /// when absent or when the template fails to render.
    pub prompt_template: Option<String>,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            original_command: "hypergen run <recipe>".to_string(),
            answers_path: "ai-answers.json".to_string(),
            prompt_template: None,
        }
    }
}

/// Assemble the prompt document. Empty sections are suppressed.
pub fn assemble(collector: &AiCollector, opts: &AssembleOptions) -> String {
    if let Some(template) = &opts.prompt_template {
        match render_custom(collector, opts, template) {
            Ok(document) => return document,
            Err(error) => {
                tracing::debug!("custom prompt template failed, using default: {error}")
            }
        }
    }
    assemble_default(collector, opts)
}

fn render_custom(
    collector: &AiCollector,
    opts: &AssembleOptions,
    template: &str,
) -> tera::Result<String> {
    let mut context = tera::Context::new();
    context.insert("entries", collector.entries());
    context.insert("global_contexts", collector.global_contexts());
    context.insert("answers_path", &opts.answers_path);
    context.insert("original_command", &opts.original_command);
    let mut tera = tera::Tera::default();
    tera.autoescape_on(vec![]);
    tera.render_str(template, &context)
}

fn assemble_default(collector: &AiCollector, opts: &AssembleOptions) -> String {
    let mut doc = String::from("# AI Generation Request\n");

    let has_global = !collector.global_contexts().is_empty();
    let has_keyed = collector.entries().iter().any(|e| !e.contexts.is_empty());
    if has_global || has_keyed {
        doc.push_str("\n## Context\n");
        if has_global {
            doc.push_str("\n### Global Context\n\n");
            for text in collector.global_contexts() {
                doc.push_str(text.trim_end());
                doc.push_str("\n\n");
            }
        }
        for entry in collector.entries() {
            if entry.contexts.is_empty() {
                continue;
            }
            doc.push_str(&format!("\n### Context for `{}`\n\n", entry.key));
            for text in &entry.contexts {
                doc.push_str(text.trim_end());
                doc.push_str("\n\n");
            }
        }
    }

    doc.push_str("\n## Prompts\n");
    for entry in collector.entries() {
        doc.push_str(&format!("\n### `{}`\n\n", entry.key));
        doc.push_str(entry.prompt.trim());
        doc.push('\n');
        if let Some(description) = &entry.output_description {
            if !description.trim().is_empty() {
                doc.push_str("\n**Expected output format:**\n\n");
                doc.push_str(description.trim());
                doc.push('\n');
            }
        }
        for example in &entry.examples {
            if example.trim().is_empty() {
                continue;
            }
            doc.push_str("\nExample:\n\n```\n");
            doc.push_str(example.trim_end());
            doc.push_str("\n```\n");
        }
    }

    doc.push_str("\n## Response Format\n\nRespond with a single JSON object:\n\n```json\n{\n");
    let last = collector.entries().len().saturating_sub(1);
    for (i, entry) in collector.entries().iter().enumerate() {
        let placeholder = if entry.has_output_shape() {
            "<see format above>"
        } else {
            "<your answer>"
        };
        let comma = if i == last { "" } else { "," };
        doc.push_str(&format!("  \"{}\": \"{}\"{}\n", entry.key, placeholder, comma));
    }
    doc.push_str("}\n```\n");

    doc.push_str(&format!(
        "\n## Instructions\n\nSave the JSON object above, with your answers filled in, to \
         `{answers}`, then re-run:\n\n```\n{command} --answers {answers}\n```\n",
        answers = opts.answers_path,
        command = opts.original_command,
    ));

    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_collector() -> AiCollector {
        let mut collector = AiCollector::new();
        collector.add_context(None, "TypeScript project, bun runtime");
        collector.register_ai_block(
            "handler",
            "Write the request handler",
            Some("An async arrow function".to_string()),
            vec!["export const handler = async () => {}".to_string()],
        );
        collector.register_ai_block("docs", "Write one sentence of docs", None, vec![]);
        collector.add_context(Some("handler"), "Routes live in src/routes.");
        collector
    }

    #[test]
    fn document_has_all_sections_in_order() {
        let doc = assemble(&sample_collector(), &AssembleOptions::default());
        let context = doc.find("## Context").unwrap();
        let prompts = doc.find("## Prompts").unwrap();
        let format = doc.find("## Response Format").unwrap();
        let instructions = doc.find("## Instructions").unwrap();
        assert!(context < prompts && prompts < format && format < instructions);
    }

    #[test]
    fn schema_keys_match_collector_keys() {
        let collector = sample_collector();
        let doc = assemble(&collector, &AssembleOptions::default());
        let json_start = doc.find("```json").unwrap();
        let body = &doc[json_start + 7..];
        let json_end = body.find("```").unwrap();
        let schema: serde_json::Value = serde_json::from_str(body[..json_end].trim()).unwrap();
        let keys: Vec<_> = schema.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), collector.entries().len());
        for entry in collector.entries() {
            assert!(keys.contains(&entry.key));
        }
    }

    #[test]
    fn shaped_blocks_point_at_format_above() {
        let doc = assemble(&sample_collector(), &AssembleOptions::default());
        assert!(doc.contains("\"handler\": \"<see format above>\""));
        assert!(doc.contains("\"docs\": \"<your answer>\""));
    }

    #[test]
    fn context_sections_are_suppressed_when_empty() {
        let mut collector = AiCollector::new();
        collector.register_ai_block("k", "p", None, vec![]);
        let doc = assemble(&collector, &AssembleOptions::default());
        assert!(!doc.contains("## Context"));
        assert!(doc.contains("### `k`"));
    }

    #[test]
    fn keyed_context_renders_under_its_heading() {
        let doc = assemble(&sample_collector(), &AssembleOptions::default());
        assert!(doc.contains("### Context for `handler`"));
        assert!(doc.contains("Routes live in src/routes."));
    }

    #[test]
    fn instructions_reference_answers_path() {
        let opts = AssembleOptions {
            original_command: "hypergen run api.yml".to_string(),
            answers_path: "out/answers.json".to_string(),
            prompt_template: None,
        };
        let doc = assemble(&sample_collector(), &opts);
        assert!(doc.contains("hypergen run api.yml --answers out/answers.json"));
    }

    #[test]
    fn custom_prompt_template_sees_entries() {
        let opts = AssembleOptions {
            prompt_template: Some(
                "{% for entry in entries %}{{ entry.key }};{% endfor %}".to_string(),
            ),
            ..Default::default()
        };
        let doc = assemble(&sample_collector(), &opts);
        assert_eq!(doc, "handler;docs;");
    }

    #[test]
    fn broken_custom_template_falls_back_to_default() {
        let opts = AssembleOptions {
            prompt_template: Some("{{ unclosed".to_string()),
            ..Default::default()
        };
        let doc = assemble(&sample_collector(), &opts);
        assert!(doc.contains("## Prompts"));
    }
}
