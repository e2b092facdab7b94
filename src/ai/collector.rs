//! Pass-1 accumulator for `@ai` blocks.
//!
//! One collector exists per run, shared through the `ExecutionContext`
//! rather than process-global state so nested recipe invocations feed the
//! same prompt document.

use std::collections::HashMap;

/// One collected `@ai` block.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct AiBlockEntry {
    pub key: String,
    pub prompt: String,
    pub contexts: Vec<String>,
    pub output_description: Option<String>,
    pub examples: Vec<String>,
}

impl AiBlockEntry {
    /// Whether the response-format schema should point at the described
    /// shape instead of a free-form answer.
    pub fn has_output_shape(&self) -> bool {
        self.output_description.is_some() || !self.examples.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct AiCollector {
    collect_mode: bool,
    global_contexts: Vec<String>,
    entries: Vec<AiBlockEntry>,
    index: HashMap<String, usize>,
}

impl AiCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_collect_mode(&mut self, on: bool) {
        self.collect_mode = on;
    }

    pub fn collect_mode(&self) -> bool {
        self.collect_mode
    }

    /// Register a block. Keys are unique per run; a repeated key replaces
    /// the earlier entry in place, keeping first-seen order.
    pub fn register_ai_block(
        &mut self,
        key: impl Into<String>,
        prompt: impl Into<String>,
        output_description: Option<String>,
        examples: Vec<String>,
    ) {
        let key = key.into();
        let entry = AiBlockEntry {
            key: key.clone(),
            prompt: prompt.into(),
            contexts: Vec::new(),
            output_description,
            examples,
        };
        match self.index.get(&key) {
            Some(&slot) => {
                let contexts = std::mem::take(&mut self.entries[slot].contexts);
                self.entries[slot] = AiBlockEntry { contexts, ..entry };
            }
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    /// Attach context text to a block, or globally when `key` is `None`.
    pub fn add_context(&mut self, key: Option<&str>, text: impl Into<String>) {
        let text = text.into();
        if text.trim().is_empty() {
            return;
        }
        match key {
            Some(key) => {
                if let Some(&slot) = self.index.get(key) {
                    self.entries[slot].contexts.push(text);
                } else {
                    // Context seen before its block registers; create a
                    // placeholder entry so the text is not dropped.
                    self.index.insert(key.to_string(), self.entries.len());
                    self.entries.push(AiBlockEntry {
                        key: key.to_string(),
                        contexts: vec![text],
                        ..Default::default()
                    });
                }
            }
            None => self.global_contexts.push(text),
        }
    }

    pub fn has_entries(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn entries(&self) -> &[AiBlockEntry] {
        &self.entries
    }

    pub fn global_contexts(&self) -> &[String] {
        &self.global_contexts
    }

    pub fn clear(&mut self) {
        self.global_contexts.clear();
        self.entries.clear();
        self.index.clear();
    }
}
