//! The closed set of step tools.
//!
//! Leaf tools (template, ai, shell, query, patch, install, ensure-dirs,
//! prompt) are dispatched through the [`ToolRegistry`]. Grouping tools
//! (recipe, sequence, parallel, conditional) re-enter the executor and
//! live in `engine::flow`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use crate::engine::context::ExecutionContext;
use crate::error::{EngineError, ErrorCode, Result};
use crate::recipe::Step;

pub mod ai;
pub mod ensure_dirs;
pub mod inject;
pub mod install;
pub mod patch;
pub mod prompt;
pub mod query;
pub mod shell;
pub mod template;

/// What a tool hands back to the step executor. The executor commits it
/// into the `StepResult`; tools never write shared state directly.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub output: Option<Value>,
    pub tool_result: Option<Value>,
    pub files_created: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    /// Variables made available to later steps.
    pub provided: BTreeMap<String, Value>,
}

impl ToolOutput {
    pub fn with_output(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> Result<ToolOutput>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Tool").field(&self.name()).finish()
    }
}

pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Registry with every leaf tool installed.
    pub fn standard() -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
        };
        registry.register(Arc::new(template::TemplateTool));
        registry.register(Arc::new(ai::AiTool));
        registry.register(Arc::new(shell::ShellTool));
        registry.register(Arc::new(query::QueryTool));
        registry.register(Arc::new(patch::PatchTool));
        registry.register(Arc::new(install::InstallTool));
        registry.register(Arc::new(ensure_dirs::EnsureDirsTool));
        registry.register(Arc::new(prompt::PromptTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.tools.get(name).cloned().ok_or_else(|| {
            EngineError::new(ErrorCode::UnknownTool, format!("unknown tool `{name}`"))
                .with_suggestion(format!(
                    "known tools: {}",
                    self.tool_names().join(", ")
                ))
        })
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tools.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
