//! Test fixtures shared by unit and integration tests.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::ai::{AiCollector, BudgetLimits, CostTracker};
use crate::config::{AiConfig, ExecutionOptions};
use crate::engine::context::{ExecutionContext, VariableEnvironment};
use crate::interaction::NonInteractive;
use crate::subprocess::TokioProcessRunner;

/// Execution context rooted in `root` with the given recipe variables.
pub fn test_context_in(root: &Path, vars: serde_json::Value) -> ExecutionContext {
    let serde_json::Value::Object(map) = vars else {
        panic!("test variables must be a JSON object")
    };
    let mut options = ExecutionOptions::new(root);
    options.non_interactive = true;
    ExecutionContext {
        recipe_name: "test-recipe".to_string(),
        recipe_version: None,
        step_name: "test-step".to_string(),
        env: VariableEnvironment::new("test-recipe", None, map),
        options,
        ai: AiConfig::default(),
        step_results: Arc::new(BTreeMap::new()),
        collector: Arc::new(Mutex::new(AiCollector::new())),
        cost: Arc::new(Mutex::new(CostTracker::new(
            HashMap::new(),
            BudgetLimits::default(),
        ))),
        runner: Arc::new(TokioProcessRunner),
        interaction: Arc::new(NonInteractive),
    }
}

/// Context for tests that never touch the filesystem.
pub fn test_context(vars: serde_json::Value) -> ExecutionContext {
    test_context_in(Path::new("."), vars)
}

/// Write a file under `root`, creating parent directories.
pub fn write_file(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dirs");
    }
    std::fs::write(path, content).expect("write fixture file");
}
