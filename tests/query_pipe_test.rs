//! Query tool reads piping into later template renders.

use std::collections::BTreeMap;
use std::path::Path;

use hypergen::config::ExecutionOptions;
use hypergen::engine::RecipeEngine;
use hypergen::{load_recipe_str, AiConfig};

fn options(root: &Path) -> ExecutionOptions {
    let mut options = ExecutionOptions::new(root);
    options.non_interactive = true;
    options
}

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

#[tokio::test]
async fn query_exports_feed_template_bodies() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "package.json", r#"{"name":"demo"}"#);
    write(
        dir.path(),
        "name.t",
        "---\nto: out/name.txt\n---\nname={{ steps.probe.output.pkgName }}",
    );
    let recipe = r#"
name: pipe
steps:
  - name: probe
    tool: query
    file: package.json
    checks:
      - path: name
        export: pkgName
  - name: render
    tool: template
    template: name.t
"#;
    let loaded = load_recipe_str(recipe, dir.path()).unwrap();
    let result = RecipeEngine::new(AiConfig::default())
        .execute(&loaded.recipe, options(dir.path()), &BTreeMap::new())
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.step_results);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("out/name.txt")).unwrap(),
        "name=demo"
    );
}

#[tokio::test]
async fn export_exists_gates_conditional_steps() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "package.json",
        r#"{"name":"demo","scripts":{"test":"vitest"},"private":false}"#,
    );
    let recipe = r#"
name: gates
steps:
  - name: probe
    tool: query
    file: package.json
    checks:
      - path: scripts.test
        exportExists: hasTests
      - path: private
        exportExists: isPrivate
  - name: when-tests
    tool: shell
    command: echo yes > has-tests.txt
    dependsOn: [probe]
    when: "${steps.probe.output.hasTests}"
  - name: when-private
    tool: shell
    command: echo yes > is-private.txt
    dependsOn: [probe]
    when: "${steps.probe.output.isPrivate}"
"#;
    let loaded = load_recipe_str(recipe, dir.path()).unwrap();
    let result = RecipeEngine::new(AiConfig::default())
        .execute(&loaded.recipe, options(dir.path()), &BTreeMap::new())
        .await
        .unwrap();

    assert!(result.success);
    assert!(dir.path().join("has-tests.txt").exists());
    // `private: false` counts as absent.
    assert!(!dir.path().join("is-private.txt").exists());
}

#[tokio::test]
async fn expression_value_feeds_shell_command() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "package.json",
        r#"{"dependencies":{"react":"19.0.0","zod":"3.0.0"}}"#,
    );
    let recipe = r#"
name: expr
steps:
  - name: count
    tool: query
    file: package.json
    expression: "Object.keys(data.dependencies).length"
  - name: report
    tool: shell
    command: "printf '%s' '{{ steps.count.output.value }}' > count.txt"
    dependsOn: [count]
"#;
    let loaded = load_recipe_str(recipe, dir.path()).unwrap();
    let result = RecipeEngine::new(AiConfig::default())
        .execute(&loaded.recipe, options(dir.path()), &BTreeMap::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("count.txt")).unwrap(),
        "2"
    );
}
