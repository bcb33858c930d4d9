//! Script node kinds and the host seam they execute through.
//!
//! The engine is agnostic to the scripting language: hosts implement
//! [`ScriptHost`] (compile, surfacing syntax errors at initialize) and
//! [`CompiledScript`] (run against the invocation scope). The built-in
//! [`AssignmentScriptHost`] covers assignment-style statement lists,
//! enough to make script nodes executable and testable without embedding a
//! runtime; real hosts plug in via the engine.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{NodeExecuteError, NodeInitError, NodeOutcome, WorkflowNode, resolve_expr};
use crate::context::WorkflowContext;
use crate::definition::NodeDefinition;
use crate::message::{ExecutionScope, ValueMap};

/// Compiles script text into something executable.
pub trait ScriptHost: Send + Sync {
    fn compile(
        &self,
        node_id: &str,
        source: &str,
    ) -> Result<Arc<dyn CompiledScript>, NodeInitError>;
}

/// A compiled script, runnable once per node invocation.
#[async_trait]
pub trait CompiledScript: Send + Sync {
    async fn run(
        &self,
        scope: &mut ExecutionScope,
        variables: &ValueMap,
        cancel: &CancellationToken,
    ) -> Result<(), NodeExecuteError>;
}

/// Inline-script and script-file node. The only difference between the two
/// kinds is where the source text comes from.
pub struct ScriptNode {
    host: Arc<dyn ScriptHost>,
    script: Option<Arc<dyn CompiledScript>>,
}

impl ScriptNode {
    pub fn new(host: Arc<dyn ScriptHost>) -> Self {
        Self { host, script: None }
    }
}

#[async_trait]
impl WorkflowNode for ScriptNode {
    fn initialize(&mut self, definition: &NodeDefinition) -> Result<(), NodeInitError> {
        let source = match (&definition.script_content, &definition.script_path) {
            (Some(content), _) => content.clone(),
            (None, Some(path)) => {
                std::fs::read_to_string(path).map_err(|e| NodeInitError::Script {
                    node_id: definition.node_id.clone(),
                    detail: format!("failed to read {path}: {e}"),
                })?
            }
            (None, None) => {
                return Err(NodeInitError::MissingOption {
                    node_id: definition.node_id.clone(),
                    option: "scriptContent or scriptPath".into(),
                });
            }
        };
        self.script = Some(self.host.compile(&definition.node_id, &source)?);
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        scope: &mut ExecutionScope,
        cancel: &CancellationToken,
    ) -> Result<NodeOutcome, NodeExecuteError> {
        let Some(script) = &self.script else {
            return Err(NodeExecuteError::Failed(
                "script node was not initialized".into(),
            ));
        };
        let variables = ctx.variables_snapshot();
        script.run(scope, &variables, cancel).await?;
        Ok(NodeOutcome::complete())
    }
}

/// Minimal built-in host: newline/semicolon separated `name = <expr>`
/// statements whose right-hand sides use the engine's expression forms
/// (paths, JSON literals, plain strings). Assignments write to the scope
/// output.
pub struct AssignmentScriptHost;

impl ScriptHost for AssignmentScriptHost {
    fn compile(
        &self,
        node_id: &str,
        source: &str,
    ) -> Result<Arc<dyn CompiledScript>, NodeInitError> {
        let mut assignments = Vec::new();
        for (line_no, raw) in source
            .split(['\n', ';'])
            .map(str::trim)
            .enumerate()
        {
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            let Some((name, expr)) = raw.split_once('=') else {
                return Err(NodeInitError::Script {
                    node_id: node_id.to_string(),
                    detail: format!("statement {} is not an assignment: `{raw}`", line_no + 1),
                });
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(NodeInitError::Script {
                    node_id: node_id.to_string(),
                    detail: format!("statement {} assigns to an empty name", line_no + 1),
                });
            }
            assignments.push((name.to_string(), expr.trim().to_string()));
        }
        Ok(Arc::new(AssignmentScript { assignments }))
    }
}

struct AssignmentScript {
    assignments: Vec<(String, String)>,
}

#[async_trait]
impl CompiledScript for AssignmentScript {
    async fn run(
        &self,
        scope: &mut ExecutionScope,
        variables: &ValueMap,
        _cancel: &CancellationToken,
    ) -> Result<(), NodeExecuteError> {
        for (name, expr) in &self.assignments {
            let value = resolve_expr(expr, scope, variables);
            scope.output.insert(name.clone(), value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::bare_context;
    use crate::types::RuntimeKind;
    use serde_json::json;

    fn script_node(content: &str) -> ScriptNode {
        let def = NodeDefinition::new("s", RuntimeKind::InlineScript).with_script(content);
        let mut node = ScriptNode::new(Arc::new(AssignmentScriptHost));
        node.initialize(&def).unwrap();
        node
    }

    #[tokio::test]
    async fn assignments_write_to_output() {
        let ctx = bare_context();
        ctx.set_variable("factor", json!(2));
        let node = script_node("value = input.value\nfactor = variables.factor; tag = \"done\"");

        let mut scope = ExecutionScope::default();
        scope.input.insert("value".into(), json!(10));
        node.execute(&ctx, &mut scope, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(scope.output["value"], json!(10));
        assert_eq!(scope.output["factor"], json!(2));
        assert_eq!(scope.output["tag"], json!("done"));
    }

    #[test]
    fn syntax_errors_surface_at_initialize() {
        let def = NodeDefinition::new("s", RuntimeKind::InlineScript)
            .with_script("this is not an assignment");
        let mut node = ScriptNode::new(Arc::new(AssignmentScriptHost));
        assert!(matches!(
            node.initialize(&def),
            Err(NodeInitError::Script { .. })
        ));
    }

    #[test]
    fn script_file_nodes_read_their_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.script");
        std::fs::write(&path, "x = 1").unwrap();

        let mut def = NodeDefinition::new("s", RuntimeKind::ScriptFile);
        def.script_path = Some(path.display().to_string());
        let mut node = ScriptNode::new(Arc::new(AssignmentScriptHost));
        assert!(node.initialize(&def).is_ok());

        def.script_path = Some("/missing/script".into());
        let mut node = ScriptNode::new(Arc::new(AssignmentScriptHost));
        assert!(node.initialize(&def).is_err());
    }
}
