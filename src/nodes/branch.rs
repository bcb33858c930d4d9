//! Two-way conditional node.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{NodeExecuteError, NodeInitError, NodeOutcome, WorkflowNode};
use crate::condition::CompiledCondition;
use crate::context::WorkflowContext;
use crate::definition::NodeDefinition;
use crate::message::ExecutionScope;

/// Evaluates its `Condition` against the invocation input and completes
/// with source port `true-branch` or `false-branch`.
#[derive(Default)]
pub struct BranchNode {
    condition: Option<CompiledCondition>,
}

impl BranchNode {
    pub const TRUE_PORT: &'static str = "true-branch";
    pub const FALSE_PORT: &'static str = "false-branch";
}

#[async_trait]
impl WorkflowNode for BranchNode {
    fn initialize(&mut self, definition: &NodeDefinition) -> Result<(), NodeInitError> {
        let source =
            definition
                .config_str("Condition")
                .ok_or_else(|| NodeInitError::MissingOption {
                    node_id: definition.node_id.clone(),
                    option: "Condition".into(),
                })?;
        let condition =
            CompiledCondition::compile(source).map_err(|e| NodeInitError::BadOption {
                node_id: definition.node_id.clone(),
                option: "Condition".into(),
                detail: e.to_string(),
            })?;
        self.condition = Some(condition);
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        scope: &mut ExecutionScope,
        _cancel: &CancellationToken,
    ) -> Result<NodeOutcome, NodeExecuteError> {
        let Some(condition) = &self.condition else {
            return Err(NodeExecuteError::Failed(
                "branch node was not initialized".into(),
            ));
        };
        // The condition's `output`/`input` roots both read the mapping the
        // upstream node completed with, which is this invocation's input.
        let taken = condition.evaluate(&scope.input, &ctx.variables_snapshot());
        scope.output = scope.input.clone();
        scope.set_output("branch", serde_json::Value::Bool(taken));
        let port = if taken { Self::TRUE_PORT } else { Self::FALSE_PORT };
        Ok(NodeOutcome::with_port(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::bare_context;
    use serde_json::json;

    fn branch(cond: &str) -> BranchNode {
        let def = NodeDefinition::new("br", crate::types::RuntimeKind::Branch)
            .with_config("Condition", json!(cond));
        let mut node = BranchNode::default();
        node.initialize(&def).unwrap();
        node
    }

    #[tokio::test]
    async fn takes_true_branch_when_condition_holds() {
        let ctx = bare_context();
        let node = branch("output.x > 5");
        let mut scope = ExecutionScope::default();
        scope.input.insert("x".into(), json!(7));
        let outcome = node
            .execute(&ctx, &mut scope, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.source_port.as_deref(), Some("true-branch"));
        // Input flows through so downstream nodes see it.
        assert_eq!(scope.output["x"], json!(7));
    }

    #[tokio::test]
    async fn takes_false_branch_otherwise() {
        let ctx = bare_context();
        let node = branch("output.x > 5");
        let mut scope = ExecutionScope::default();
        scope.input.insert("x".into(), json!(3));
        let outcome = node
            .execute(&ctx, &mut scope, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.source_port.as_deref(), Some("false-branch"));
    }
}
