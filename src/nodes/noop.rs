//! Pass-through node.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{NodeExecuteError, NodeOutcome, WorkflowNode};
use crate::context::WorkflowContext;
use crate::message::ExecutionScope;

/// Completes immediately after a brief yield, forwarding its input.
pub struct NoopNode;

#[async_trait]
impl WorkflowNode for NoopNode {
    async fn execute(
        &self,
        _ctx: &WorkflowContext,
        scope: &mut ExecutionScope,
        _cancel: &CancellationToken,
    ) -> Result<NodeOutcome, NodeExecuteError> {
        tokio::task::yield_now().await;
        scope.output = scope.input.clone();
        Ok(NodeOutcome::complete())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::bare_context;
    use serde_json::json;

    #[tokio::test]
    async fn forwards_input_unchanged() {
        let ctx = bare_context();
        let mut scope = ExecutionScope::default();
        scope.input.insert("k".into(), json!("v"));
        let outcome = NoopNode
            .execute(&ctx, &mut scope, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.source_port.is_none());
        assert_eq!(scope.output["k"], json!("v"));
    }
}
