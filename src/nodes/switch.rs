//! Case-map dispatch node.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{NodeExecuteError, NodeInitError, NodeOutcome, WorkflowNode, resolve_expr};
use crate::context::WorkflowContext;
use crate::definition::NodeDefinition;
use crate::message::ExecutionScope;

/// Evaluates `Expression`, matches the result against the `Cases` map
/// (case value → port name), and completes with the matched port or
/// `default`.
#[derive(Default)]
pub struct SwitchNode {
    expression: String,
    cases: FxHashMap<String, String>,
}

impl SwitchNode {
    pub const DEFAULT_PORT: &'static str = "default";
}

#[async_trait]
impl WorkflowNode for SwitchNode {
    fn initialize(&mut self, definition: &NodeDefinition) -> Result<(), NodeInitError> {
        self.expression = definition
            .config_str("Expression")
            .ok_or_else(|| NodeInitError::MissingOption {
                node_id: definition.node_id.clone(),
                option: "Expression".into(),
            })?
            .to_string();
        let cases = definition
            .config_value("Cases")
            .and_then(Value::as_object)
            .ok_or_else(|| NodeInitError::MissingOption {
                node_id: definition.node_id.clone(),
                option: "Cases".into(),
            })?;
        self.cases = cases
            .iter()
            .map(|(case, port)| {
                let port = port.as_str().unwrap_or(case).to_string();
                (case.clone(), port)
            })
            .collect();
        if self.cases.is_empty() {
            return Err(NodeInitError::BadOption {
                node_id: definition.node_id.clone(),
                option: "Cases".into(),
                detail: "at least one case is required".into(),
            });
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        scope: &mut ExecutionScope,
        _cancel: &CancellationToken,
    ) -> Result<NodeOutcome, NodeExecuteError> {
        let value = resolve_expr(&self.expression, scope, &ctx.variables_snapshot());
        let key = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let port = self
            .cases
            .get(&key)
            .map(String::as_str)
            .unwrap_or(Self::DEFAULT_PORT);
        scope.output = scope.input.clone();
        scope.set_output("matchedCase", Value::String(key));
        Ok(NodeOutcome::with_port(port))
    }
}
