//! Loop nodes: foreach over a collection and condition-guarded while.
//!
//! Loops do not suspend; they emit discrete `next` messages and keep their
//! execution state in data. The foreach node fans its whole collection out
//! in one invocation; the while node emits one iteration per invocation and
//! relies on an `iteration-check` feedback edge to be re-queued after the
//! body completes, with its counter stored in workflow variables keyed by
//! the node id.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{NodeExecuteError, NodeInitError, NodeOutcome, WorkflowNode, resolve_expr};
use crate::condition::CompiledCondition;
use crate::context::WorkflowContext;
use crate::definition::NodeDefinition;
use crate::message::{ExecutionScope, ValueMap};

pub const LOOP_BODY_PORT: &str = "loop-body";
pub const ITERATION_CHECK_PORT: &str = "iteration-check";

/// Emits one `next` message per item of the evaluated collection, then
/// completes with source port `loop-body`.
#[derive(Default)]
pub struct ForeachNode {
    node_id: String,
    collection_expression: String,
    item_variable: String,
}

#[async_trait]
impl WorkflowNode for ForeachNode {
    fn initialize(&mut self, definition: &NodeDefinition) -> Result<(), NodeInitError> {
        self.node_id = definition.node_id.clone();
        self.collection_expression = definition
            .config_str("CollectionExpression")
            .ok_or_else(|| NodeInitError::MissingOption {
                node_id: definition.node_id.clone(),
                option: "CollectionExpression".into(),
            })?
            .to_string();
        self.item_variable = definition
            .config_str("ItemVariableName")
            .unwrap_or("item")
            .to_string();
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        scope: &mut ExecutionScope,
        cancel: &CancellationToken,
    ) -> Result<NodeOutcome, NodeExecuteError> {
        let value = resolve_expr(
            &self.collection_expression,
            scope,
            &ctx.variables_snapshot(),
        );
        let items = match value {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(NodeExecuteError::Failed(format!(
                    "collection expression `{}` produced {other}, not an array",
                    self.collection_expression
                )));
            }
        };

        let mut iterations = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(NodeExecuteError::Cancelled);
            }
            let mut iteration = ValueMap::default();
            iteration.insert(self.item_variable.clone(), item);
            iteration.insert("index".into(), Value::from(index as u64));
            iterations.push(iteration);
        }

        scope.set_output("count", Value::from(iterations.len() as u64));
        Ok(NodeOutcome::with_port(LOOP_BODY_PORT).with_iterations(iterations))
    }
}

/// Condition-guarded loop. While the condition holds it emits one `next`,
/// bumps its iteration counter, and completes on the feedback port; once
/// the condition fails it completes on `loop-body`. A safety cap aborts
/// runaway loops.
pub struct WhileNode {
    node_id: String,
    condition: Option<CompiledCondition>,
    max_iterations: u64,
    default_cap: u64,
}

impl WhileNode {
    pub fn new(default_cap: u64) -> Self {
        Self {
            node_id: String::new(),
            condition: None,
            max_iterations: default_cap,
            default_cap,
        }
    }
}

#[async_trait]
impl WorkflowNode for WhileNode {
    fn initialize(&mut self, definition: &NodeDefinition) -> Result<(), NodeInitError> {
        self.node_id = definition.node_id.clone();
        let source =
            definition
                .config_str("Condition")
                .ok_or_else(|| NodeInitError::MissingOption {
                    node_id: definition.node_id.clone(),
                    option: "Condition".into(),
                })?;
        self.condition = Some(CompiledCondition::compile(source).map_err(|e| {
            NodeInitError::BadOption {
                node_id: definition.node_id.clone(),
                option: "Condition".into(),
                detail: e.to_string(),
            }
        })?);
        self.max_iterations = definition
            .config_u64("MaxIterations")
            .unwrap_or(self.default_cap);
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
                "while node was not initialized".into(),
            ));
        };

        let variables = ctx.variables_snapshot();
        if condition.evaluate(&scope.input, &variables) {
            let iteration = ctx.increment_counter(&self.node_id);
            if iteration > self.max_iterations {
                return Err(NodeExecuteError::IterationLimit {
                    node_id: self.node_id.clone(),
                    limit: self.max_iterations,
                });
            }
            let mut next = scope.input.clone();
            next.insert("iteration".into(), Value::from(iteration));
            scope.output = scope.input.clone();
            scope.set_output("iteration", Value::from(iteration));
            Ok(NodeOutcome::with_port(ITERATION_CHECK_PORT).with_iterations(vec![next]))
        } else {
            scope.output = scope.input.clone();
            Ok(NodeOutcome::with_port(LOOP_BODY_PORT))
        }
    }
}
