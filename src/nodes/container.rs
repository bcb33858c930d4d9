//! Inline child-graph node.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{NodeExecuteError, NodeFactory, NodeInitError, NodeOutcome, WorkflowNode};
use crate::config::EventBusConfig;
use crate::context::WorkflowContext;
use crate::definition::{EdgeDefinition, NodeDefinition, WorkflowDefinition};
use crate::engine::WorkflowEngine;
use crate::events::{Event, EventEmitter, NodeTransition};
use crate::message::ExecutionScope;
use crate::types::{EdgeKind, NodeStatus, WorkflowStatus};

/// How the container wires its children together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// All children are entry points; no implicit edges.
    #[default]
    Parallel,
    /// Children chained with on-complete edges in declaration order.
    Sequential,
    /// Topology taken verbatim from `ChildConnections`.
    Mixed,
}

/// Embeds a child graph executed by a mini-engine. Completes when every
/// child completes; fails fast on the first child failure, cancelling the
/// remaining children and reporting the failed child id.
pub struct ContainerNode {
    factory: Arc<NodeFactory>,
    node_id: String,
    child: Option<Arc<WorkflowDefinition>>,
}

impl ContainerNode {
    pub fn new(factory: Arc<NodeFactory>) -> Self {
        Self {
            factory,
            node_id: String::new(),
            child: None,
        }
    }
}

fn parse_mode(definition: &NodeDefinition) -> Result<ExecutionMode, NodeInitError> {
    match definition.config_str("ExecutionMode") {
        None => Ok(ExecutionMode::default()),
        Some("Parallel") => Ok(ExecutionMode::Parallel),
        Some("Sequential") => Ok(ExecutionMode::Sequential),
        Some("Mixed") => Ok(ExecutionMode::Mixed),
        Some(other) => Err(NodeInitError::BadOption {
            node_id: definition.node_id.clone(),
            option: "ExecutionMode".into(),
            detail: format!("unknown mode `{other}`"),
        }),
    }
}

#[async_trait]
impl WorkflowNode for ContainerNode {
    fn initialize(&mut self, definition: &NodeDefinition) -> Result<(), NodeInitError> {
        self.node_id = definition.node_id.clone();

        let child_nodes: Vec<NodeDefinition> = definition
            .config_value("ChildNodes")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| NodeInitError::ChildGraph {
                node_id: definition.node_id.clone(),
                detail: e.to_string(),
            })?
            .unwrap_or_default();
        if child_nodes.is_empty() {
            return Err(NodeInitError::MissingOption {
                node_id: definition.node_id.clone(),
                option: "ChildNodes".into(),
            });
        }

        let mode = parse_mode(definition)?;
        let mut child = WorkflowDefinition::new(format!("{}::children", definition.node_id));
        let order: Vec<String> = child_nodes.iter().map(|n| n.node_id.clone()).collect();
        child.nodes = child_nodes;
        match mode {
            ExecutionMode::Parallel => {}
            ExecutionMode::Sequential => {
                for pair in order.windows(2) {
                    child.connections.push(EdgeDefinition::new(
                        pair[0].clone(),
                        pair[1].clone(),
                        EdgeKind::OnComplete,
                    ));
                }
            }
            ExecutionMode::Mixed => {
                child.connections = definition
                    .config_value("ChildConnections")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| NodeInitError::ChildGraph {
                        node_id: definition.node_id.clone(),
                        detail: e.to_string(),
                    })?
                    .unwrap_or_default();
            }
        }
        self.child = Some(Arc::new(child));
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        scope: &mut ExecutionScope,
        cancel: &CancellationToken,
    ) -> Result<NodeOutcome, NodeExecuteError> {
        let Some(child_definition) = &self.child else {
            return Err(NodeExecuteError::Failed(
                "container node was not initialized".into(),
            ));
        };

        let mut child_config = self.factory.config().clone();
        child_config.event_bus = EventBusConfig::silent();
        let child_engine = WorkflowEngine::with_factory(child_config, Arc::clone(&self.factory));

        let child_cancel = cancel.child_token();

        // Forward child events under the hierarchical key, and fail fast:
        // the first child failure cancels the remaining children.
        let mut child_events = child_engine.subscribe_events();
        let parent_emitter = ctx.emitter();
        let prefix = self.node_id.clone();
        let fail_fast = child_cancel.clone();
        let forwarder = tokio::spawn(async move {
            let mut failed_child = None;
            while let Ok(event) = child_events.recv().await {
                if failed_child.is_none() {
                    if let Event::Node(node) = &event {
                        if node.transition == NodeTransition::Failed {
                            failed_child = Some(node.node_path.clone());
                            fail_fast.cancel();
                        }
                    }
                }
                let _ = parent_emitter.emit(event.prefixed(&prefix));
            }
            failed_child
        });

        let result = child_engine
            .start(
                (**child_definition).clone(),
                scope.input.clone(),
                None,
                child_cancel,
            )
            .await;
        child_engine.shutdown().await;
        let failed_child = forwarder.await.ok().flatten();

        let child_ctx = result.map_err(|e| NodeExecuteError::Failed(e.to_string()))?;
        let instances = child_ctx.instances_snapshot();
        let failed_child = failed_child.or_else(|| {
            instances
                .iter()
                .find(|i| i.status == NodeStatus::Failed)
                .map(|i| i.node_id.clone())
        });

        match (child_ctx.status(), failed_child) {
            (WorkflowStatus::Completed, None) => {
                let completed = instances
                    .iter()
                    .filter(|i| i.status == NodeStatus::Completed)
                    .count();
                scope.set_output("completedChildren", Value::from(completed as u64));
                Ok(NodeOutcome::complete())
            }
            (WorkflowStatus::Cancelled, None) => Err(NodeExecuteError::Cancelled),
            (_, Some(child_id)) => {
                scope.set_output("FailedChildId", Value::String(child_id.clone()));
                let detail = instances
                    .iter()
                    .find(|i| i.node_id == child_id && i.status == NodeStatus::Failed)
                    .and_then(|i| i.failure.as_ref().map(|f| f.message.clone()))
                    .unwrap_or_else(|| "child failed".into());
                Err(NodeExecuteError::ChildFailed { child_id, detail })
            }
            (status, None) => Err(NodeExecuteError::Failed(format!(
                "container children ended {status}"
            ))),
        }
    }
}
