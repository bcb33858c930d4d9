//! Child-workflow node.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{NodeExecuteError, NodeFactory, NodeInitError, NodeOutcome, WorkflowNode};
use crate::config::EventBusConfig;
use crate::context::WorkflowContext;
use crate::definition::{NodeDefinition, WorkflowDefinition, parse_iso8601_duration};
use crate::engine::WorkflowEngine;
use crate::events::EventEmitter;
use crate::message::{ExecutionScope, ValueMap};
use crate::types::WorkflowStatus;

/// Runs a child workflow with mapped input variables and maps selected
/// outputs back. The child's terminal status determines this node's
/// status, and child lifecycle events surface on the parent stream under
/// the hierarchical `parent/child` key.
pub struct SubflowNode {
    factory: Arc<NodeFactory>,
    node_id: String,
    child: Option<Arc<WorkflowDefinition>>,
    input_mappings: Vec<(String, String)>,
    output_mappings: Vec<(String, String)>,
    timeout: Option<Duration>,
    skip_validation: bool,
}

impl SubflowNode {
    pub fn new(factory: Arc<NodeFactory>) -> Self {
        Self {
            factory,
            node_id: String::new(),
            child: None,
            input_mappings: Vec::new(),
            output_mappings: Vec::new(),
            timeout: None,
            skip_validation: false,
        }
    }
}

fn mappings(definition: &NodeDefinition, option: &str) -> Vec<(String, String)> {
    definition
        .config_value(option)
        .and_then(Value::as_object)
        .map(|object| {
            object
                .iter()
                .filter_map(|(from, to)| to.as_str().map(|to| (from.clone(), to.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn timeout_option(definition: &NodeDefinition) -> Option<Duration> {
    match definition.config_value("Timeout") {
        Some(Value::Number(n)) => n.as_f64().map(Duration::from_secs_f64),
        Some(Value::String(s)) => parse_iso8601_duration(s),
        _ => None,
    }
}

#[async_trait]
impl WorkflowNode for SubflowNode {
    fn initialize(&mut self, definition: &NodeDefinition) -> Result<(), NodeInitError> {
        self.node_id = definition.node_id.clone();
        let child = if let Some(inline) = definition.config_value("WorkflowDefinition") {
            serde_json::from_value(inline.clone()).map_err(|e| NodeInitError::ChildGraph {
                node_id: definition.node_id.clone(),
                detail: e.to_string(),
            })?
        } else if let Some(path) = definition.config_str("WorkflowFilePath") {
            crate::loader::load_file(path).map_err(|e| NodeInitError::ChildGraph {
                node_id: definition.node_id.clone(),
                detail: e.to_string(),
            })?
        } else {
            return Err(NodeInitError::MissingOption {
                node_id: definition.node_id.clone(),
                option: "WorkflowFilePath or WorkflowDefinition".into(),
            });
        };
        self.child = Some(Arc::new(child));
        self.input_mappings = mappings(definition, "InputMappings");
        self.output_mappings = mappings(definition, "OutputMappings");
        self.timeout = timeout_option(definition);
        self.skip_validation = definition.config_bool("SkipValidation").unwrap_or(false);
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
                "subflow node was not initialized".into(),
            ));
        };

        // Parent -> child variable mapping; unmapped names fall back to the
        // invocation input so a bare subflow still sees its trigger data.
        let mut child_variables = ValueMap::default();
        for (parent_name, child_name) in &self.input_mappings {
            let value = ctx
                .variable(parent_name)
                .or_else(|| scope.input.get(parent_name).cloned())
                .unwrap_or(Value::Null);
            child_variables.insert(child_name.clone(), value);
        }
        if self.input_mappings.is_empty() {
            child_variables = scope.input.clone();
        }

        let mut child_config = self.factory.config().clone();
        child_config.skip_validation = self.skip_validation || child_config.skip_validation;
        child_config.event_bus = EventBusConfig::silent();
        let child_engine = WorkflowEngine::with_factory(child_config, Arc::clone(&self.factory));

        // Forward child lifecycle events under the hierarchical key. The
        // child holds no reference to the parent, only this stream.
        let mut child_events = child_engine.subscribe_events();
        let parent_emitter = ctx.emitter();
        let prefix = self.node_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Ok(event) = child_events.recv().await {
                let _ = parent_emitter.emit(event.prefixed(&prefix));
            }
        });

        let child_cancel = cancel.child_token();
        let result = child_engine
            .start(
                (**child_definition).clone(),
                child_variables,
                self.timeout,
                child_cancel,
            )
            .await;
        child_engine.shutdown().await;
        let _ = forwarder.await;

        let child_ctx = result.map_err(|e| NodeExecuteError::Failed(e.to_string()))?;
        match child_ctx.status() {
            WorkflowStatus::Completed => {
                for (child_name, parent_name) in &self.output_mappings {
                    let value = child_ctx.variable(child_name).unwrap_or(Value::Null);
                    ctx.set_variable(parent_name.clone(), value.clone());
                    scope.output.insert(parent_name.clone(), value);
                }
                scope.set_output(
                    "subflowInstanceId",
                    Value::String(child_ctx.instance_id.to_string()),
                );
                Ok(NodeOutcome::complete())
            }
            WorkflowStatus::Cancelled => Err(NodeExecuteError::Cancelled),
            status => Err(NodeExecuteError::Subflow {
                workflow_id: child_ctx.workflow_id().to_string(),
                status: status.to_string(),
            }),
        }
    }
}
