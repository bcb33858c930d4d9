//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use loomflow::config::EngineConfig;
use loomflow::context::WorkflowContext;
use loomflow::definition::{EdgeDefinition, NodeDefinition, WorkflowDefinition};
use loomflow::engine::WorkflowEngine;
use loomflow::message::{ExecutionScope, ValueMap};
use loomflow::nodes::{NodeExecuteError, NodeOutcome, WorkflowNode};
use loomflow::types::{EdgeKind, RuntimeKind};

/// Per-execution record captured by the test natives.
#[derive(Clone, Debug)]
pub struct ExecRecord {
    pub node_id: String,
    pub input: ValueMap,
}

pub type ExecLog = Arc<Mutex<Vec<ExecRecord>>>;

/// Engine tuned for fast tests plus a shared execution log.
pub struct TestRig {
    pub engine: WorkflowEngine,
    pub log: ExecLog,
}

impl TestRig {
    pub fn new() -> Self {
        let config = EngineConfig::default()
            .with_visibility_timeout(Duration::from_millis(200))
            .with_grace_period(Duration::from_millis(500));
        Self::with_config(config)
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let engine = WorkflowEngine::new(config);
        let log: ExecLog = Arc::new(Mutex::new(Vec::new()));

        let recorder = log.clone();
        engine.register_native(
            "test.echo",
            Arc::new(move |def| {
                Ok(Box::new(EchoNode {
                    node_id: def.node_id.clone(),
                    log: recorder.clone(),
                }))
            }),
        );

        let recorder = log.clone();
        engine.register_native(
            "test.sleep",
            Arc::new(move |def| {
                Ok(Box::new(SleepNode {
                    node_id: def.node_id.clone(),
                    millis: def.config_u64("Millis").unwrap_or(1000),
                    log: recorder.clone(),
                }))
            }),
        );

        let recorder = log.clone();
        engine.register_native(
            "test.fail",
            Arc::new(move |def| {
                Ok(Box::new(FailNode {
                    node_id: def.node_id.clone(),
                    log: recorder.clone(),
                }))
            }),
        );

        let recorder = log.clone();
        engine.register_native(
            "test.panic",
            Arc::new(move |def| {
                Ok(Box::new(PanicNode {
                    node_id: def.node_id.clone(),
                    log: recorder.clone(),
                }))
            }),
        );

        Self { engine, log }
    }

    pub fn executions_of(&self, node_id: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|r| r.node_id == node_id)
            .count()
    }

    pub fn executed_nodes(&self) -> Vec<String> {
        self.log.lock().iter().map(|r| r.node_id.clone()).collect()
    }
}

/// Copies input to output and records the invocation.
struct EchoNode {
    node_id: String,
    log: ExecLog,
}

#[async_trait]
impl WorkflowNode for EchoNode {
    async fn execute(
        &self,
        _ctx: &WorkflowContext,
        scope: &mut ExecutionScope,
        _cancel: &CancellationToken,
    ) -> Result<NodeOutcome, NodeExecuteError> {
        self.log.lock().push(ExecRecord {
            node_id: self.node_id.clone(),
            input: scope.input.clone(),
        });
        scope.output = scope.input.clone();
        Ok(NodeOutcome::complete())
    }
}

/// Cancellation-aware sleeper.
struct SleepNode {
    node_id: String,
    millis: u64,
    log: ExecLog,
}

#[async_trait]
impl WorkflowNode for SleepNode {
    async fn execute(
        &self,
        _ctx: &WorkflowContext,
        scope: &mut ExecutionScope,
        cancel: &CancellationToken,
    ) -> Result<NodeOutcome, NodeExecuteError> {
        self.log.lock().push(ExecRecord {
            node_id: self.node_id.clone(),
            input: scope.input.clone(),
        });
        tokio::select! {
            _ = cancel.cancelled() => Err(NodeExecuteError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(self.millis)) => {
                scope.output = scope.input.clone();
                Ok(NodeOutcome::complete())
            }
        }
    }
}

/// Always returns a handled failure.
struct FailNode {
    node_id: String,
    log: ExecLog,
}

#[async_trait]
impl WorkflowNode for FailNode {
    async fn execute(
        &self,
        _ctx: &WorkflowContext,
        scope: &mut ExecutionScope,
        _cancel: &CancellationToken,
    ) -> Result<NodeOutcome, NodeExecuteError> {
        self.log.lock().push(ExecRecord {
            node_id: self.node_id.clone(),
            input: scope.input.clone(),
        });
        Err(NodeExecuteError::Failed("exploded".into()))
    }
}

/// Crashes its task, leaking the lease.
struct PanicNode {
    node_id: String,
    log: ExecLog,
}

#[async_trait]
impl WorkflowNode for PanicNode {
    async fn execute(
        &self,
        _ctx: &WorkflowContext,
        _scope: &mut ExecutionScope,
        _cancel: &CancellationToken,
    ) -> Result<NodeOutcome, NodeExecuteError> {
        self.log.lock().push(ExecRecord {
            node_id: self.node_id.clone(),
            input: ValueMap::default(),
        });
        panic!("deliberate crash in {}", self.node_id);
    }
}

// ----------------------------------------------------------------------
// Definition shorthand
// ----------------------------------------------------------------------

pub fn noop(id: &str) -> NodeDefinition {
    NodeDefinition::new(id, RuntimeKind::Noop)
}

pub fn script(id: &str, body: &str) -> NodeDefinition {
    NodeDefinition::new(id, RuntimeKind::InlineScript).with_script(body)
}

pub fn native(id: &str, reference: &str) -> NodeDefinition {
    let mut def = NodeDefinition::new(id, RuntimeKind::CompiledNative);
    def.assembly_reference = Some(reference.to_string());
    def
}

pub fn on_complete(from: &str, to: &str) -> EdgeDefinition {
    EdgeDefinition::new(from, to, EdgeKind::OnComplete)
}

pub fn graph(id: &str) -> WorkflowDefinition {
    WorkflowDefinition::new(id)
}

pub fn config_value(def: NodeDefinition, key: &str, value: Value) -> NodeDefinition {
    def.with_config(key, value)
}
