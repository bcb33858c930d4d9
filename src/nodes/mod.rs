//! Node variants and the factory that builds them.
//!
//! A live node exposes two operations: `initialize` (fallible setup from
//! the definition, run once by the factory) and `execute` (one invocation
//! per leased message). Control-flow semantics (branch, switch, loops,
//! subflow, container, timer) are each a self-contained module; the
//! factory is a single match on the runtime kind.

mod branch;
mod container;
mod loops;
mod native;
mod noop;
mod script;
mod subflow;
mod switch;
mod timer;

pub use branch::BranchNode;
pub use container::ContainerNode;
pub use loops::{ForeachNode, WhileNode};
pub use native::{NativeBuilder, NativeNodeRegistry};
pub use noop::NoopNode;
pub use script::{AssignmentScriptHost, CompiledScript, ScriptHost, ScriptNode};
pub use subflow::SubflowNode;
pub use switch::SwitchNode;
pub use timer::TimerNode;

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::context::WorkflowContext;
use crate::definition::NodeDefinition;
use crate::message::{ExecutionScope, ValueMap};
use crate::types::RuntimeKind;

/// What a successful invocation hands back to its supervisor.
///
/// `iterations` become `next` messages routed before the completion; loop
/// nodes use them to fan one invocation into many body runs.
#[derive(Clone, Debug, Default)]
pub struct NodeOutcome {
    pub source_port: Option<String>,
    pub iterations: Vec<ValueMap>,
}

impl NodeOutcome {
    #[must_use]
    pub fn complete() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_port(port: impl Into<String>) -> Self {
        Self {
            source_port: Some(port.into()),
            iterations: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_iterations(mut self, iterations: Vec<ValueMap>) -> Self {
        self.iterations = iterations;
        self
    }
}

/// Errors raised while turning a definition into a live node.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeInitError {
    #[error("node `{node_id}` is missing required option `{option}`")]
    #[diagnostic(code(loomflow::nodes::missing_option))]
    MissingOption { node_id: String, option: String },

    #[error("node `{node_id}` has an invalid `{option}`: {detail}")]
    #[diagnostic(code(loomflow::nodes::bad_option))]
    BadOption {
        node_id: String,
        option: String,
        detail: String,
    },

    #[error("script for node `{node_id}` failed to compile: {detail}")]
    #[diagnostic(
        code(loomflow::nodes::script),
        help("Script syntax errors surface at initialize so the graph is rejected before running.")
    )]
    Script { node_id: String, detail: String },

    #[error("no native implementation registered for `{reference}`")]
    #[diagnostic(
        code(loomflow::nodes::unknown_native),
        help("Register the implementation with the engine before starting the workflow.")
    )]
    UnknownNative { reference: String },

    #[error("child graph of node `{node_id}` is invalid: {detail}")]
    #[diagnostic(code(loomflow::nodes::child_graph))]
    ChildGraph { node_id: String, detail: String },
}

/// Errors raised by a node invocation. The supervisor converts these into
/// `fail` messages; they never unwind past it.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeExecuteError {
    #[error("{0}")]
    #[diagnostic(code(loomflow::nodes::failed))]
    Failed(String),

    #[error("execution cancelled")]
    #[diagnostic(code(loomflow::nodes::cancelled))]
    Cancelled,

    #[error("while node `{node_id}` exceeded its iteration limit of {limit}")]
    #[diagnostic(
        code(loomflow::nodes::iteration_limit),
        help("The loop condition never became false; raise MaxIterations only if that is intended.")
    )]
    IterationLimit { node_id: String, limit: u64 },

    #[error("child `{child_id}` failed: {detail}")]
    #[diagnostic(code(loomflow::nodes::child_failed))]
    ChildFailed { child_id: String, detail: String },

    #[error("subflow `{workflow_id}` ended {status}")]
    #[diagnostic(code(loomflow::nodes::subflow))]
    Subflow { workflow_id: String, status: String },
}

/// A live workflow node.
#[async_trait]
pub trait WorkflowNode: Send + Sync {
    /// Fallible setup from the definition; run once by the factory.
    fn initialize(&mut self, _definition: &NodeDefinition) -> Result<(), NodeInitError> {
        Ok(())
    }

    /// One invocation. `scope.input` holds the upstream output; the node
    /// writes its product to `scope.output`. Long-running work must watch
    /// `cancel` and return promptly once it fires.
    async fn execute(
        &self,
        ctx: &WorkflowContext,
        scope: &mut ExecutionScope,
        cancel: &CancellationToken,
    ) -> Result<NodeOutcome, NodeExecuteError>;
}

/// Builds live nodes from definitions: one match on the runtime kind.
///
/// The factory is shared (`Arc`) so subflow and container nodes can build
/// their child graphs with the same native registry and script host.
pub struct NodeFactory {
    config: EngineConfig,
    natives: NativeNodeRegistry,
    script_host: RwLock<Arc<dyn ScriptHost>>,
}

impl NodeFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            natives: NativeNodeRegistry::default(),
            script_host: RwLock::new(Arc::new(AssignmentScriptHost)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a native implementation under an assembly reference.
    pub fn register_native(&self, reference: impl Into<String>, builder: NativeBuilder) {
        self.natives.register(reference, builder);
    }

    /// Swap the script host used by inline-script and script-file nodes.
    pub fn set_script_host(&self, host: Arc<dyn ScriptHost>) {
        *self.script_host.write() = host;
    }

    /// Build and initialize a node.
    pub fn build(
        self: &Arc<Self>,
        definition: &NodeDefinition,
    ) -> Result<Arc<dyn WorkflowNode>, NodeInitError> {
        let mut node: Box<dyn WorkflowNode> = match definition.runtime_type {
            RuntimeKind::CompiledNative => self.natives.build(definition)?,
            RuntimeKind::InlineScript | RuntimeKind::ScriptFile => {
                Box::new(ScriptNode::new(self.script_host.read().clone()))
            }
            RuntimeKind::Branch => Box::new(BranchNode::default()),
            RuntimeKind::Switch => Box::new(SwitchNode::default()),
            RuntimeKind::LoopForeach => Box::new(ForeachNode::default()),
            RuntimeKind::LoopWhile => {
                Box::new(WhileNode::new(self.config.loop_iteration_cap))
            }
            RuntimeKind::Subflow => Box::new(SubflowNode::new(Arc::clone(self))),
            RuntimeKind::Container => Box::new(ContainerNode::new(Arc::clone(self))),
            RuntimeKind::Timer => Box::new(TimerNode::default()),
            RuntimeKind::Noop => Box::new(NoopNode),
        };
        node.initialize(definition)?;
        Ok(Arc::from(node))
    }
}

/// Resolve a value-producing expression in node context.
///
/// Paths read from the invocation scope (`input.*`, `output.*`) or the
/// workflow variables (`variables.*`); anything else is tried as a JSON
/// literal and finally taken as a plain string. Missing paths yield null.
pub(crate) fn resolve_expr(expr: &str, scope: &ExecutionScope, variables: &ValueMap) -> Value {
    let trimmed = expr.trim();
    for (root, map) in [
        ("input.", &scope.input),
        ("output.", &scope.output),
        ("variables.", variables),
    ] {
        if let Some(path) = trimmed.strip_prefix(root) {
            return resolve_path(map, path);
        }
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

fn resolve_path(map: &ValueMap, path: &str) -> Value {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return Value::Null;
    };
    let mut current = match map.get(first) {
        Some(value) => value.clone(),
        None => return Value::Null,
    };
    for segment in segments {
        current = match current.get(segment) {
            Some(value) => value.clone(),
            None => return Value::Null,
        };
    }
    current
}
