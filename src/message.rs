//! Messages exchanged between nodes, and the per-invocation execution scope.
//!
//! A [`NodeMessage`] is the unit of communication between nodes: `complete`,
//! `fail`, `progress`, or `next`. Every message carries the emitting node's
//! identity, a timestamp, a metadata bag, and an [`ExecutionScope`]: the
//! input/output/local mappings of the invocation that produced it. The
//! router reads the scope to evaluate edge conditions; downstream nodes
//! receive a copy of the completing scope's `output` as their `input`.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::MessageKind;

/// Key-value mapping used for node inputs, outputs, and variables.
pub type ValueMap = FxHashMap<String, Value>;

/// Per-invocation state handed to a node's `execute`.
///
/// `input` is inherited from the upstream node's output (or loop/branch
/// metadata) and treated as read-only by convention; `output` is the node's
/// product and the only part that propagates; `local` is scratch space;
/// `metadata` is diagnostic only. One scope exists per node invocation and
/// is owned exclusively by the invoking node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionScope {
    pub input: ValueMap,
    pub output: ValueMap,
    pub local: ValueMap,
    pub metadata: ValueMap,
}

impl ExecutionScope {
    /// Scope seeded with the given input mapping.
    #[must_use]
    pub fn with_input(input: ValueMap) -> Self {
        Self {
            input,
            ..Default::default()
        }
    }

    /// Read an input value by name.
    pub fn input_value(&self, name: &str) -> Option<&Value> {
        self.input.get(name)
    }

    /// Write an output value, replacing any previous binding.
    pub fn set_output(&mut self, name: impl Into<String>, value: Value) {
        self.output.insert(name.into(), value);
    }
}

/// Error descriptor attached to `fail` messages and failed node instances.
///
/// The cause chain is preserved as rendered strings so it survives
/// serialization into checkpoints and events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cause_chain: Vec<String>,
}

impl FailureInfo {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause_chain: Vec::new(),
        }
    }

    /// Capture an error and its `source()` chain.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut cause_chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            cause_chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: error.to_string(),
            cause_chain,
        }
    }

    /// The failure as a mapping suitable for a downstream node's `input`.
    #[must_use]
    pub fn to_input(&self, node_id: &str) -> ValueMap {
        let mut map = ValueMap::default();
        map.insert("error".into(), Value::String(self.message.clone()));
        map.insert("failedNodeId".into(), Value::String(node_id.to_string()));
        if !self.cause_chain.is_empty() {
            map.insert(
                "causes".into(),
                Value::Array(
                    self.cause_chain
                        .iter()
                        .map(|c| Value::String(c.clone()))
                        .collect(),
                ),
            );
        }
        map
    }
}

impl std::fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// A message emitted by a node instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeMessage {
    /// Node that emitted the message.
    pub source_node_id: String,
    /// Instance of the emitting node.
    pub source_instance_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub metadata: ValueMap,
    /// Scope of the emitting invocation; routing conditions evaluate
    /// against its `output`.
    pub scope: ExecutionScope,
    pub body: MessageBody,
}

/// Variant payloads of a [`NodeMessage`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MessageBody {
    /// Normal completion; `source_port` disambiguates edge selection.
    Complete { source_port: Option<String> },
    /// Failed invocation; routed along `on-fail` edges.
    Fail { failure: FailureInfo },
    /// Progress report; observational only, never routed to queues.
    Progress { fraction: f64, detail: String },
    /// One loop iteration; routed along `loop-body` edges.
    Next,
}

impl NodeMessage {
    pub fn complete(
        source_node_id: impl Into<String>,
        source_instance_id: Uuid,
        scope: ExecutionScope,
        source_port: Option<String>,
    ) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            source_instance_id,
            timestamp: Utc::now(),
            metadata: ValueMap::default(),
            scope,
            body: MessageBody::Complete { source_port },
        }
    }

    pub fn fail(
        source_node_id: impl Into<String>,
        source_instance_id: Uuid,
        scope: ExecutionScope,
        failure: FailureInfo,
    ) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            source_instance_id,
            timestamp: Utc::now(),
            metadata: ValueMap::default(),
            scope,
            body: MessageBody::Fail { failure },
        }
    }

    /// `next` message carrying one iteration's payload as the scope output.
    pub fn next(
        source_node_id: impl Into<String>,
        source_instance_id: Uuid,
        iteration_output: ValueMap,
    ) -> Self {
        let scope = ExecutionScope {
            output: iteration_output,
            ..Default::default()
        };
        Self {
            source_node_id: source_node_id.into(),
            source_instance_id,
            timestamp: Utc::now(),
            metadata: ValueMap::default(),
            scope,
            body: MessageBody::Next,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match &self.body {
            MessageBody::Complete { .. } => MessageKind::Complete,
            MessageBody::Fail { .. } => MessageKind::Fail,
            MessageBody::Progress { .. } => MessageKind::Progress,
            MessageBody::Next => MessageKind::Next,
        }
    }

    /// The source port, when this is a completion that set one.
    pub fn source_port(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Complete { source_port } => source_port.as_deref(),
            _ => None,
        }
    }
}
