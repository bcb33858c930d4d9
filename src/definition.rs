//! Immutable workflow definitions: nodes, edges, and default variables.
//!
//! These types mirror the graph file format one-to-one (camelCase field
//! names, `connections` with an `edges` alias, ISO-8601 durations kept in
//! their textual form) so that a parse → serialize round trip preserves
//! every recognized field. Validation of the structure lives in
//! [`crate::validation`]; this module only models it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::ValueMap;
use crate::types::{EdgeKind, MessageKind, RuntimeKind};

/// A complete, immutable workflow graph definition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    /// Explicit entry node; when absent, entry points are the nodes with no
    /// incoming edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point_node_id: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default, alias = "edges")]
    pub connections: Vec<EdgeDefinition>,
    #[serde(default, skip_serializing_if = "ValueMap::is_empty")]
    pub default_variables: ValueMap,
}

impl WorkflowDefinition {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            ..Default::default()
        }
    }

    /// Builder-style node registration.
    #[must_use]
    pub fn with_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    /// Builder-style edge registration.
    #[must_use]
    pub fn with_edge(mut self, edge: EdgeDefinition) -> Self {
        self.connections.push(edge);
        self
    }

    #[must_use]
    pub fn with_entry_point(mut self, node_id: impl Into<String>) -> Self {
        self.entry_point_node_id = Some(node_id.into());
        self
    }

    #[must_use]
    pub fn with_default_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.default_variables.insert(name.into(), value);
        self
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn outgoing_edges<'a>(
        &'a self,
        node_id: &'a str,
    ) -> impl Iterator<Item = &'a EdgeDefinition> {
        self.connections
            .iter()
            .filter(move |e| e.source_node_id == node_id)
    }

    pub fn incoming_edges<'a>(
        &'a self,
        node_id: &'a str,
    ) -> impl Iterator<Item = &'a EdgeDefinition> {
        self.connections
            .iter()
            .filter(move |e| e.target_node_id == node_id)
    }

    /// Entry points: the explicit entry node when named, otherwise every
    /// node with no incoming edges. Iteration-check feedback edges do not
    /// count as incoming for entry detection (a while node is still an
    /// entry if its only inbound edge is its own feedback lane).
    pub fn entry_points(&self) -> Vec<&NodeDefinition> {
        if let Some(entry) = &self.entry_point_node_id {
            return self.node(entry).into_iter().collect();
        }
        self.nodes
            .iter()
            .filter(|n| {
                !self
                    .incoming_edges(&n.node_id)
                    .any(|e| e.kind != EdgeKind::IterationCheck)
            })
            .collect()
    }
}

/// Definition of a single node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefinition {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Free-form display type, distinct from the runtime discriminant.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    pub runtime_type: RuntimeKind,
    /// Registry key for `compiled-native` nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembly_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_content: Option<String>,
    #[serde(default, skip_serializing_if = "ValueMap::is_empty")]
    pub configuration: ValueMap,
}

impl NodeDefinition {
    pub fn new(node_id: impl Into<String>, runtime_type: RuntimeKind) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: None,
            node_type: None,
            runtime_type,
            assembly_reference: None,
            script_path: None,
            script_content: None,
            configuration: ValueMap::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.configuration.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_script(mut self, content: impl Into<String>) -> Self {
        self.script_content = Some(content.into());
        self
    }

    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.configuration.get(key)
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.configuration.get(key).and_then(Value::as_str)
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.configuration.get(key).and_then(Value::as_bool)
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.configuration.get(key).and_then(Value::as_u64)
    }

    /// Display name, falling back to the node id.
    pub fn display_name(&self) -> &str {
        self.node_name.as_deref().unwrap_or(&self.node_id)
    }
}

/// A typed edge between two nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    pub source_node_id: String,
    pub target_node_id: String,
    #[serde(rename = "type")]
    pub kind: EdgeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// ISO-8601 duration, kept textual for round-trip fidelity. Use
    /// [`visibility_timeout`](Self::visibility_timeout) for the parsed form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_timeout: Option<String>,
}

impl EdgeDefinition {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        kind: EdgeKind,
    ) -> Self {
        Self {
            edge_id: None,
            source_node_id: source.into(),
            target_node_id: target.into(),
            kind,
            message_type: None,
            condition: None,
            source_port: None,
            target_port: None,
            max_retries: None,
            visibility_timeout: None,
        }
    }

    #[must_use]
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    #[must_use]
    pub fn with_source_port(mut self, port: impl Into<String>) -> Self {
        self.source_port = Some(port.into());
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn with_visibility_timeout(mut self, iso: impl Into<String>) -> Self {
        self.visibility_timeout = Some(iso.into());
        self
    }

    /// Parsed per-edge visibility timeout, if present and well-formed.
    pub fn visibility_timeout(&self) -> Option<Duration> {
        self.visibility_timeout
            .as_deref()
            .and_then(parse_iso8601_duration)
    }
}

/// Parse an ISO-8601 duration of the `PnDTnHnMnS` family (fractional
/// seconds allowed). Returns `None` on malformed input; the validator turns
/// that into a graph error.
pub fn parse_iso8601_duration(text: &str) -> Option<Duration> {
    let rest = text.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut total = 0.0f64;
    let mut parse_section = |section: &str, units: &[(char, f64)]| -> Option<()> {
        let mut number = String::new();
        for c in section.chars() {
            if c.is_ascii_digit() || c == '.' {
                number.push(c);
            } else {
                let scale = units.iter().find(|(u, _)| *u == c).map(|(_, s)| *s)?;
                let value: f64 = number.parse().ok()?;
                total += value * scale;
                number.clear();
            }
        }
        if number.is_empty() { Some(()) } else { None }
    };

    parse_section(date_part, &[('D', 86_400.0), ('W', 604_800.0)])?;
    parse_section(time_part, &[('H', 3_600.0), ('M', 60.0), ('S', 1.0)])?;
    if total.is_finite() && total >= 0.0 {
        Some(Duration::from_secs_f64(total))
    } else {
        None
    }
}
