//! Typed lifecycle events published during a workflow run.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::types::{NodeStatus, WorkflowStatus};

/// One observable occurrence in a run.
///
/// Events from child graphs (subflows, containers) keep observability
/// unambiguous by prefixing the node path with the hierarchical key
/// `parent/child`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Event {
    Workflow(WorkflowEvent),
    Node(NodeEvent),
    Diagnostic(DiagnosticEvent),
}

/// Workflow-level transitions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WorkflowEvent {
    pub instance_id: Uuid,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Node-instance transitions, including progress reports.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeEvent {
    /// Hierarchical node path; plain node id at the top level,
    /// `parent/child` inside subflows and containers.
    pub node_path: String,
    pub node_instance_id: Uuid,
    pub workflow_instance_id: Uuid,
    pub transition: NodeTransition,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeTransition {
    Started,
    Completed,
    Failed,
    Cancelled,
    Progress,
}

impl NodeTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeTransition::Started => "started",
            NodeTransition::Completed => "completed",
            NodeTransition::Failed => "failed",
            NodeTransition::Cancelled => "cancelled",
            NodeTransition::Progress => "progress",
        }
    }

    /// The node status a transition settles into, for the terminal ones.
    pub fn status(&self) -> Option<NodeStatus> {
        match self {
            NodeTransition::Completed => Some(NodeStatus::Completed),
            NodeTransition::Failed => Some(NodeStatus::Failed),
            NodeTransition::Cancelled => Some(NodeStatus::Cancelled),
            NodeTransition::Started => Some(NodeStatus::Running),
            NodeTransition::Progress => None,
        }
    }
}

/// Free-form diagnostics (engine internals, sweep reports, routing notes).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticEvent {
    pub scope: String,
    pub message: String,
}

impl Event {
    pub fn workflow(
        instance_id: Uuid,
        workflow_id: impl Into<String>,
        status: WorkflowStatus,
        detail: Option<String>,
    ) -> Self {
        Event::Workflow(WorkflowEvent {
            instance_id,
            workflow_id: workflow_id.into(),
            status,
            timestamp: Utc::now(),
            detail,
        })
    }

    pub fn node(
        node_path: impl Into<String>,
        node_instance_id: Uuid,
        workflow_instance_id: Uuid,
        transition: NodeTransition,
        detail: Option<String>,
    ) -> Self {
        Event::Node(NodeEvent {
            node_path: node_path.into(),
            node_instance_id,
            workflow_instance_id,
            transition,
            timestamp: Utc::now(),
            detail,
        })
    }

    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Diagnostic(DiagnosticEvent {
            scope: scope.into(),
            message: message.into(),
        })
    }

    /// Re-scope a node event under a parent, yielding the `parent/child`
    /// hierarchical path. Non-node events pass through unchanged.
    #[must_use]
    pub fn prefixed(self, parent: &str) -> Self {
        match self {
            Event::Node(mut node) => {
                node.node_path = format!("{parent}/{}", node.node_path);
                Event::Node(node)
            }
            other => other,
        }
    }

    /// Normalized JSON rendering:
    /// `{"type", "scope", "message", "timestamp", "metadata"}`.
    pub fn to_json_value(&self) -> Value {
        match self {
            Event::Workflow(wf) => json!({
                "type": "workflow",
                "scope": wf.workflow_id,
                "message": wf.detail.clone().unwrap_or_else(|| wf.status.to_string()),
                "timestamp": wf.timestamp.to_rfc3339(),
                "metadata": {
                    "instance_id": wf.instance_id,
                    "status": wf.status,
                },
            }),
            Event::Node(node) => json!({
                "type": "node",
                "scope": node.node_path,
                "message": node.detail.clone().unwrap_or_else(|| node.transition.as_str().to_string()),
                "timestamp": node.timestamp.to_rfc3339(),
                "metadata": {
                    "node_instance_id": node.node_instance_id,
                    "workflow_instance_id": node.workflow_instance_id,
                    "transition": node.transition.as_str(),
                },
            }),
            Event::Diagnostic(diag) => json!({
                "type": "diagnostic",
                "scope": diag.scope,
                "message": diag.message,
                "timestamp": Utc::now().to_rfc3339(),
                "metadata": {},
            }),
        }
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_json_value())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Workflow(wf) => match &wf.detail {
                Some(detail) => write!(f, "[{}] {} ({detail})", wf.workflow_id, wf.status),
                None => write!(f, "[{}] {}", wf.workflow_id, wf.status),
            },
            Event::Node(node) => match &node.detail {
                Some(detail) => write!(
                    f,
                    "[{}] {}: {detail}",
                    node.node_path,
                    node.transition.as_str()
                ),
                None => write!(f, "[{}] {}", node.node_path, node.transition.as_str()),
            },
            Event::Diagnostic(diag) => write!(f, "{}: {}", diag.scope, diag.message),
        }
    }
}
