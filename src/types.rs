//! Core vocabulary for the Loomflow orchestration engine.
//!
//! This module defines the discriminants shared by the whole crate: node
//! runtime kinds, edge kinds, message kinds, and the status enums for node
//! instances and workflow runs. These are the domain concepts that define
//! what a workflow *is*; runtime machinery (queues, supervisors) lives in
//! its own modules.
//!
//! Every enum here carries a stable string form because the same values
//! appear in graph files, checkpoints, and events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a node's behavior is supplied at runtime.
///
/// The factory in [`crate::nodes`] matches on this discriminant to build a
/// live node object from a [`NodeDefinition`](crate::definition::NodeDefinition).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    /// Externally supplied implementation resolved from a registry.
    CompiledNative,
    /// Expression/statement block embedded in the definition.
    InlineScript,
    /// Script text loaded from a path at initialize.
    ScriptFile,
    /// Two-way conditional completing on `true-branch`/`false-branch`.
    Branch,
    /// Case-map dispatch completing on the matched case port.
    Switch,
    /// Per-item iteration over an evaluated collection.
    LoopForeach,
    /// Condition-guarded iteration with a feedback edge.
    LoopWhile,
    /// Runs a child workflow with variable mappings.
    Subflow,
    /// Embeds a child graph executed by a mini-engine.
    Container,
    /// Cron-scheduled trigger node.
    Timer,
    /// Completes immediately after a yield.
    Noop,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::CompiledNative => "compiled-native",
            RuntimeKind::InlineScript => "inline-script",
            RuntimeKind::ScriptFile => "script-file",
            RuntimeKind::Branch => "branch",
            RuntimeKind::Switch => "switch",
            RuntimeKind::LoopForeach => "loop-foreach",
            RuntimeKind::LoopWhile => "loop-while",
            RuntimeKind::Subflow => "subflow",
            RuntimeKind::Container => "container",
            RuntimeKind::Timer => "timer",
            RuntimeKind::Noop => "noop",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of an edge, determining which message kind and source-port
/// combinations activate it.
///
/// The activation table lives in [`crate::router`]; the short version:
/// `Next` messages take `LoopBody` edges, `Fail` takes `OnFail`, and
/// `Complete` takes everything else subject to source-port matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    OnComplete,
    OnFail,
    OnCancel,
    /// Carries one loop iteration into the loop body.
    LoopBody,
    TrueBranch,
    FalseBranch,
    SwitchCase,
    /// Taken when a loop finishes its full iteration sequence.
    LoopExit,
    /// Feedback lane from the tail of a while-loop body back to the loop
    /// node, re-queueing it for the next condition check.
    IterationCheck,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::OnComplete => "on-complete",
            EdgeKind::OnFail => "on-fail",
            EdgeKind::OnCancel => "on-cancel",
            EdgeKind::LoopBody => "loop-body",
            EdgeKind::TrueBranch => "true-branch",
            EdgeKind::FalseBranch => "false-branch",
            EdgeKind::SwitchCase => "switch-case",
            EdgeKind::LoopExit => "loop-exit",
            EdgeKind::IterationCheck => "iteration-check",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminant of a [`NodeMessage`](crate::message::NodeMessage).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Complete,
    Fail,
    Progress,
    Next,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Complete => "complete",
            MessageKind::Fail => "fail",
            MessageKind::Progress => "progress",
            MessageKind::Next => "next",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of one node instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl NodeStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Cancelled
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Aggregate status of a workflow run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Process exit status for CLI hosts: 0 completed, 2 runtime failure,
    /// 3 cancelled. Validation failures exit 1 before a run ever starts.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkflowStatus::Completed => 0,
            WorkflowStatus::Cancelled => 3,
            _ => 2,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_kind_serde_uses_kebab_case() {
        let json = serde_json::to_string(&RuntimeKind::LoopForeach).unwrap();
        assert_eq!(json, "\"loop-foreach\"");
        let back: RuntimeKind = serde_json::from_str("\"inline-script\"").unwrap();
        assert_eq!(back, RuntimeKind::InlineScript);
    }

    #[test]
    fn edge_kind_display_matches_wire_form() {
        assert_eq!(EdgeKind::IterationCheck.to_string(), "iteration-check");
        let parsed: EdgeKind = serde_json::from_str("\"true-branch\"").unwrap();
        assert_eq!(parsed, EdgeKind::TrueBranch);
    }

    #[test]
    fn terminal_statuses() {
        assert!(NodeStatus::Cancelled.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
    }

    #[test]
    fn exit_codes_follow_cli_contract() {
        assert_eq!(WorkflowStatus::Completed.exit_code(), 0);
        assert_eq!(WorkflowStatus::Failed.exit_code(), 2);
        assert_eq!(WorkflowStatus::Cancelled.exit_code(), 3);
    }
}
