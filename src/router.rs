//! Edge-driven message routing.
//!
//! The router translates a node-emitted message into zero or more enqueue
//! operations on downstream queues. Edge selection is a three-stage filter:
//! edge kind against message kind and source port, source-port equality
//! when the edge pins one, and the optional condition expression evaluated
//! against the emitting scope's output plus workflow variables.
//!
//! Fan-out is concurrent-by-construction: sibling targets receive their
//! envelopes in definition order but with no ordering promise between their
//! consumers.

use rustc_hash::FxHashMap;

use crate::condition::CompiledCondition;
use crate::context::WorkflowContext;
use crate::definition::{EdgeDefinition, WorkflowDefinition};
use crate::message::{MessageBody, NodeMessage, ValueMap};
use crate::queue::DeliveryOptions;
use crate::types::{EdgeKind, MessageKind};

/// One edge with its condition pre-compiled at graph load.
#[derive(Clone, Debug)]
struct CompiledEdge {
    definition: EdgeDefinition,
    condition: Option<CompiledCondition>,
}

/// Outcome of routing one message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteReport {
    /// Edges that matched and enqueued successfully.
    pub enqueued: usize,
    /// Edges that matched but whose target enqueue failed (missing queue,
    /// saturated queue). The edge is treated as not taken.
    pub failed: usize,
}

impl RouteReport {
    /// True when a matched fail message found no handler.
    pub fn nothing_enqueued(&self) -> bool {
        self.enqueued == 0
    }
}

/// Routes messages along the outgoing edges of their source node.
pub struct MessageRouter {
    edges_by_source: FxHashMap<String, Vec<CompiledEdge>>,
}

impl MessageRouter {
    /// Build the routing index. Condition syntax errors surface here, but
    /// validation has normally rejected them already.
    pub fn compile(
        definition: &WorkflowDefinition,
    ) -> Result<Self, crate::condition::ConditionError> {
        let mut edges_by_source: FxHashMap<String, Vec<CompiledEdge>> = FxHashMap::default();
        for edge in &definition.connections {
            let condition = match &edge.condition {
                Some(text) => Some(CompiledCondition::compile(text)?),
                None => None,
            };
            edges_by_source
                .entry(edge.source_node_id.clone())
                .or_default()
                .push(CompiledEdge {
                    definition: edge.clone(),
                    condition,
                });
        }
        Ok(Self { edges_by_source })
    }

    /// Route a message, enqueueing a derived envelope per surviving edge.
    pub fn route(&self, message: &NodeMessage, ctx: &WorkflowContext) -> RouteReport {
        let mut report = RouteReport::default();
        let Some(edges) = self.edges_by_source.get(&message.source_node_id) else {
            return report;
        };

        let variables = ctx.variables_snapshot();
        for edge in edges {
            if !edge_matches(&edge.definition, message) {
                continue;
            }
            if let Some(condition) = &edge.condition {
                if !condition.evaluate(&message.scope.output, &variables) {
                    tracing::debug!(
                        source = %edge.definition.source_node_id,
                        target = %edge.definition.target_node_id,
                        condition = condition.source(),
                        "edge condition evaluated false"
                    );
                    continue;
                }
            }

            let Some(queue) = ctx.queue(&edge.definition.target_node_id) else {
                // A missing target is a validation defect; record and move on
                // rather than retrying the source.
                tracing::warn!(
                    source = %edge.definition.source_node_id,
                    target = %edge.definition.target_node_id,
                    "route target has no queue; edge treated as not taken"
                );
                report.failed += 1;
                continue;
            };

            let downstream = derive_downstream(message, &edge.definition);
            let options = DeliveryOptions {
                max_retries: edge.definition.max_retries,
                visibility_timeout: edge.definition.visibility_timeout(),
            };
            match queue.enqueue(downstream, options) {
                Ok(_) => report.enqueued += 1,
                Err(err) => {
                    tracing::warn!(
                        target = %edge.definition.target_node_id,
                        %err,
                        "enqueue failed; edge treated as not taken"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }
}

/// Edge-kind activation table.
///
/// `loop-body` edges activate only on `next` messages so a loop's final
/// completion never re-runs the body; the completion (source port
/// `loop-body` or `loop-exit`) leaves through `loop-exit` edges.
/// `iteration-check` edges are the feedback lane back to a while node and
/// accept any completion. `on-cancel` edges are reserved for hosts that
/// route after a cancelled resume; the engine never emits a message that
/// matches them mid-run.
fn edge_matches(edge: &EdgeDefinition, message: &NodeMessage) -> bool {
    let activated = match (edge.kind, message.kind()) {
        (EdgeKind::OnComplete, MessageKind::Complete) => true,
        (EdgeKind::OnFail, MessageKind::Fail) => true,
        (EdgeKind::LoopBody, MessageKind::Next) => true,
        (EdgeKind::TrueBranch, MessageKind::Complete) => {
            message.source_port() == Some("true-branch")
        }
        (EdgeKind::FalseBranch, MessageKind::Complete) => {
            message.source_port() == Some("false-branch")
        }
        (EdgeKind::SwitchCase, MessageKind::Complete) => match &edge.source_port {
            Some(case) => message.source_port() == Some(case.as_str()),
            None => false,
        },
        (EdgeKind::LoopExit, MessageKind::Complete) => {
            matches!(message.source_port(), Some("loop-body") | Some("loop-exit"))
        }
        (EdgeKind::IterationCheck, MessageKind::Complete) => true,
        _ => false,
    };
    if !activated {
        return false;
    }
    // A pinned source port must match exactly; switch-case edges already
    // consumed theirs above.
    if edge.kind != EdgeKind::SwitchCase {
        if let Some(port) = &edge.source_port {
            return message.source_port() == Some(port.as_str());
        }
    }
    true
}

/// Build the downstream message: completions and iterations hand their
/// output forward as the target's input; failures hand a failure
/// descriptor.
fn derive_downstream(message: &NodeMessage, edge: &EdgeDefinition) -> NodeMessage {
    let input: ValueMap = match &message.body {
        MessageBody::Fail { failure } => failure.to_input(&message.source_node_id),
        _ => message.scope.output.clone(),
    };
    let mut downstream = message.clone();
    downstream.scope = crate::message::ExecutionScope::with_input(input);
    if let Some(port) = &edge.target_port {
        downstream
            .metadata
            .insert("targetPort".into(), serde_json::Value::String(port.clone()));
    }
    downstream
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ExecutionScope;
    use uuid::Uuid;

    fn complete(port: Option<&str>) -> NodeMessage {
        NodeMessage::complete(
            "src",
            Uuid::new_v4(),
            ExecutionScope::default(),
            port.map(str::to_string),
        )
    }

    fn edge(kind: EdgeKind) -> EdgeDefinition {
        EdgeDefinition::new("src", "dst", kind)
    }

    #[test]
    fn activation_table() {
        assert!(edge_matches(&edge(EdgeKind::OnComplete), &complete(None)));
        assert!(edge_matches(
            &edge(EdgeKind::TrueBranch),
            &complete(Some("true-branch"))
        ));
        assert!(!edge_matches(
            &edge(EdgeKind::TrueBranch),
            &complete(Some("false-branch"))
        ));
        assert!(edge_matches(
            &edge(EdgeKind::LoopExit),
            &complete(Some("loop-body"))
        ));
        assert!(!edge_matches(&edge(EdgeKind::LoopExit), &complete(None)));
        assert!(edge_matches(&edge(EdgeKind::IterationCheck), &complete(None)));

        let next = NodeMessage::next("src", Uuid::new_v4(), ValueMap::default());
        assert!(edge_matches(&edge(EdgeKind::LoopBody), &next));
        assert!(!edge_matches(&edge(EdgeKind::OnComplete), &next));
        // Final loop completion must not re-enter the body.
        assert!(!edge_matches(
            &edge(EdgeKind::LoopBody),
            &complete(Some("loop-body"))
        ));

        let fail = NodeMessage::fail(
            "src",
            Uuid::new_v4(),
            ExecutionScope::default(),
            crate::message::FailureInfo::msg("x"),
        );
        assert!(edge_matches(&edge(EdgeKind::OnFail), &fail));
        assert!(!edge_matches(&edge(EdgeKind::OnComplete), &fail));
        assert!(!edge_matches(&edge(EdgeKind::OnCancel), &fail));
    }

    #[test]
    fn switch_case_edges_match_their_port() {
        let case_edge = edge(EdgeKind::SwitchCase).with_source_port("red");
        assert!(edge_matches(&case_edge, &complete(Some("red"))));
        assert!(!edge_matches(&case_edge, &complete(Some("blue"))));
        // A switch-case edge without a pinned port matches nothing.
        assert!(!edge_matches(&edge(EdgeKind::SwitchCase), &complete(Some("red"))));
    }

    #[test]
    fn pinned_source_port_filters_on_complete() {
        let pinned = edge(EdgeKind::OnComplete).with_source_port("side");
        assert!(edge_matches(&pinned, &complete(Some("side"))));
        assert!(!edge_matches(&pinned, &complete(None)));
    }

    #[test]
    fn downstream_input_is_source_output() {
        let mut scope = ExecutionScope::default();
        scope.set_output("value", serde_json::json!(10));
        let message = NodeMessage::complete("src", Uuid::new_v4(), scope, None);
        let downstream = derive_downstream(&message, &edge(EdgeKind::OnComplete));
        assert_eq!(downstream.scope.input["value"], serde_json::json!(10));
        assert!(downstream.scope.output.is_empty());
    }

    #[test]
    fn fail_downstream_carries_failure_descriptor() {
        let fail = NodeMessage::fail(
            "worker",
            Uuid::new_v4(),
            ExecutionScope::default(),
            crate::message::FailureInfo::msg("exploded"),
        );
        let downstream = derive_downstream(&fail, &edge(EdgeKind::OnFail));
        assert_eq!(
            downstream.scope.input["error"],
            serde_json::json!("exploded")
        );
        assert_eq!(
            downstream.scope.input["failedNodeId"],
            serde_json::json!("worker")
        );
    }
}
