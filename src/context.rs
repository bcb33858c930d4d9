//! Run-scoped state: the workflow context and node instance records.
//!
//! One [`WorkflowContext`] exists per run, created at `start` and destroyed
//! after the terminal status. It owns the concurrent variable map, the
//! per-node queues, the event/progress publishers, and the cancellation
//! handle; node operations receive it by shared reference.
//!
//! Variables follow last-writer-wins semantics: reads see a consistent
//! snapshot per access, and there is no transaction across accesses. Node
//! code must not assume read-modify-write atomicity.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::definition::WorkflowDefinition;
use crate::events::{
    BroadcastHub, Event, EventEmitter, EventStream, NodeTransition, ProgressSnapshot,
};
use crate::message::{ExecutionScope, FailureInfo, ValueMap};
use crate::queue::{NodeQueue, QueueCounts};
use crate::types::{NodeStatus, WorkflowStatus};

/// Record of one node execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInstance {
    pub instance_id: Uuid,
    pub node_id: String,
    pub workflow_instance_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: NodeStatus,
    /// Source port used to disambiguate edge selection on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    /// Execution scope used during the run.
    pub scope: ExecutionScope,
}

/// Read-only view of a run for `get_workflow_status`.
#[derive(Clone, Debug)]
pub struct WorkflowStatusSnapshot {
    pub instance_id: Uuid,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub variables: ValueMap,
    pub node_instances: Vec<NodeInstance>,
    pub queue_counts: FxHashMap<String, QueueCounts>,
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("instance_id", &self.instance_id)
            .field("status", &*self.status.read())
            .finish_non_exhaustive()
    }
}

/// Shared state of one workflow run.
pub struct WorkflowContext {
    pub instance_id: Uuid,
    pub definition: Arc<WorkflowDefinition>,
    /// Process-local variable map; concurrent-safe, last writer wins.
    pub variables: DashMap<String, Value>,
    queues: FxHashMap<String, Arc<NodeQueue>>,
    emitter: Arc<dyn EventEmitter>,
    progress_hub: Arc<BroadcastHub<ProgressSnapshot>>,
    pub cancellation: CancellationToken,
    status: RwLock<WorkflowStatus>,
    instances: Mutex<Vec<NodeInstance>>,
    /// Failures whose fail message routed to zero targets (or whose
    /// envelope dead-lettered); drives the terminal-status computation.
    unrecovered: Mutex<Vec<(String, FailureInfo)>>,
    started_at: DateTime<Utc>,
    started_instant: std::time::Instant,
    /// Nodes reachable from the entry points; the denominator for progress.
    reachable_nodes: usize,
}

fn count_reachable(definition: &WorkflowDefinition) -> usize {
    let mut reachable = rustc_hash::FxHashSet::default();
    let mut frontier: Vec<&str> = definition
        .entry_points()
        .iter()
        .map(|n| n.node_id.as_str())
        .collect();
    while let Some(node) = frontier.pop() {
        if !reachable.insert(node) {
            continue;
        }
        for edge in definition.outgoing_edges(node) {
            frontier.push(edge.target_node_id.as_str());
        }
    }
    reachable.len()
}

impl WorkflowContext {
    pub fn new(
        definition: Arc<WorkflowDefinition>,
        queues: FxHashMap<String, Arc<NodeQueue>>,
        emitter: Arc<dyn EventEmitter>,
        progress_hub: Arc<BroadcastHub<ProgressSnapshot>>,
        cancellation: CancellationToken,
        initial_variables: ValueMap,
    ) -> Self {
        let variables = DashMap::new();
        for (name, value) in definition.default_variables.clone() {
            variables.insert(name, value);
        }
        for (name, value) in initial_variables {
            variables.insert(name, value);
        }
        let reachable_nodes = count_reachable(&definition);
        Self {
            instance_id: Uuid::new_v4(),
            definition,
            variables,
            queues,
            emitter,
            progress_hub,
            cancellation,
            status: RwLock::new(WorkflowStatus::Pending),
            instances: Mutex::new(Vec::new()),
            unrecovered: Mutex::new(Vec::new()),
            started_at: Utc::now(),
            started_instant: std::time::Instant::now(),
            reachable_nodes,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.definition.workflow_id
    }

    pub fn status(&self) -> WorkflowStatus {
        *self.status.read()
    }

    pub(crate) fn set_status(&self, status: WorkflowStatus) {
        *self.status.write() = status;
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_instant.elapsed()
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.variables.get(name).map(|entry| entry.value().clone())
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Consistent copy of the variable map.
    pub fn variables_snapshot(&self) -> ValueMap {
        self.variables
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Adopt an existing instance id; used when resuming from a
    /// checkpoint so the run keeps its identity.
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: Uuid) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Increment a numeric counter variable, returning the new value.
    /// Loop nodes keep their iteration counters here, keyed by node id.
    pub fn increment_counter(&self, name: &str) -> u64 {
        let mut entry = self
            .variables
            .entry(name.to_string())
            .or_insert(Value::from(0u64));
        let next = entry.value().as_u64().unwrap_or(0) + 1;
        *entry.value_mut() = Value::from(next);
        next
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    pub fn queue(&self, node_id: &str) -> Option<Arc<NodeQueue>> {
        self.queues.get(node_id).cloned()
    }

    pub fn queues(&self) -> impl Iterator<Item = (&String, &Arc<NodeQueue>)> {
        self.queues.iter()
    }

    /// Combined ready/in-flight totals across every queue.
    pub fn queue_totals(&self) -> QueueCounts {
        let mut totals = QueueCounts::default();
        for queue in self.queues.values() {
            let counts = queue.counts();
            totals.ready += counts.ready;
            totals.in_flight += counts.in_flight;
        }
        totals
    }

    // ------------------------------------------------------------------
    // Node instances
    // ------------------------------------------------------------------

    /// Register a freshly started instance.
    pub fn begin_instance(&self, node_id: &str, scope: ExecutionScope) -> NodeInstance {
        let instance = NodeInstance {
            instance_id: Uuid::new_v4(),
            node_id: node_id.to_string(),
            workflow_instance_id: self.instance_id,
            started_at: Utc::now(),
            ended_at: None,
            status: NodeStatus::Running,
            source_port: None,
            failure: None,
            scope,
        };
        self.instances.lock().push(instance.clone());
        instance
    }

    /// Settle an instance into a terminal status.
    pub fn finish_instance(
        &self,
        instance_id: Uuid,
        status: NodeStatus,
        source_port: Option<String>,
        failure: Option<FailureInfo>,
        scope: Option<ExecutionScope>,
    ) {
        let mut instances = self.instances.lock();
        if let Some(instance) = instances
            .iter_mut()
            .find(|i| i.instance_id == instance_id)
        {
            instance.ended_at = Some(Utc::now());
            instance.status = status;
            instance.source_port = source_port;
            instance.failure = failure;
            if let Some(scope) = scope {
                instance.scope = scope;
            }
        }
    }

    /// Mark every still-running instance cancelled. Used after the grace
    /// period on cancellation.
    pub fn cancel_running_instances(&self) -> Vec<NodeInstance> {
        let mut cancelled = Vec::new();
        let mut instances = self.instances.lock();
        for instance in instances.iter_mut() {
            if instance.status == NodeStatus::Running {
                instance.status = NodeStatus::Cancelled;
                instance.ended_at = Some(Utc::now());
                cancelled.push(instance.clone());
            }
        }
        cancelled
    }

    pub fn instances_snapshot(&self) -> Vec<NodeInstance> {
        self.instances.lock().clone()
    }

    pub(crate) fn restore_instances(&self, instances: Vec<NodeInstance>) {
        *self.instances.lock() = instances;
    }

    pub fn running_instances(&self) -> usize {
        self.instances
            .lock()
            .iter()
            .filter(|i| i.status == NodeStatus::Running)
            .count()
    }

    // ------------------------------------------------------------------
    // Failure bookkeeping
    // ------------------------------------------------------------------

    pub fn record_unrecovered_failure(&self, node_id: &str, failure: FailureInfo) {
        self.unrecovered
            .lock()
            .push((node_id.to_string(), failure));
    }

    pub fn unrecovered_failures(&self) -> Vec<(String, FailureInfo)> {
        self.unrecovered.lock().clone()
    }

    // ------------------------------------------------------------------
    // Events & progress
    // ------------------------------------------------------------------

    pub fn emitter(&self) -> Arc<dyn EventEmitter> {
        self.emitter.clone()
    }

    pub fn emit_node_event(
        &self,
        node_path: &str,
        node_instance_id: Uuid,
        transition: NodeTransition,
        detail: Option<String>,
    ) {
        let event = Event::node(
            node_path,
            node_instance_id,
            self.instance_id,
            transition,
            detail,
        );
        if self.emitter.emit(event).is_err() {
            tracing::debug!(node_path, "event hub closed; lifecycle event dropped");
        }
    }

    pub fn subscribe_progress(&self) -> EventStream<ProgressSnapshot> {
        self.progress_hub.subscribe()
    }

    /// Recompute and publish a progress snapshot.
    pub fn publish_progress(&self) -> ProgressSnapshot {
        let instances = self.instances.lock();
        let completed = instances
            .iter()
            .filter(|i| i.status == NodeStatus::Completed)
            .map(|i| i.node_id.as_str())
            .collect::<rustc_hash::FxHashSet<_>>()
            .len();
        drop(instances);
        let snapshot = ProgressSnapshot::compute(
            self.instance_id,
            self.workflow_id(),
            completed,
            self.reachable_nodes,
            self.elapsed(),
        );
        let _ = self.progress_hub.publish(snapshot.clone());
        snapshot
    }

    /// Full read-only snapshot for `get_workflow_status`.
    pub fn status_snapshot(&self) -> WorkflowStatusSnapshot {
        WorkflowStatusSnapshot {
            instance_id: self.instance_id,
            workflow_id: self.workflow_id().to_string(),
            status: self.status(),
            variables: self.variables_snapshot(),
            node_instances: self.instances_snapshot(),
            queue_counts: self
                .queues
                .iter()
                .map(|(id, q)| (id.clone(), q.counts()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowDefinition;
    use crate::events::EventBus;
    use serde_json::json;

    fn context() -> WorkflowContext {
        let definition = Arc::new(
            WorkflowDefinition::new("wf").with_default_variable("seeded", json!(true)),
        );
        let bus = EventBus::silent();
        WorkflowContext::new(
            definition,
            FxHashMap::default(),
            bus.emitter(),
            BroadcastHub::new(16),
            CancellationToken::new(),
            ValueMap::default(),
        )
    }

    #[test]
    fn variables_merge_defaults_and_initials() {
        let definition = Arc::new(
            WorkflowDefinition::new("wf")
                .with_default_variable("a", json!(1))
                .with_default_variable("b", json!(2)),
        );
        let mut initial = ValueMap::default();
        initial.insert("b".into(), json!(20));
        let bus = EventBus::silent();
        let ctx = WorkflowContext::new(
            definition,
            FxHashMap::default(),
            bus.emitter(),
            BroadcastHub::new(16),
            CancellationToken::new(),
            initial,
        );
        assert_eq!(ctx.variable("a"), Some(json!(1)));
        // Initial variables win over defaults.
        assert_eq!(ctx.variable("b"), Some(json!(20)));
    }

    #[test]
    fn counters_increment_from_zero() {
        let ctx = context();
        assert_eq!(ctx.increment_counter("loop:w"), 1);
        assert_eq!(ctx.increment_counter("loop:w"), 2);
        assert_eq!(ctx.variable("loop:w"), Some(json!(2)));
    }

    #[test]
    fn instance_lifecycle_is_recorded() {
        let ctx = context();
        let instance = ctx.begin_instance("a", ExecutionScope::default());
        assert_eq!(ctx.running_instances(), 1);

        ctx.finish_instance(
            instance.instance_id,
            NodeStatus::Completed,
            Some("true-branch".into()),
            None,
            None,
        );
        assert_eq!(ctx.running_instances(), 0);
        let snapshot = ctx.instances_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, NodeStatus::Completed);
        assert_eq!(snapshot[0].source_port.as_deref(), Some("true-branch"));
        assert!(snapshot[0].ended_at.unwrap() >= snapshot[0].started_at);
    }

    #[test]
    fn cancel_running_marks_only_running() {
        let ctx = context();
        let a = ctx.begin_instance("a", ExecutionScope::default());
        let _b = ctx.begin_instance("b", ExecutionScope::default());
        ctx.finish_instance(a.instance_id, NodeStatus::Completed, None, None, None);

        let cancelled = ctx.cancel_running_instances();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].node_id, "b");
    }
}
