//! Per-node supervisor task.
//!
//! One supervisor runs per node: lease a message, invoke the node's
//! execute in its own task, hand the result to the router, then settle the
//! lease. A node returning `Err` is a handled failure: the supervisor
//! dispatches a `fail` message before completing the lease, so the
//! fail-edge path runs and the envelope is removed exactly once. A node
//! that panics leaks its lease instead; redelivery is the sweep's job.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::context::WorkflowContext;
use crate::events::NodeTransition;
use crate::message::{ExecutionScope, FailureInfo, NodeMessage};
use crate::nodes::{NodeExecuteError, WorkflowNode};
use crate::queue::{Lease, NodeQueue};
use crate::router::MessageRouter;
use crate::types::NodeStatus;

/// How long one checkout attempt waits before the supervisor re-checks its
/// shutdown signals.
const LEASE_POLL: Duration = Duration::from_millis(100);

pub(crate) struct NodeSupervisor {
    node_id: String,
    node: Arc<dyn WorkflowNode>,
    queue: Arc<NodeQueue>,
    router: Arc<MessageRouter>,
    ctx: Arc<WorkflowContext>,
    /// Leases currently being handled across all supervisors; part of the
    /// engine's termination snapshot.
    busy: Arc<AtomicUsize>,
    /// Run-teardown signal, distinct from workflow cancellation.
    shutdown: CancellationToken,
    paused: watch::Receiver<bool>,
}

impl NodeSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node_id: String,
        node: Arc<dyn WorkflowNode>,
        queue: Arc<NodeQueue>,
        router: Arc<MessageRouter>,
        ctx: Arc<WorkflowContext>,
        busy: Arc<AtomicUsize>,
        shutdown: CancellationToken,
        paused: watch::Receiver<bool>,
    ) -> Self {
        Self {
            node_id,
            node,
            queue,
            router,
            ctx,
            busy,
            shutdown,
            paused,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            if self.shutdown.is_cancelled() || self.ctx.cancellation.is_cancelled() {
                return;
            }
            if *self.paused.borrow() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = self.ctx.cancellation.cancelled() => return,
                    changed = self.paused.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                continue;
            }

            let lease = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                lease = self.queue.checkout(LEASE_POLL, &self.ctx.cancellation) => lease,
            };
            let Some(lease) = lease else { continue };

            self.busy.fetch_add(1, Ordering::SeqCst);
            self.handle_lease(lease).await;
            self.busy.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn handle_lease(&self, lease: Lease) {
        let mut scope = ExecutionScope::with_input(lease.message.scope.input.clone());
        scope.metadata = lease.message.metadata.clone();

        let instance = self.ctx.begin_instance(&self.node_id, scope.clone());
        let instance_id = instance.instance_id;
        self.ctx
            .emit_node_event(&self.node_id, instance_id, NodeTransition::Started, None);

        // The node runs in its own task so a panic surfaces as a join
        // error instead of killing the supervisor; the lease then leaks and
        // redelivery goes through the sweep with its retry budget.
        let node = Arc::clone(&self.node);
        let ctx = Arc::clone(&self.ctx);
        let cancel = self.ctx.cancellation.clone();
        let execution = tokio::spawn(async move {
            let mut scope = scope;
            let result = node.execute(&ctx, &mut scope, &cancel).await;
            (scope, result)
        });

        match execution.await {
            Err(join_error) => {
                let failure = FailureInfo::msg(format!("node task crashed: {join_error}"));
                self.ctx.finish_instance(
                    instance_id,
                    NodeStatus::Failed,
                    None,
                    Some(failure.clone()),
                    None,
                );
                self.ctx.emit_node_event(
                    &self.node_id,
                    instance_id,
                    NodeTransition::Failed,
                    Some(failure.message),
                );
                self.ctx.publish_progress();
                // Deliberately neither complete nor abandon: the lease is
                // leaked exactly as a crashed consumer would leak it.
            }
            Ok((scope, Ok(outcome))) => {
                if self.ctx.cancellation.is_cancelled() {
                    // Finished during shutdown: record the completion but
                    // route nothing further.
                    self.ctx.finish_instance(
                        instance_id,
                        NodeStatus::Completed,
                        outcome.source_port.clone(),
                        None,
                        Some(scope),
                    );
                    self.ctx.emit_node_event(
                        &self.node_id,
                        instance_id,
                        NodeTransition::Completed,
                        None,
                    );
                    self.queue.complete(lease.lease_id);
                    return;
                }

                for iteration in &outcome.iterations {
                    let next =
                        NodeMessage::next(self.node_id.clone(), instance_id, iteration.clone());
                    self.router.route(&next, &self.ctx);
                }
                let completion = NodeMessage::complete(
                    self.node_id.clone(),
                    instance_id,
                    scope.clone(),
                    outcome.source_port.clone(),
                );
                self.router.route(&completion, &self.ctx);

                self.ctx.finish_instance(
                    instance_id,
                    NodeStatus::Completed,
                    outcome.source_port,
                    None,
                    Some(scope),
                );
                self.ctx.emit_node_event(
                    &self.node_id,
                    instance_id,
                    NodeTransition::Completed,
                    None,
                );
                self.ctx.publish_progress();
                self.queue.complete(lease.lease_id);
            }
            Ok((scope, Err(error))) => {
                let cancelled = matches!(error, NodeExecuteError::Cancelled)
                    || self.ctx.cancellation.is_cancelled();
                if cancelled {
                    self.ctx.finish_instance(
                        instance_id,
                        NodeStatus::Cancelled,
                        None,
                        None,
                        Some(scope),
                    );
                    self.ctx.emit_node_event(
                        &self.node_id,
                        instance_id,
                        NodeTransition::Cancelled,
                        None,
                    );
                    self.queue.complete(lease.lease_id);
                    return;
                }

                let failure = FailureInfo::from_error(&error);
                let fail = NodeMessage::fail(
                    self.node_id.clone(),
                    instance_id,
                    scope.clone(),
                    failure.clone(),
                );
                let report = self.router.route(&fail, &self.ctx);
                if report.nothing_enqueued() {
                    // No on-fail edge took the message: the failure
                    // escalates to the workflow.
                    self.ctx
                        .record_unrecovered_failure(&self.node_id, failure.clone());
                }

                self.ctx.finish_instance(
                    instance_id,
                    NodeStatus::Failed,
                    None,
                    Some(failure.clone()),
                    Some(scope),
                );
                self.ctx.emit_node_event(
                    &self.node_id,
                    instance_id,
                    NodeTransition::Failed,
                    Some(failure.message),
                );
                self.ctx.publish_progress();
                // Fail dispatched above, so the envelope is removed once.
                self.queue.complete(lease.lease_id);
            }
        }
    }
}
