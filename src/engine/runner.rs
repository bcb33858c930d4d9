//! The workflow engine: orchestration of a run from start to terminal
//! status.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use super::supervisor::NodeSupervisor;
use crate::checkpoint::{CheckpointError, CheckpointStore, WorkflowCheckpoint};
use crate::condition::ConditionError;
use crate::config::EngineConfig;
use crate::context::{WorkflowContext, WorkflowStatusSnapshot};
use crate::definition::WorkflowDefinition;
use crate::events::{
    BroadcastHub, Event, EventBus, EventEmitter, EventStream, ProgressSnapshot,
};
use crate::message::{ExecutionScope, FailureInfo, NodeMessage, ValueMap};
use crate::nodes::{NativeBuilder, NodeFactory, NodeInitError, ScriptHost, WorkflowNode};
use crate::queue::{DeliveryOptions, NodeQueue};
use crate::router::MessageRouter;
use crate::types::{NodeStatus, WorkflowStatus};
use crate::validation::{GraphRejected, validate_definition};

/// Synthetic source id for entry-point seed messages; no edges ever
/// originate from it.
const SEED_SOURCE: &str = "__seed__";

/// Cadence of the engine's run loop (sweeps, termination snapshots).
const DRIVE_TICK: Duration = Duration::from_millis(10);

/// Errors surfaced by engine operations.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] GraphRejected),

    #[error("edge condition failed to compile: {0}")]
    #[diagnostic(code(loomflow::engine::router))]
    Router(#[from] ConditionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    NodeInit(#[from] NodeInitError),

    #[error("no active run with instance id {instance_id}")]
    #[diagnostic(code(loomflow::engine::run_not_found))]
    RunNotFound { instance_id: Uuid },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("no checkpoint store is configured")]
    #[diagnostic(
        code(loomflow::engine::no_checkpoint_store),
        help("Attach a store with `with_checkpoint_store` before pausing or resuming runs.")
    )]
    NoCheckpointStore,

    #[error("no checkpoint found for instance {instance_id}")]
    #[diagnostic(code(loomflow::engine::checkpoint_not_found))]
    CheckpointNotFound { instance_id: Uuid },
}

struct RunHandle {
    context: Arc<WorkflowContext>,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

/// Orchestrates workflow runs: validates the graph, allocates per-node
/// queues and supervisors, seeds the entry points, observes termination,
/// and publishes lifecycle events and progress snapshots.
///
/// One engine can execute many runs, concurrently or in sequence; the
/// event bus and progress stream are engine-owned so observers subscribe
/// once, before `start` blocks.
pub struct WorkflowEngine {
    config: EngineConfig,
    factory: Arc<NodeFactory>,
    event_bus: EventBus,
    progress_hub: Arc<BroadcastHub<ProgressSnapshot>>,
    runs: DashMap<Uuid, RunHandle>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig) -> Self {
        let factory = Arc::new(NodeFactory::new(config.clone()));
        Self::with_factory(config, factory)
    }

    /// Engine sharing an existing factory (native registry and script
    /// host); used for subflow and container child graphs.
    pub fn with_factory(config: EngineConfig, factory: Arc<NodeFactory>) -> Self {
        let event_bus = config.event_bus.build_event_bus();
        event_bus.listen_for_events();
        Self {
            config,
            factory,
            event_bus,
            progress_hub: BroadcastHub::new(crate::config::DEFAULT_EVENT_BUFFER),
            runs: DashMap::new(),
            checkpoint_store: None,
        }
    }

    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// Register a native node implementation under an assembly reference.
    pub fn register_native(&self, reference: impl Into<String>, builder: NativeBuilder) {
        self.factory.register_native(reference, builder);
    }

    /// Swap the script host used by script nodes.
    pub fn set_script_host(&self, host: Arc<dyn ScriptHost>) {
        self.factory.set_script_host(host);
    }

    pub fn subscribe_events(&self) -> EventStream<Event> {
        self.event_bus.subscribe()
    }

    pub fn subscribe_progress(&self) -> EventStream<ProgressSnapshot> {
        self.progress_hub.subscribe()
    }

    /// Run a workflow to its terminal status.
    ///
    /// Blocks until the run completes, fails, or is cancelled (externally
    /// or by `timeout`), then returns the final context. Control
    /// operations (`pause`, `resume`, `cancel`, `get_workflow_status`) are
    /// available concurrently from other tasks.
    #[instrument(skip_all, fields(workflow_id = %definition.workflow_id), err)]
    pub async fn start(
        &self,
        definition: WorkflowDefinition,
        initial_variables: ValueMap,
        timeout: Option<Duration>,
        cancellation: CancellationToken,
    ) -> Result<Arc<WorkflowContext>, EngineError> {
        let (ctx, nodes, router) = self.prepare(definition, initial_variables, cancellation, None)?;
        self.seed_entry_points(&ctx);
        self.drive_run(ctx, nodes, router, timeout).await
    }

    /// Rebuild a run from a checkpoint and drive it to a terminal status.
    ///
    /// Queue envelopes are restored ready (in-flight ones included:
    /// at-least-once within a run is the contract) and instances that were
    /// running at capture time are marked cancelled, their messages being
    /// redelivered to fresh instances.
    pub async fn resume_from_checkpoint(
        &self,
        definition: WorkflowDefinition,
        checkpoint: WorkflowCheckpoint,
        cancellation: CancellationToken,
    ) -> Result<Arc<WorkflowContext>, EngineError> {
        let (ctx, nodes, router) = self.prepare(
            definition,
            checkpoint.variables.clone(),
            cancellation,
            Some(checkpoint.instance_id),
        )?;

        let mut instances = checkpoint.node_instances;
        for instance in &mut instances {
            if instance.status == NodeStatus::Running {
                instance.status = NodeStatus::Cancelled;
                instance.ended_at = Some(chrono::Utc::now());
            }
        }
        ctx.restore_instances(instances);

        for (node_id, envelopes) in checkpoint.queues {
            if let Some(queue) = ctx.queue(&node_id) {
                if let Err(err) = queue.restore_envelopes(envelopes) {
                    tracing::warn!(node_id, %err, "failed to restore checkpointed envelopes");
                }
            }
        }

        self.drive_run(ctx, nodes, router, None).await
    }

    /// Load the checkpoint for `instance_id` from the configured store and
    /// resume it.
    pub async fn resume_incomplete(
        &self,
        definition: WorkflowDefinition,
        instance_id: Uuid,
        cancellation: CancellationToken,
    ) -> Result<Arc<WorkflowContext>, EngineError> {
        let store = self
            .checkpoint_store
            .as_ref()
            .ok_or(EngineError::NoCheckpointStore)?;
        let checkpoint = store
            .load(instance_id)
            .await?
            .ok_or(EngineError::CheckpointNotFound { instance_id })?;
        self.resume_from_checkpoint(definition, checkpoint, cancellation)
            .await
    }

    /// Suspend leasing for a run and checkpoint its state.
    pub async fn pause(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let handle = self
            .runs
            .get(&instance_id)
            .ok_or(EngineError::RunNotFound { instance_id })?;
        let _ = handle.pause.send(true);
        handle.context.set_status(WorkflowStatus::Paused);
        let checkpoint = WorkflowCheckpoint::capture(&handle.context);
        drop(handle);
        if let Some(store) = &self.checkpoint_store {
            store.save(checkpoint).await?;
        }
        Ok(())
    }

    /// Resume leasing for a paused run.
    pub fn resume(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let handle = self
            .runs
            .get(&instance_id)
            .ok_or(EngineError::RunNotFound { instance_id })?;
        let _ = handle.pause.send(false);
        handle.context.set_status(WorkflowStatus::Running);
        Ok(())
    }

    /// Signal cancellation for a run.
    pub fn cancel(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let handle = self
            .runs
            .get(&instance_id)
            .ok_or(EngineError::RunNotFound { instance_id })?;
        handle.cancel.cancel();
        Ok(())
    }

    /// Read-only snapshot of a run.
    pub fn get_workflow_status(&self, instance_id: Uuid) -> Option<WorkflowStatusSnapshot> {
        self.runs
            .get(&instance_id)
            .map(|handle| handle.context.status_snapshot())
    }

    /// Flush and close the engine's event streams.
    pub async fn shutdown(&self) {
        self.event_bus.shutdown().await;
        self.progress_hub.close();
    }

    // ------------------------------------------------------------------

    fn prepare(
        &self,
        definition: WorkflowDefinition,
        initial_variables: ValueMap,
        cancellation: CancellationToken,
        instance_id: Option<Uuid>,
    ) -> Result<
        (
            Arc<WorkflowContext>,
            FxHashMap<String, Arc<dyn WorkflowNode>>,
            Arc<MessageRouter>,
        ),
        EngineError,
    > {
        if !self.config.skip_validation {
            let report = validate_definition(&definition, self.config.strict_validation);
            for warning in &report.warnings {
                tracing::warn!(workflow_id = %definition.workflow_id, %warning, "validation warning");
            }
            if !report.is_ok() {
                return Err(GraphRejected::new(definition.workflow_id.clone(), report).into());
            }
        }

        let router = Arc::new(MessageRouter::compile(&definition)?);

        let mut queues = FxHashMap::default();
        for node in &definition.nodes {
            queues.insert(
                node.node_id.clone(),
                Arc::new(NodeQueue::new(
                    &node.node_id,
                    self.config.queue_capacity,
                    self.config.visibility_timeout,
                    self.config.max_retries,
                )),
            );
        }

        let mut nodes: FxHashMap<String, Arc<dyn WorkflowNode>> = FxHashMap::default();
        for node_definition in &definition.nodes {
            nodes.insert(
                node_definition.node_id.clone(),
                self.factory.build(node_definition)?,
            );
        }

        let mut context = WorkflowContext::new(
            Arc::new(definition),
            queues,
            self.event_bus.emitter(),
            Arc::clone(&self.progress_hub),
            cancellation,
            initial_variables,
        );
        if let Some(instance_id) = instance_id {
            context = context.with_instance_id(instance_id);
        }
        Ok((Arc::new(context), nodes, router))
    }

    /// Enqueue the synthetic seed completion into every entry point.
    fn seed_entry_points(&self, ctx: &Arc<WorkflowContext>) {
        for entry in ctx.definition.entry_points() {
            let Some(queue) = ctx.queue(&entry.node_id) else {
                continue;
            };
            let mut scope = ExecutionScope::default();
            scope.input = ctx.variables_snapshot();
            let seed = NodeMessage::complete(SEED_SOURCE, Uuid::new_v4(), scope, None);
            if let Err(err) = queue.enqueue(seed, DeliveryOptions::default()) {
                tracing::warn!(entry = %entry.node_id, %err, "failed to seed entry point");
            }
        }
    }

    async fn drive_run(
        &self,
        ctx: Arc<WorkflowContext>,
        nodes: FxHashMap<String, Arc<dyn WorkflowNode>>,
        router: Arc<MessageRouter>,
        timeout: Option<Duration>,
    ) -> Result<Arc<WorkflowContext>, EngineError> {
        let (pause_tx, pause_rx) = watch::channel(false);
        let shutdown = CancellationToken::new();
        let busy = Arc::new(AtomicUsize::new(0));

        self.runs.insert(
            ctx.instance_id,
            RunHandle {
                context: Arc::clone(&ctx),
                cancel: ctx.cancellation.clone(),
                pause: pause_tx,
            },
        );

        ctx.set_status(WorkflowStatus::Running);
        let _ = ctx.emitter().emit(Event::workflow(
            ctx.instance_id,
            ctx.workflow_id(),
            WorkflowStatus::Running,
            None,
        ));

        let mut tasks = Vec::with_capacity(nodes.len());
        for (node_id, node) in nodes {
            let Some(queue) = ctx.queue(&node_id) else {
                continue;
            };
            let supervisor = NodeSupervisor::new(
                node_id,
                node,
                queue,
                Arc::clone(&router),
                Arc::clone(&ctx),
                Arc::clone(&busy),
                shutdown.clone(),
                pause_rx.clone(),
            );
            tasks.push(tokio::spawn(supervisor.run()));
        }

        let status = self.observe(&ctx, &busy, timeout, pause_rx).await;
        shutdown.cancel();

        // Give supervisors (and their in-flight executes) the grace period
        // to wind down, then abort stragglers.
        let grace = self.config.grace_period;
        for mut task in tasks {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }

        if status == WorkflowStatus::Cancelled {
            for instance in ctx.cancel_running_instances() {
                ctx.emit_node_event(
                    &instance.node_id,
                    instance.instance_id,
                    crate::events::NodeTransition::Cancelled,
                    None,
                );
            }
        }

        ctx.set_status(status);
        ctx.publish_progress();
        let _ = ctx.emitter().emit(Event::workflow(
            ctx.instance_id,
            ctx.workflow_id(),
            status,
            terminal_detail(&ctx, status),
        ));

        if let Some(store) = &self.checkpoint_store {
            if let Err(err) = store.save(WorkflowCheckpoint::capture(&ctx)).await {
                tracing::warn!(%err, "failed to persist terminal checkpoint");
            }
        }

        Ok(ctx)
    }

    /// The run loop: sweep queues, account dead letters, and re-evaluate
    /// the termination snapshot until it holds (or cancellation/timeout
    /// fires).
    async fn observe(
        &self,
        ctx: &Arc<WorkflowContext>,
        busy: &Arc<AtomicUsize>,
        timeout: Option<Duration>,
        paused: watch::Receiver<bool>,
    ) -> WorkflowStatus {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut dead_letters_seen: FxHashMap<String, usize> = FxHashMap::default();

        loop {
            if ctx.cancellation.is_cancelled() {
                return WorkflowStatus::Cancelled;
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    let _ = ctx.emitter().emit(Event::diagnostic(
                        "engine",
                        format!("workflow {} timed out; cancelling", ctx.instance_id),
                    ));
                    ctx.cancellation.cancel();
                    return WorkflowStatus::Cancelled;
                }
            }

            for (node_id, queue) in ctx.queues() {
                queue.sweep_expired();
                let entries = queue.dead_letters();
                let seen = dead_letters_seen.entry(node_id.clone()).or_insert(0);
                for entry in entries.iter().skip(*seen) {
                    // A dead-lettered envelope means the edge was never
                    // taken; the failure escalates to the workflow.
                    let detail = entry
                        .last_error
                        .clone()
                        .unwrap_or_else(|| entry.reason.clone());
                    ctx.record_unrecovered_failure(node_id, FailureInfo::msg(detail));
                }
                *seen = entries.len();
            }

            if !*paused.borrow() {
                // Single atomic snapshot test, double-checked against
                // messages arriving during evaluation.
                if busy.load(Ordering::SeqCst) == 0 && ctx.queue_totals().is_empty() {
                    tokio::time::sleep(DRIVE_TICK).await;
                    if busy.load(Ordering::SeqCst) == 0 && ctx.queue_totals().is_empty() {
                        return if ctx.unrecovered_failures().is_empty() {
                            WorkflowStatus::Completed
                        } else {
                            WorkflowStatus::Failed
                        };
                    }
                    continue;
                }
            }

            tokio::select! {
                _ = ctx.cancellation.cancelled() => {}
                _ = tokio::time::sleep(DRIVE_TICK) => {}
            }
        }
    }
}

fn terminal_detail(ctx: &WorkflowContext, status: WorkflowStatus) -> Option<String> {
    match status {
        WorkflowStatus::Failed => {
            let failures = ctx.unrecovered_failures();
            failures
                .first()
                .map(|(node_id, failure)| format!("node `{node_id}` failed: {failure}"))
        }
        _ => None,
    }
}
