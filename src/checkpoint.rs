//! Pluggable checkpoint persistence.
//!
//! A checkpoint captures everything needed to resume a run: workflow
//! status and variables, the node instance records, and each queue's live
//! envelopes with their delivery state. The store is a seam: this crate
//! ships the in-memory implementation; durable back-ends plug in behind
//! the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::context::{NodeInstance, WorkflowContext};
use crate::message::ValueMap;
use crate::queue::QueuedEnvelope;
use crate::types::WorkflowStatus;

/// A durable snapshot of one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub instance_id: Uuid,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub variables: ValueMap,
    pub node_instances: Vec<NodeInstance>,
    /// Per-queue envelope state, keyed by node id.
    pub queues: FxHashMap<String, Vec<QueuedEnvelope>>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowCheckpoint {
    /// Capture the current state of a run.
    #[must_use]
    pub fn capture(ctx: &WorkflowContext) -> Self {
        Self {
            instance_id: ctx.instance_id,
            workflow_id: ctx.workflow_id().to_string(),
            status: ctx.status(),
            variables: ctx.variables_snapshot(),
            node_instances: ctx.instances_snapshot(),
            queues: ctx
                .queues()
                .map(|(id, queue)| (id.clone(), queue.snapshot_envelopes()))
                .collect(),
            created_at: Utc::now(),
        }
    }
}

/// Errors from checkpoint store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    #[error("backend error: {message}")]
    #[diagnostic(code(loomflow::checkpoint::backend))]
    Backend { message: String },

    #[error("checkpoint serialization failed: {0}")]
    #[diagnostic(code(loomflow::checkpoint::serde))]
    Serde(#[from] serde_json::Error),
}

/// Persistent storage for workflow checkpoints.
///
/// Saves replace any existing checkpoint for the instance; `load` returns
/// `None` for unknown instances. Implementations must be safe to share
/// across tasks.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: WorkflowCheckpoint) -> Result<(), CheckpointError>;

    async fn load(&self, instance_id: Uuid) -> Result<Option<WorkflowCheckpoint>, CheckpointError>;

    /// Instances whose stored status is not terminal.
    async fn list_incomplete(&self) -> Result<Vec<Uuid>, CheckpointError>;
}

/// Volatile store keeping only the latest checkpoint per instance.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<FxHashMap<Uuid, WorkflowCheckpoint>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: WorkflowCheckpoint) -> Result<(), CheckpointError> {
        self.inner
            .write()
            .insert(checkpoint.instance_id, checkpoint);
        Ok(())
    }

    async fn load(&self, instance_id: Uuid) -> Result<Option<WorkflowCheckpoint>, CheckpointError> {
        Ok(self.inner.read().get(&instance_id).cloned())
    }

    async fn list_incomplete(&self) -> Result<Vec<Uuid>, CheckpointError> {
        Ok(self
            .inner
            .read()
            .values()
            .filter(|cp| !cp.status.is_terminal())
            .map(|cp| cp.instance_id)
            .collect())
    }
}
