//! Envelope, lease, and dead-letter records for node queues.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::NodeMessage;

/// Delivery state of a queued envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    /// Eligible for checkout once `visible_after` has passed.
    Ready,
    /// Checked out under a lease; invisible until the lease expires.
    InFlight,
    /// Terminally abandoned; never re-delivered.
    Superseded,
}

/// Queue-internal record wrapping a message with its delivery state.
///
/// Envelopes are serializable so checkpoints can capture per-queue state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedEnvelope {
    pub envelope_id: Uuid,
    /// Monotonic enqueue sequence within the owning queue; used to pick the
    /// oldest ready envelope for displacement and checkout.
    pub sequence: u64,
    pub message: NodeMessage,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Budget for this envelope, resolved from edge overrides or queue
    /// defaults at enqueue time.
    pub max_retries: u32,
    pub visibility_timeout: Duration,
    pub visible_after: DateTime<Utc>,
    pub status: EnvelopeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedEnvelope {
    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.visible_after <= now
    }
}

/// Exclusive processing grant for one envelope.
///
/// Holding a lease entitles exactly one consumer to process the message;
/// the holder must call [`NodeQueue::complete`](super::NodeQueue::complete)
/// or [`NodeQueue::abandon`](super::NodeQueue::abandon) before
/// `expires_at`, otherwise a sweep recycles the envelope.
#[derive(Clone, Debug)]
pub struct Lease {
    pub lease_id: Uuid,
    pub envelope_id: Uuid,
    pub message: NodeMessage,
    pub retry_count: u32,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Terminal record of a poison message. Append-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub envelope: QueuedEnvelope,
    pub enqueued_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
    pub final_retry_count: u32,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
