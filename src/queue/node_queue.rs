//! The bounded slot-ring queue backing one node.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rand::RngExt;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::envelope::{DeadLetterEntry, EnvelopeStatus, Lease, QueuedEnvelope};
use crate::message::NodeMessage;
use crate::types::MessageKind;

// Slot state machine. RESERVED marks transition ownership: whoever wins a
// compare-and-swap into RESERVED is the only mutator of that slot's payload
// until it stores the next state.
const SLOT_EMPTY: u8 = 0;
const SLOT_RESERVED: u8 = 1;
const SLOT_READY: u8 = 2;
const SLOT_IN_FLIGHT: u8 = 3;

/// Re-scan cadence while waiting for an availability signal; also bounds
/// how stale an expired lease can get before an idle consumer notices it.
const WAIT_TICK: Duration = Duration::from_millis(25);

const BACKOFF_BASE_MS: u64 = 50;
const BACKOFF_CAP_MS: u64 = 5_000;

struct Slot {
    state: std::sync::atomic::AtomicU8,
    envelope: Mutex<Option<QueuedEnvelope>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: std::sync::atomic::AtomicU8::new(SLOT_EMPTY),
            envelope: Mutex::new(None),
        }
    }

    fn try_reserve(&self, from: u8) -> bool {
        self.state
            .compare_exchange(from, SLOT_RESERVED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn publish(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }
}

/// Errors from queue operations.
#[derive(Debug, Error, Diagnostic)]
pub enum QueueError {
    #[error("progress messages are observational and cannot be enqueued")]
    #[diagnostic(code(loomflow::queue::unroutable))]
    Unroutable,

    #[error("queue for node `{node_id}` is saturated with in-flight envelopes")]
    #[diagnostic(
        code(loomflow::queue::saturated),
        help("Every slot holds a leased envelope; displacement only evicts ready ones.")
    )]
    Saturated { node_id: String },
}

/// Outcome of [`NodeQueue::abandon`].
#[derive(Debug)]
pub enum AbandonOutcome {
    /// Envelope returned to ready with a backoff; will be re-delivered.
    Retried { retry_count: u32 },
    /// Retry budget exhausted; the envelope moved to the dead-letter log.
    DeadLettered(Box<DeadLetterEntry>),
    /// No in-flight envelope matched the lease (already completed or
    /// recycled); abandoning twice is a no-op.
    NotFound,
}

/// Per-enqueue overrides, usually sourced from the delivering edge.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeliveryOptions {
    pub max_retries: Option<u32>,
    pub visibility_timeout: Option<Duration>,
}

/// Ready/in-flight totals used by the engine's termination snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub ready: usize,
    pub in_flight: usize,
}

impl QueueCounts {
    pub fn is_empty(&self) -> bool {
        self.ready == 0 && self.in_flight == 0
    }
}

/// Bounded, concurrent message store for one node.
///
/// Multiple producers and consumers are supported; all slot transitions go
/// through compare-and-swap on the slot state byte and no lock is held
/// across a wait. Enqueue never blocks: at capacity it displaces the oldest
/// ready envelope (never an in-flight one).
pub struct NodeQueue {
    node_id: String,
    slots: Box<[Slot]>,
    default_max_retries: u32,
    default_visibility_timeout: Duration,
    sequence: AtomicU64,
    ready: AtomicUsize,
    in_flight: AtomicUsize,
    available: Notify,
    dead_letters: Mutex<Vec<DeadLetterEntry>>,
}

impl NodeQueue {
    pub fn new(
        node_id: impl Into<String>,
        capacity: usize,
        default_visibility_timeout: Duration,
        default_max_retries: u32,
    ) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity).map(|_| Slot::new()).collect::<Vec<_>>();
        Self {
            node_id: node_id.into(),
            slots: slots.into_boxed_slice(),
            default_max_retries,
            default_visibility_timeout,
            sequence: AtomicU64::new(0),
            ready: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            available: Notify::new(),
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            ready: self.ready.load(Ordering::Acquire),
            in_flight: self.in_flight.load(Ordering::Acquire),
        }
    }

    /// Place a message into the queue. Never blocks; at capacity the oldest
    /// ready envelope is displaced. Fails only on invalid input or when
    /// every slot is in-flight.
    pub fn enqueue(
        &self,
        message: NodeMessage,
        options: DeliveryOptions,
    ) -> Result<Uuid, QueueError> {
        if message.kind() == MessageKind::Progress {
            return Err(QueueError::Unroutable);
        }

        let now = Utc::now();
        let envelope = QueuedEnvelope {
            envelope_id: Uuid::new_v4(),
            sequence: self.sequence.fetch_add(1, Ordering::AcqRel),
            message,
            enqueued_at: now,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(self.default_max_retries),
            visibility_timeout: options
                .visibility_timeout
                .unwrap_or(self.default_visibility_timeout),
            visible_after: now,
            status: EnvelopeStatus::Ready,
            lease_id: None,
            last_error: None,
        };
        self.insert(envelope)
    }

    /// Insert a pre-built envelope (also used by checkpoint restore).
    pub(crate) fn insert(&self, envelope: QueuedEnvelope) -> Result<Uuid, QueueError> {
        let envelope_id = envelope.envelope_id;
        let mut pending = Some(envelope);

        // Fast path: claim an empty slot.
        for slot in self.slots.iter() {
            if slot.try_reserve(SLOT_EMPTY) {
                if let Some(envelope) = pending.take() {
                    *slot.envelope.lock() = Some(envelope);
                }
                self.ready.fetch_add(1, Ordering::AcqRel);
                slot.publish(SLOT_READY);
                self.available.notify_one();
                return Ok(envelope_id);
            }
        }

        // Full: displace the oldest ready envelope. In-flight slots are
        // untouchable, so a queue whose slots are all leased refuses.
        loop {
            let Some(idx) = self.oldest_slot(SLOT_READY, None) else {
                return Err(QueueError::Saturated {
                    node_id: self.node_id.clone(),
                });
            };
            let slot = &self.slots[idx];
            if !slot.try_reserve(SLOT_READY) {
                continue;
            }
            let displaced = {
                let mut guard = slot.envelope.lock();
                match pending.take() {
                    Some(envelope) => guard.replace(envelope),
                    None => None,
                }
            };
            if let Some(displaced) = displaced {
                tracing::warn!(
                    node_id = %self.node_id,
                    envelope_id = %displaced.envelope_id,
                    "queue full; displaced oldest ready envelope"
                );
            }
            // Ready count is unchanged: one ready envelope replaced another.
            slot.publish(SLOT_READY);
            self.available.notify_one();
            return Ok(envelope_id);
        }
    }

    /// Wait up to `timeout` for a ready, visible envelope and lease it.
    ///
    /// Returns `None` on timeout or cancellation. Expired in-flight leases
    /// are swept on every pass, so an idle consumer doubles as the sweeper.
    pub async fn checkout(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<Lease> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.sweep_expired();
            if let Some(lease) = self.try_checkout() {
                return Some(lease);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let wait = (deadline - now).min(WAIT_TICK);
            tokio::select! {
                _ = self.available.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return None,
            }
            // Spurious wakeups simply rescan and rewait.
        }
    }

    /// Non-blocking checkout attempt.
    pub fn try_checkout(&self) -> Option<Lease> {
        loop {
            let now = Utc::now();
            let idx = self.oldest_slot(SLOT_READY, Some(now))?;
            let slot = &self.slots[idx];
            if !slot.try_reserve(SLOT_READY) {
                continue;
            }
            let mut guard = slot.envelope.lock();
            match guard.as_mut() {
                Some(env) if env.status == EnvelopeStatus::Ready && env.is_visible(now) => {
                    let lease_id = Uuid::new_v4();
                    let expires_at = now
                        + chrono::Duration::from_std(env.visibility_timeout)
                            .unwrap_or_else(|_| chrono::Duration::seconds(300));
                    env.status = EnvelopeStatus::InFlight;
                    env.lease_id = Some(lease_id);
                    env.visible_after = expires_at;
                    let lease = Lease {
                        lease_id,
                        envelope_id: env.envelope_id,
                        message: env.message.clone(),
                        retry_count: env.retry_count,
                        leased_at: now,
                        expires_at,
                    };
                    self.ready.fetch_sub(1, Ordering::AcqRel);
                    self.in_flight.fetch_add(1, Ordering::AcqRel);
                    drop(guard);
                    slot.publish(SLOT_IN_FLIGHT);
                    return Some(lease);
                }
                _ => {
                    // The occupant changed between scan and reservation;
                    // restore and rescan.
                    let restore = if guard.is_some() { SLOT_READY } else { SLOT_EMPTY };
                    drop(guard);
                    slot.publish(restore);
                }
            }
        }
    }

    /// Remove the envelope held under `lease_id`. Idempotent: completing an
    /// already-removed lease is a no-op returning `false`.
    pub fn complete(&self, lease_id: Uuid) -> bool {
        for slot in self.slots.iter() {
            if slot.state.load(Ordering::Acquire) != SLOT_IN_FLIGHT {
                continue;
            }
            if !slot.try_reserve(SLOT_IN_FLIGHT) {
                continue;
            }
            let mut guard = slot.envelope.lock();
            let matches = guard
                .as_ref()
                .is_some_and(|env| env.lease_id == Some(lease_id));
            if matches {
                *guard = None;
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                drop(guard);
                slot.publish(SLOT_EMPTY);
                return true;
            }
            drop(guard);
            slot.publish(SLOT_IN_FLIGHT);
        }
        false
    }

    /// Record a failed delivery. Within budget the envelope returns to
    /// ready after an exponential backoff; past budget it dead-letters.
    pub fn abandon(&self, lease_id: Uuid, error: Option<String>) -> AbandonOutcome {
        for idx in 0..self.slots.len() {
            let slot = &self.slots[idx];
            if slot.state.load(Ordering::Acquire) != SLOT_IN_FLIGHT {
                continue;
            }
            if !slot.try_reserve(SLOT_IN_FLIGHT) {
                continue;
            }
            let matches = slot
                .envelope
                .lock()
                .as_ref()
                .is_some_and(|env| env.lease_id == Some(lease_id));
            if matches {
                return self.recycle(idx, error, "abandoned by consumer");
            }
            slot.publish(SLOT_IN_FLIGHT);
        }
        AbandonOutcome::NotFound
    }

    /// Recycle every in-flight envelope whose visibility timeout elapsed.
    /// Returns how many envelopes were recycled (retried or dead-lettered).
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut swept = 0;
        for idx in 0..self.slots.len() {
            let slot = &self.slots[idx];
            if slot.state.load(Ordering::Acquire) != SLOT_IN_FLIGHT {
                continue;
            }
            let expired = slot
                .envelope
                .lock()
                .as_ref()
                .is_some_and(|env| env.status == EnvelopeStatus::InFlight && env.is_visible(now));
            if !expired {
                continue;
            }
            if !slot.try_reserve(SLOT_IN_FLIGHT) {
                continue;
            }
            let still_expired = slot
                .envelope
                .lock()
                .as_ref()
                .is_some_and(|env| env.status == EnvelopeStatus::InFlight && env.is_visible(now));
            if still_expired {
                self.recycle(idx, Some("lease expired".into()), "visibility timeout elapsed");
                swept += 1;
            } else {
                slot.publish(SLOT_IN_FLIGHT);
            }
        }
        swept
    }

    /// Shared retry/dead-letter path. Caller owns the slot (RESERVED) and
    /// has verified the occupant is in-flight.
    fn recycle(&self, idx: usize, error: Option<String>, reason: &str) -> AbandonOutcome {
        let slot = &self.slots[idx];
        let mut guard = slot.envelope.lock();
        let Some(env) = guard.as_mut() else {
            drop(guard);
            slot.publish(SLOT_EMPTY);
            return AbandonOutcome::NotFound;
        };

        if let Some(error) = error {
            env.last_error = Some(error);
        }

        if env.retry_count < env.max_retries {
            env.retry_count += 1;
            env.status = EnvelopeStatus::Ready;
            env.lease_id = None;
            env.visible_after = Utc::now() + self.backoff(env.retry_count);
            let retry_count = env.retry_count;
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.ready.fetch_add(1, Ordering::AcqRel);
            drop(guard);
            slot.publish(SLOT_READY);
            self.available.notify_one();
            AbandonOutcome::Retried { retry_count }
        } else {
            let Some(mut env) = guard.take() else {
                drop(guard);
                slot.publish(SLOT_EMPTY);
                return AbandonOutcome::NotFound;
            };
            env.status = EnvelopeStatus::Superseded;
            let entry = DeadLetterEntry {
                enqueued_at: env.enqueued_at,
                dead_lettered_at: Utc::now(),
                final_retry_count: env.retry_count,
                reason: reason.to_string(),
                last_error: env.last_error.clone(),
                envelope: env,
            };
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            drop(guard);
            slot.publish(SLOT_EMPTY);
            tracing::warn!(
                node_id = %self.node_id,
                envelope_id = %entry.envelope.envelope_id,
                retries = entry.final_retry_count,
                reason,
                "envelope dead-lettered"
            );
            self.dead_letters.lock().push(entry.clone());
            AbandonOutcome::DeadLettered(Box::new(entry))
        }
    }

    /// Bounded exponential backoff with jitter.
    fn backoff(&self, retry: u32) -> chrono::Duration {
        let exp = retry.saturating_sub(1).min(6);
        let base = BACKOFF_BASE_MS.saturating_mul(1 << exp).min(BACKOFF_CAP_MS);
        let jitter = rand::rng().random_range(0.0..0.25);
        let ms = (base as f64 * (1.0 + jitter)) as i64;
        chrono::Duration::milliseconds(ms.min(BACKOFF_CAP_MS as i64))
    }

    /// Lowest-sequence slot in `state`; with `visible_at`, only envelopes
    /// already visible at that instant qualify.
    fn oldest_slot(&self, state: u8, visible_at: Option<DateTime<Utc>>) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.state.load(Ordering::Acquire) != state {
                continue;
            }
            let guard = slot.envelope.lock();
            if let Some(env) = guard.as_ref() {
                if let Some(now) = visible_at {
                    if !env.is_visible(now) {
                        continue;
                    }
                }
                if best.is_none_or(|(_, seq)| env.sequence < seq) {
                    best = Some((idx, env.sequence));
                }
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Copy of the dead-letter log.
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.lock().clone()
    }

    /// Snapshot live envelopes for checkpointing.
    pub fn snapshot_envelopes(&self) -> Vec<QueuedEnvelope> {
        let mut out = Vec::new();
        for slot in self.slots.iter() {
            let state = slot.state.load(Ordering::Acquire);
            if state != SLOT_READY && state != SLOT_IN_FLIGHT {
                continue;
            }
            if let Some(env) = slot.envelope.lock().as_ref() {
                out.push(env.clone());
            }
        }
        out
    }

    /// Re-seed the queue from checkpointed envelopes. In-flight envelopes
    /// are restored as ready: at-least-once within a run is the contract.
    pub fn restore_envelopes(&self, envelopes: Vec<QueuedEnvelope>) -> Result<(), QueueError> {
        for mut env in envelopes {
            env.status = EnvelopeStatus::Ready;
            env.lease_id = None;
            env.visible_after = Utc::now();
            self.insert(env)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ExecutionScope, NodeMessage};

    fn msg(tag: u64) -> NodeMessage {
        let mut scope = ExecutionScope::default();
        scope.set_output("tag", serde_json::json!(tag));
        NodeMessage::complete("src", Uuid::new_v4(), scope, None)
    }

    fn queue(capacity: usize) -> NodeQueue {
        NodeQueue::new("n", capacity, Duration::from_millis(100), 3)
    }

    #[tokio::test]
    async fn checkout_returns_enqueued_message() {
        let q = queue(4);
        q.enqueue(msg(1), DeliveryOptions::default()).unwrap();
        let lease = q
            .checkout(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(lease.retry_count, 0);
        assert_eq!(q.counts().in_flight, 1);
        assert!(q.complete(lease.lease_id));
        assert!(q.counts().is_empty());
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let q = queue(2);
        q.enqueue(msg(1), DeliveryOptions::default()).unwrap();
        let lease = q.try_checkout().unwrap();
        assert!(q.complete(lease.lease_id));
        assert!(!q.complete(lease.lease_id));
    }

    #[tokio::test]
    async fn abandon_retries_then_dead_letters() {
        let q = NodeQueue::new("n", 2, Duration::from_millis(50), 2);
        q.enqueue(
            msg(1),
            DeliveryOptions {
                visibility_timeout: Some(Duration::from_millis(20)),
                ..Default::default()
            },
        )
        .unwrap();

        let mut deliveries = 0;
        loop {
            let Some(lease) = q
                .checkout(Duration::from_secs(5), &CancellationToken::new())
                .await
            else {
                panic!("expected a delivery or dead-letter before timeout");
            };
            deliveries += 1;
            match q.abandon(lease.lease_id, Some("boom".into())) {
                AbandonOutcome::Retried { retry_count } => {
                    assert_eq!(retry_count as usize, deliveries);
                    assert!(retry_count <= 2);
                }
                AbandonOutcome::DeadLettered(entry) => {
                    assert_eq!(entry.final_retry_count, 2);
                    assert_eq!(entry.last_error.as_deref(), Some("boom"));
                    break;
                }
                AbandonOutcome::NotFound => panic!("lease should exist"),
            }
        }
        // Initial delivery plus two retries.
        assert_eq!(deliveries, 3);
        assert!(q.counts().is_empty());
        assert_eq!(q.dead_letters().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_lease_is_swept_and_redelivered() {
        let q = queue(2);
        q.enqueue(
            msg(1),
            DeliveryOptions {
                visibility_timeout: Some(Duration::from_millis(30)),
                ..Default::default()
            },
        )
        .unwrap();

        let first = q.try_checkout().unwrap();
        // Leak the lease; after the visibility timeout a sweep recycles it.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(q.sweep_expired() >= 1);

        let second = q
            .checkout(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.envelope_id, first.envelope_id);
        assert_eq!(second.retry_count, 1);
        assert_ne!(second.lease_id, first.lease_id);
    }

    #[tokio::test]
    async fn full_queue_displaces_oldest_ready_never_in_flight() {
        let q = queue(2);
        q.enqueue(msg(1), DeliveryOptions::default()).unwrap();
        q.enqueue(msg(2), DeliveryOptions::default()).unwrap();

        // Lease msg(1) so it is in-flight and undisplacable.
        let lease = q.try_checkout().unwrap();
        assert_eq!(lease.message.scope.output["tag"], serde_json::json!(1));

        // Third enqueue displaces msg(2), the only ready envelope.
        q.enqueue(msg(3), DeliveryOptions::default()).unwrap();
        let next = q.try_checkout().unwrap();
        assert_eq!(next.message.scope.output["tag"], serde_json::json!(3));

        assert_eq!(q.counts(), QueueCounts { ready: 0, in_flight: 2 });
    }

    #[tokio::test]
    async fn saturated_queue_refuses_enqueue() {
        let q = queue(1);
        q.enqueue(msg(1), DeliveryOptions::default()).unwrap();
        let _lease = q.try_checkout().unwrap();
        let err = q.enqueue(msg(2), DeliveryOptions::default()).unwrap_err();
        assert!(matches!(err, QueueError::Saturated { .. }));
    }

    #[tokio::test]
    async fn checkout_respects_cancellation() {
        let q = queue(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(q.checkout(Duration::from_secs(10), &cancel).await.is_none());
    }

    #[tokio::test]
    async fn restore_returns_in_flight_to_ready() {
        let q = queue(4);
        q.enqueue(msg(1), DeliveryOptions::default()).unwrap();
        let _lease = q.try_checkout().unwrap();
        let snapshot = q.snapshot_envelopes();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, EnvelopeStatus::InFlight);

        let restored = queue(4);
        restored.restore_envelopes(snapshot).unwrap();
        let lease = restored.try_checkout().unwrap();
        assert_eq!(lease.retry_count, 0);
    }
}
