//! Bounded, concurrent per-node message queues with lease semantics.
//!
//! Every node in a running workflow owns one [`NodeQueue`]. Producers (the
//! router, entry-point seeding) enqueue message envelopes; the node's
//! supervisor checks envelopes out under a [`Lease`] and either completes
//! or abandons them. Visibility timeouts plus [`NodeQueue::sweep_expired`]
//! recover leases leaked by crashed consumers, and bounded retries push
//! poison messages into a dead-letter log instead of stalling the queue.
//!
//! Delivery is at-least-once per accepted message and at-most-once per
//! lease. Ordering is "any ready, visible envelope may be delivered";
//! message semantics are commutative within a node's input set, so FIFO is
//! deliberately not promised.

mod envelope;
mod node_queue;

pub use envelope::{DeadLetterEntry, EnvelopeStatus, Lease, QueuedEnvelope};
pub use node_queue::{AbandonOutcome, DeliveryOptions, NodeQueue, QueueCounts, QueueError};
