//! Property tests for the node queue's delivery-state machine.

use std::time::Duration;

use proptest::prelude::*;
use uuid::Uuid;

use loomflow::message::{ExecutionScope, NodeMessage};
use loomflow::queue::{AbandonOutcome, DeliveryOptions, NodeQueue, QueuedEnvelope};

#[derive(Clone, Debug)]
enum Op {
    Enqueue,
    Checkout,
    Complete,
    Abandon,
    Sweep,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Enqueue),
        3 => Just(Op::Checkout),
        2 => Just(Op::Complete),
        2 => Just(Op::Abandon),
        1 => Just(Op::Sweep),
    ]
}

fn message() -> NodeMessage {
    NodeMessage::complete("src", Uuid::new_v4(), ExecutionScope::default(), None)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Under any operation sequence: retry counts stay within budget,
    /// counts track held leases exactly, and completed leases disappear.
    #[test]
    fn state_machine_invariants(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let max_retries = 2u32;
        let queue = NodeQueue::new("n", 4, Duration::from_secs(60), max_retries);
        let mut held: Vec<loomflow::queue::Lease> = Vec::new();
        let mut dead = 0usize;

        for op in ops {
            match op {
                Op::Enqueue => {
                    // Never blocks; only saturation with in-flight slots
                    // may refuse.
                    let _ = queue.enqueue(message(), DeliveryOptions::default());
                }
                Op::Checkout => {
                    if let Some(lease) = queue.try_checkout() {
                        prop_assert!(lease.retry_count <= max_retries);
                        held.push(lease);
                    }
                }
                Op::Complete => {
                    if let Some(lease) = held.pop() {
                        prop_assert!(queue.complete(lease.lease_id));
                        // Idempotent second call.
                        prop_assert!(!queue.complete(lease.lease_id));
                    }
                }
                Op::Abandon => {
                    if let Some(lease) = held.pop() {
                        match queue.abandon(lease.lease_id, Some("prop".into())) {
                            AbandonOutcome::Retried { retry_count } => {
                                prop_assert!(retry_count <= max_retries);
                            }
                            AbandonOutcome::DeadLettered(entry) => {
                                dead += 1;
                                prop_assert_eq!(entry.final_retry_count, max_retries);
                            }
                            AbandonOutcome::NotFound => {
                                prop_assert!(false, "held lease must be abandonable");
                            }
                        }
                    }
                }
                Op::Sweep => {
                    // Leases have a long visibility timeout; nothing should
                    // be expired.
                    prop_assert_eq!(queue.sweep_expired(), 0);
                }
            }

            let counts = queue.counts();
            prop_assert!(counts.ready + counts.in_flight <= 4);
            prop_assert_eq!(counts.in_flight, held.len());
        }

        prop_assert_eq!(queue.dead_letters().len(), dead);
    }
}

/// Envelopes survive serialization with their delivery state intact, retry
/// backoff included.
#[test]
fn envelope_snapshots_serialize_after_retries() {
    let queue = NodeQueue::new("n", 4, Duration::from_secs(60), 8);
    queue
        .enqueue(
            message(),
            DeliveryOptions {
                max_retries: Some(8),
                ..Default::default()
            },
        )
        .unwrap();

    let mut retries = 0;
    while retries < 2 {
        // Abandon backoff delays visibility; poll until redelivery.
        if let Some(lease) = queue.try_checkout() {
            queue.abandon(lease.lease_id, None);
            retries += 1;
        } else {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    let snapshot = queue.snapshot_envelopes();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].retry_count, 2);

    let json = serde_json::to_string(&snapshot).unwrap();
    let back: Vec<QueuedEnvelope> = serde_json::from_str(&json).unwrap();
    assert_eq!(back[0].envelope_id, snapshot[0].envelope_id);
    assert_eq!(back[0].retry_count, 2);
}
