//! Progress snapshots broadcast alongside lifecycle events.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Point-in-time completion estimate for a running workflow.
///
/// Recomputed and published on every node completion or failure. The
/// fraction counts terminal node instances against the reachable node set,
/// so it increases monotonically until the terminal publication.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProgressSnapshot {
    pub instance_id: Uuid,
    pub workflow_id: String,
    pub completed_nodes: usize,
    pub total_nodes: usize,
    pub fraction: f64,
    pub elapsed: Duration,
    /// Linear extrapolation from the completion fraction; `None` until the
    /// first node finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_remaining: Option<Duration>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn compute(
        instance_id: Uuid,
        workflow_id: impl Into<String>,
        completed_nodes: usize,
        total_nodes: usize,
        elapsed: Duration,
    ) -> Self {
        let fraction = if total_nodes == 0 {
            0.0
        } else {
            (completed_nodes as f64 / total_nodes as f64).min(1.0)
        };
        let estimated_remaining = if fraction > 0.0 && fraction < 1.0 {
            let total = elapsed.as_secs_f64() / fraction;
            Some(Duration::from_secs_f64(total - elapsed.as_secs_f64()))
        } else {
            None
        };
        Self {
            instance_id,
            workflow_id: workflow_id.into(),
            completed_nodes,
            total_nodes,
            fraction,
            elapsed,
            estimated_remaining,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_and_estimate() {
        let snap = ProgressSnapshot::compute(
            Uuid::new_v4(),
            "wf",
            1,
            4,
            Duration::from_secs(10),
        );
        assert!((snap.fraction - 0.25).abs() < f64::EPSILON);
        let remaining = snap.estimated_remaining.unwrap();
        assert!((remaining.as_secs_f64() - 30.0).abs() < 0.01);
    }

    #[test]
    fn complete_run_has_no_estimate() {
        let snap =
            ProgressSnapshot::compute(Uuid::new_v4(), "wf", 4, 4, Duration::from_secs(1));
        assert_eq!(snap.fraction, 1.0);
        assert!(snap.estimated_remaining.is_none());
    }

    #[test]
    fn empty_graph_is_zero_progress() {
        let snap = ProgressSnapshot::compute(Uuid::new_v4(), "wf", 0, 0, Duration::ZERO);
        assert_eq!(snap.fraction, 0.0);
    }
}
