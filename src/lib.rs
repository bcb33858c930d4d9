//! # Loomflow: Concurrent Workflow Orchestration Engine
//!
//! Loomflow executes directed graphs of computational nodes. A workflow
//! definition is a set of typed nodes connected by typed edges;
//! instantiating it yields a running instance whose nodes execute
//! concurrently, communicating through per-node message queues with
//! lease/visibility-timeout semantics. Runs produce observable progress
//! and terminate with an aggregate status (completed, failed, cancelled).
//!
//! ## Core Concepts
//!
//! - **Nodes**: units of work built from a definition by the
//!   [`nodes::NodeFactory`]; control flow (branch, switch, loops, subflow,
//!   container, timer) ships in-crate, scripts and native plug-ins attach
//!   through seams
//! - **Queues**: one bounded [`queue::NodeQueue`] per node with
//!   at-least-once delivery, bounded retries, and a dead-letter log
//! - **Router**: edge-driven fan-out with condition expressions evaluated
//!   against node output and workflow variables
//! - **Engine**: one supervisor task per node, entry-point seeding,
//!   termination detection, and cooperative cancellation
//! - **Events**: broadcast lifecycle events and progress snapshots with
//!   pluggable sinks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use loomflow::config::EngineConfig;
//! use loomflow::definition::{EdgeDefinition, NodeDefinition, WorkflowDefinition};
//! use loomflow::engine::WorkflowEngine;
//! use loomflow::message::ValueMap;
//! use loomflow::types::{EdgeKind, RuntimeKind};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let definition = WorkflowDefinition::new("double")
//!     .with_node(
//!         NodeDefinition::new("source", RuntimeKind::InlineScript)
//!             .with_script("value = 21"),
//!     )
//!     .with_node(
//!         NodeDefinition::new("sink", RuntimeKind::InlineScript)
//!             .with_script("result = input.value"),
//!     )
//!     .with_edge(EdgeDefinition::new("source", "sink", EdgeKind::OnComplete));
//!
//! let engine = WorkflowEngine::new(EngineConfig::default());
//! let ctx = engine
//!     .start(definition, ValueMap::default(), None, CancellationToken::new())
//!     .await?;
//! assert!(ctx.status().is_terminal());
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`definition`] / [`loader`] - workflow graphs and their JSON/YAML form
//! - [`validation`] - structural, cycle, and per-kind checks
//! - [`condition`] - the edge-condition expression language
//! - [`queue`] - leased per-node message queues
//! - [`router`] - message-to-edge dispatch
//! - [`engine`] - run orchestration and supervisors
//! - [`nodes`] - node variants and the factory
//! - [`events`] - lifecycle events, sinks, and progress
//! - [`checkpoint`] - pluggable run persistence

pub mod checkpoint;
pub mod condition;
pub mod config;
pub mod context;
pub mod definition;
pub mod engine;
pub mod events;
pub mod loader;
pub mod message;
pub mod nodes;
pub mod queue;
pub mod router;
pub mod telemetry;
pub mod types;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for unit tests.

    use std::sync::Arc;

    use rustc_hash::FxHashMap;
    use tokio_util::sync::CancellationToken;

    use crate::context::WorkflowContext;
    use crate::definition::WorkflowDefinition;
    use crate::events::{BroadcastHub, EventBus};
    use crate::message::ValueMap;

    /// A context with no queues and a silent bus, enough for node tests.
    pub(crate) fn bare_context() -> WorkflowContext {
        let bus = EventBus::silent();
        WorkflowContext::new(
            Arc::new(WorkflowDefinition::new("test")),
            FxHashMap::default(),
            bus.emitter(),
            BroadcastHub::new(16),
            CancellationToken::new(),
            ValueMap::default(),
        )
    }
}
