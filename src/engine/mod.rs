//! Workflow execution: the engine, its run loop, and per-node supervisors.
//!
//! The engine owns the runtime environment (event bus, progress stream,
//! run registry, optional checkpoint store) while
//! [`WorkflowDefinition`](crate::definition::WorkflowDefinition) stays a
//! pure description of the graph. One engine can execute many runs.
//!
//! # Usage
//!
//! ```rust,no_run
//! use loomflow::config::EngineConfig;
//! use loomflow::engine::WorkflowEngine;
//! use loomflow::message::ValueMap;
//! use tokio_util::sync::CancellationToken;
//! # async fn example(definition: loomflow::definition::WorkflowDefinition)
//! # -> Result<(), Box<dyn std::error::Error>> {
//! let engine = WorkflowEngine::new(EngineConfig::default());
//! let ctx = engine
//!     .start(definition, ValueMap::default(), None, CancellationToken::new())
//!     .await?;
//! println!("run {} ended {}", ctx.instance_id, ctx.status());
//! # Ok(())
//! # }
//! ```

mod runner;
mod supervisor;

pub use runner::{EngineError, WorkflowEngine};
