//! Lifecycle event broadcasting: fan-out hub, sinks, and progress stream.
//!
//! The module is organised around a broadcast-based [`BroadcastHub`] and
//! helpers for configuring sinks ([`EventBus`]) and consuming the resulting
//! [`EventStream`]. A second hub of the same shape carries
//! [`ProgressSnapshot`]s so observers can watch completion fractions
//! without parsing lifecycle events.

pub mod bus;
pub mod emitter;
pub mod event;
pub mod hub;
pub mod progress;
pub mod sink;

pub use bus::EventBus;
pub use emitter::{EmitterError, EventEmitter, HubEmitter};
pub use event::{DiagnosticEvent, Event, NodeEvent, NodeTransition, WorkflowEvent};
pub use hub::{BroadcastHub, EventStream, HubMetrics};
pub use progress::ProgressSnapshot;
pub use sink::{ChannelSink, EventSink, JsonLinesSink, MemorySink, StdOutSink};
