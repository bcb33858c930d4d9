//! Emitter abstraction handed to supervisors and nodes.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::event::Event;
use super::hub::BroadcastHub;

/// Abstract event emitter that workflow components can clone and hold.
pub trait EventEmitter: Send + Sync + fmt::Debug {
    /// Emit an event in a synchronous, non-blocking manner.
    fn emit(&self, event: Event) -> Result<(), EmitterError>;
}

/// Errors that can occur when emitting an event.
#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("event hub closed")]
    Closed,
    #[error("event emission failed: {0}")]
    Other(String),
}

/// Emitter backed by a [`BroadcastHub`].
#[derive(Clone, Debug)]
pub struct HubEmitter {
    hub: Arc<BroadcastHub<Event>>,
}

impl HubEmitter {
    pub fn new(hub: Arc<BroadcastHub<Event>>) -> Self {
        Self { hub }
    }
}

impl EventEmitter for HubEmitter {
    fn emit(&self, event: Event) -> Result<(), EmitterError> {
        self.hub.publish(event)
    }
}
