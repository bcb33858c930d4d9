//! Output targets consuming lifecycle events.
//!
//! Sinks are owned exclusively by the bus dispatcher, so implementations
//! need no internal locking of their own; [`MemorySink`] carries a shared
//! buffer only because tests hold the other handle.

use std::any::type_name;
use std::fs::File;
use std::io::{self, Result as IoResult, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use super::event::Event;
use crate::telemetry::{PlainFormatter, TelemetryFormatter};

/// Abstraction over an output target that consumes full [`Event`] objects.
pub trait EventSink: Sync + Send {
    /// Handle a structured event. The sink decides how to serialize it.
    fn handle(&mut self, event: &Event) -> IoResult<()>;

    /// A stable, human-friendly identifier for this sink instance.
    fn name(&self) -> String {
        type_name::<Self>().to_string()
    }
}

/// Renders events through a [`TelemetryFormatter`] and writes one line per
/// event to stdout.
pub struct StdOutSink<F: TelemetryFormatter = PlainFormatter> {
    formatter: F,
}

impl Default for StdOutSink {
    fn default() -> Self {
        Self {
            formatter: PlainFormatter,
        }
    }
}

impl<F: TelemetryFormatter> StdOutSink<F> {
    pub fn with_formatter(formatter: F) -> Self {
        Self { formatter }
    }
}

impl<F: TelemetryFormatter> EventSink for StdOutSink<F> {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        let line = self.formatter.render_event(event);
        let mut out = io::stdout().lock();
        writeln!(out, "{line}")?;
        out.flush()
    }
}

/// Capturing sink for tests and snapshots. Cloning yields another handle
/// onto the same buffer, so a test can keep one while the bus owns the
/// other.
#[derive(Clone, Default)]
pub struct MemorySink {
    captured: Arc<RwLock<Vec<Event>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything captured so far.
    pub fn snapshot(&self) -> Vec<Event> {
        self.captured.read().clone()
    }

    /// Number of events captured so far.
    pub fn len(&self) -> usize {
        self.captured.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.captured.read().is_empty()
    }

    /// Remove and return the captured events, resetting the buffer.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.captured.write())
    }

    pub fn clear(&self) {
        self.captured.write().clear();
    }
}

impl EventSink for MemorySink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        self.captured.write().push(event.clone());
        Ok(())
    }
}

/// JSON Lines sink for machine-readable structured logging: one normalized
/// JSON object per line, suitable for log aggregation and stream
/// processing.
pub struct JsonLinesSink {
    writer: Box<dyn Write + Send + Sync>,
}

impl JsonLinesSink {
    pub fn new(writer: Box<dyn Write + Send + Sync>) -> Self {
        Self { writer }
    }

    pub fn to_stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Write events to a file (created or truncated).
    pub fn to_file(path: impl AsRef<Path>) -> IoResult<Self> {
        Ok(Self::new(Box::new(File::create(path)?)))
    }
}

impl EventSink for JsonLinesSink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        serde_json::to_writer(&mut self.writer, &event.to_json_value())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    fn name(&self) -> String {
        "JsonLinesSink".to_string()
    }
}

/// Forwards events to a flume channel for async consumers (SSE bridges,
/// dashboards, log shippers).
pub struct ChannelSink {
    tx: flume::Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: flume::Sender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel receiver dropped"))
    }
}
