//! Sink orchestration over the broadcast hub.
//!
//! One dispatcher task owns every sink and fans each event out to them in
//! registration order. Sinks reach the dispatcher through a command
//! channel, so they can be registered before or after the dispatcher
//! starts without sharing locks; the dispatcher is the only code that
//! ever touches a sink. Shutdown closes the hub, and the dispatcher
//! drains whatever is still buffered before it exits.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::emitter::{EventEmitter, HubEmitter};
use super::event::Event;
use super::hub::{BroadcastHub, EventStream, HubMetrics};
use super::sink::{EventSink, StdOutSink};

enum BusCommand {
    AddSink(Box<dyn EventSink>),
}

/// Central event broadcasting system for workflow execution events.
pub struct EventBus {
    hub: Arc<BroadcastHub<Event>>,
    commands: flume::Sender<BusCommand>,
    /// Held until the dispatcher starts; commands queue up in the channel
    /// in the meantime.
    command_feed: Mutex<Option<flume::Receiver<BusCommand>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sink(StdOutSink::default())
    }
}

impl EventBus {
    pub fn with_sink<T>(sink: T) -> Self
    where
        T: EventSink + 'static,
    {
        Self::with_sinks(vec![Box::new(sink)])
    }

    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self::with_capacity(sinks, crate::config::DEFAULT_EVENT_BUFFER)
    }

    pub fn with_capacity(sinks: Vec<Box<dyn EventSink>>, buffer_capacity: usize) -> Self {
        let (commands, command_feed) = flume::unbounded();
        for sink in sinks {
            let _ = commands.send(BusCommand::AddSink(sink));
        }
        Self {
            hub: BroadcastHub::new(buffer_capacity),
            commands,
            command_feed: Mutex::new(Some(command_feed)),
            dispatcher: Mutex::new(None),
        }
    }

    /// Bus with no sinks at all; events are only observable via
    /// [`subscribe`](Self::subscribe).
    pub fn silent() -> Self {
        Self::with_sinks(Vec::new())
    }

    /// Register a sink. Takes effect immediately once the dispatcher is
    /// running, or on startup otherwise.
    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        let _ = self.commands.send(BusCommand::AddSink(Box::new(sink)));
    }

    pub fn emitter(&self) -> Arc<dyn EventEmitter> {
        Arc::new(HubEmitter::new(self.hub.clone()))
    }

    pub fn subscribe(&self) -> EventStream<Event> {
        self.hub.subscribe()
    }

    pub fn metrics(&self) -> HubMetrics {
        self.hub.metrics()
    }

    /// Start the dispatcher. Idempotent; a second call while one is
    /// running does nothing.
    pub fn listen_for_events(&self) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }
        let Some(command_feed) = self.command_feed.lock().take() else {
            return;
        };
        let stream = self.hub.subscribe();
        *dispatcher = Some(tokio::spawn(dispatch(stream, command_feed)));
    }

    /// Close the hub and wait for the dispatcher to drain and exit.
    pub async fn shutdown(&self) {
        self.hub.close();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.hub.close();
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}

/// The dispatcher loop: interleave sink registrations with event
/// delivery, then drain to the end of the stream once the hub closes.
async fn dispatch(mut stream: EventStream<Event>, commands: flume::Receiver<BusCommand>) {
    let mut sinks: Vec<Box<dyn EventSink>> = Vec::new();
    // Apply every registration queued before startup so the first event
    // already sees the constructor-provided sinks.
    while let Ok(BusCommand::AddSink(sink)) = commands.try_recv() {
        sinks.push(sink);
    }
    let mut registrations_open = true;

    loop {
        if registrations_open {
            tokio::select! {
                biased;
                command = commands.recv_async() => match command {
                    Ok(BusCommand::AddSink(sink)) => sinks.push(sink),
                    // Bus handle gone; no further registrations can arrive.
                    Err(_) => registrations_open = false,
                },
                event = stream.recv() => {
                    if !handle_event(&mut sinks, event) {
                        return;
                    }
                }
            }
        } else {
            let event = stream.recv().await;
            if !handle_event(&mut sinks, event) {
                return;
            }
        }
    }
}

/// Deliver one receive result to every sink. Returns `false` once the
/// stream has ended.
fn handle_event(sinks: &mut [Box<dyn EventSink>], event: Result<Event, RecvError>) -> bool {
    match event {
        Ok(event) => {
            for sink in sinks.iter_mut() {
                if let Err(err) = sink.handle(&event) {
                    tracing::warn!(sink = %sink.name(), %err, "event sink failed to handle event");
                }
            }
            true
        }
        Err(RecvError::Lagged(_)) => true,
        Err(RecvError::Closed) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::sink::MemorySink;
    use std::time::Duration;

    #[tokio::test]
    async fn sinks_receive_emitted_events() {
        let sink = MemorySink::new();
        let bus = EventBus::with_sink(sink.clone());
        bus.listen_for_events();

        bus.emitter().emit(Event::diagnostic("test", "ping")).unwrap();

        // Shutdown drains the dispatcher, so everything emitted before it
        // is delivered.
        bus.shutdown().await;
        let captured = sink.snapshot();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].to_string(), "test: ping");
    }

    #[tokio::test]
    async fn sinks_added_after_startup_see_later_events() {
        let bus = EventBus::silent();
        bus.listen_for_events();

        let late = MemorySink::new();
        bus.add_sink(late.clone());
        // Give the dispatcher a beat to pick up the registration.
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.emitter().emit(Event::diagnostic("late", "seen")).unwrap();
        bus.shutdown().await;
        assert_eq!(late.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_sees_events_without_sinks() {
        let bus = EventBus::silent();
        let mut stream = bus.subscribe();
        bus.emitter().emit(Event::diagnostic("a", "b")).unwrap();
        let event = stream.next_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.to_string(), "a: b");
    }
}
