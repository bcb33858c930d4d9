//! Engine configuration with environment fallbacks.

use std::time::Duration;

use crate::events::{EventBus, MemorySink, StdOutSink};

/// Defaults applied to every queue and run unless a definition overrides
/// them per edge.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Slots per node queue.
    pub queue_capacity: usize,
    /// Default lease visibility timeout.
    pub visibility_timeout: Duration,
    /// Default retry budget per envelope.
    pub max_retries: u32,
    /// How long cancellation waits for in-flight executes before marking
    /// instances cancelled.
    pub grace_period: Duration,
    /// Safety cap for while-loops.
    pub loop_iteration_cap: u64,
    /// Promote reachability warnings to validation errors.
    pub strict_validation: bool,
    /// Skip validation entirely (used by subflows configured with
    /// `SkipValidation`; never the default).
    pub skip_validation: bool,
    pub event_bus: EventBusConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        dotenvy::dotenv().ok();
        Self {
            queue_capacity: env_usize("LOOMFLOW_QUEUE_CAPACITY", 1000),
            visibility_timeout: Duration::from_secs(env_u64(
                "LOOMFLOW_VISIBILITY_TIMEOUT_SECS",
                300,
            )),
            max_retries: env_u64("LOOMFLOW_MAX_RETRIES", 3) as u32,
            grace_period: Duration::from_millis(env_u64("LOOMFLOW_GRACE_PERIOD_MS", 5_000)),
            loop_iteration_cap: env_u64("LOOMFLOW_LOOP_ITERATION_CAP", 1000),
            strict_validation: false,
            skip_validation: false,
            event_bus: EventBusConfig::default(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    #[must_use]
    pub fn with_strict_validation(mut self) -> Self {
        self.strict_validation = true;
        self
    }

    #[must_use]
    pub fn with_event_bus(mut self, event_bus: EventBusConfig) -> Self {
        self.event_bus = event_bus;
        self
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Default per-subscriber event buffer depth.
///
/// Every node invocation publishes two lifecycle events (started plus a
/// terminal transition), so one full burst through a default-capacity
/// queue of 1000 envelopes produces about 2000 events. The buffer holds
/// one such burst before a slow subscriber starts lagging.
pub const DEFAULT_EVENT_BUFFER: usize = 2000;

/// Declarative sink selection for the lifecycle event bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkConfig {
    StdOut,
    Memory,
}

/// Event bus settings: buffer depth plus the sinks to attach at startup.
#[derive(Clone, Debug)]
pub struct EventBusConfig {
    pub buffer_capacity: usize,
    pub sinks: Vec<SinkConfig>,
}

impl EventBusConfig {
    /// No sinks; events are observable through subscriptions only.
    #[must_use]
    pub fn silent() -> Self {
        Self {
            buffer_capacity: env_usize("LOOMFLOW_EVENT_BUFFER", DEFAULT_EVENT_BUFFER),
            sinks: Vec::new(),
        }
    }

    /// Human-readable event lines on stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::silent().with_sink(SinkConfig::StdOut)
    }

    #[must_use]
    pub fn with_sink(mut self, sink: SinkConfig) -> Self {
        self.sinks.push(sink);
        self
    }

    #[must_use]
    pub fn with_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity.max(1);
        self
    }

    pub(crate) fn build_event_bus(&self) -> EventBus {
        let sinks = self
            .sinks
            .iter()
            .map(|sink| -> Box<dyn crate::events::EventSink> {
                match sink {
                    SinkConfig::StdOut => Box::new(StdOutSink::default()),
                    SinkConfig::Memory => Box::new(MemorySink::new()),
                }
            })
            .collect();
        EventBus::with_capacity(sinks, self.buffer_capacity)
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self::silent()
    }
}
