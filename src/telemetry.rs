//! Tracing setup and rendering of lifecycle events for human-facing sinks.

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::events::Event;

/// Install the default tracing subscriber for hosts that have not set one
/// up: env-filtered fmt output plus span traces on errors. Safe to call
/// more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(ErrorLayer::default())
        .try_init();
}

pub const LINE_COLOR: &str = "\x1b[35m";
pub const RESET_COLOR: &str = "\x1b[0m";

/// Formats events for a text sink. Renders one line per event, without a
/// trailing newline; the sink decides line handling.
pub trait TelemetryFormatter: Send + Sync {
    fn render_event(&self, event: &Event) -> String;
}

/// Single-line formatter with a splash of color.
pub struct PlainFormatter;

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &Event) -> String {
        format!("{LINE_COLOR}{event}{RESET_COLOR}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_formatter_renders_a_single_line() {
        let rendered = PlainFormatter.render_event(&Event::diagnostic("scope", "message"));
        assert!(!rendered.contains('\n'));
        assert!(rendered.contains("scope: message"));
    }
}
