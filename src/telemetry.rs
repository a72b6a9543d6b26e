//! Injected logging for the statistics core.
//!
//! Every component takes a [`SharedTelemetry`] at construction instead of
//! reaching for a process-global logger. The binary wires in
//! [`TracingTelemetry`]; tests use [`NoopTelemetry`] or [`RecordingTelemetry`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        };
        f.write_str(s)
    }
}

pub trait Telemetry: Send + Sync {
    fn event(&self, level: Level, component: &str, message: &str);

    #[inline]
    fn debug(&self, component: &str, message: &str) {
        self.event(Level::Debug, component, message);
    }

    #[inline]
    fn info(&self, component: &str, message: &str) {
        self.event(Level::Info, component, message);
    }

    #[inline]
    fn warn(&self, component: &str, message: &str) {
        self.event(Level::Warn, component, message);
    }

    #[inline]
    fn error(&self, component: &str, message: &str) {
        self.event(Level::Error, component, message);
    }
}

pub type SharedTelemetry = Arc<dyn Telemetry>;

/// Forwards to `tracing`, with the component as a structured field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn event(&self, level: Level, component: &str, message: &str) {
        match level {
            Level::Debug => tracing::debug!(component, "{message}"),
            Level::Info => tracing::info!(component, "{message}"),
            Level::Warn => tracing::warn!(component, "{message}"),
            Level::Error => tracing::error!(component, "{message}"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    #[inline]
    fn event(&self, _level: Level, _component: &str, _message: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub level: Level,
    pub component: String,
    pub message: String,
}

/// Keeps every event in memory so tests can assert on what was logged.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, level: Level) -> usize {
        self.events.lock().iter().filter(|e| e.level == level).count()
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.events
            .lock()
            .iter()
            .any(|e| e.level == level && e.message.contains(needle))
    }
}

impl Telemetry for RecordingTelemetry {
    fn event(&self, level: Level, component: &str, message: &str) {
        self.events.lock().push(RecordedEvent {
            level,
            component: component.to_string(),
            message: message.to_string(),
        });
    }
}

pub fn noop() -> SharedTelemetry {
    Arc::new(NoopTelemetry)
}

pub fn tracing() -> SharedTelemetry {
    Arc::new(TracingTelemetry)
}

/// Installs the fmt subscriber. `RUST_LOG` wins over the configured level.
pub fn init_subscriber(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_telemetry_keeps_order_and_levels() {
        let telemetry = RecordingTelemetry::new();
        telemetry.info("processor", "started");
        telemetry.warn("processor", "bad line 3");
        telemetry.error("cache", "write failed");

        let events = telemetry.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].level, Level::Info);
        assert_eq!(events[1].component, "processor");
        assert_eq!(telemetry.count(Level::Warn), 1);
        assert!(telemetry.contains(Level::Error, "write failed"));
        assert!(!telemetry.contains(Level::Warn, "write failed"));
    }

    #[test]
    fn test_noop_telemetry_accepts_everything() {
        let telemetry = noop();
        telemetry.debug("x", "y");
        telemetry.error("x", "y");
    }

    #[test]
    fn test_level_display() {
        assert_eq!(Level::Warn.to_string(), "WARN");
        assert!(Level::Error > Level::Debug);
    }
}
