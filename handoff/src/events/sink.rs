//! Destinations for run lifecycle events.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, Level};

/// Receives run and stage lifecycle events.
///
/// The coordinator calls [`EventSink::emit`] in transition order. Stage tasks
/// only use [`EventSink::try_emit`], which must not block or panic.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers `event_type` (one of the names in [`crate::events`]) with an
    /// optional JSON payload.
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Best-effort delivery from synchronous or latency-sensitive code.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes each event as a `tracing` record with `run_id` and `stage` fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// `DEBUG` logs at debug level; any other level logs at info.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Shorthand for `new(Level::DEBUG)`.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn record(&self, event_type: &str, data: Option<&Value>) {
        let field = |name: &str| {
            data.and_then(|d| d.get(name))
                .and_then(Value::as_str)
                .unwrap_or("-")
                .to_string()
        };
        let (run_id, stage) = (field("run_id"), field("stage"));
        if self.level == Level::DEBUG {
            debug!(event_type, run_id = %run_id, stage = %stage, payload = ?data, "{event_type}");
        } else {
            info!(event_type, run_id = %run_id, stage = %stage, "{event_type}");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.record(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.record(event_type, data.as_ref());
    }
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Stage ids of events with exactly this type, in emission order.
    #[must_use]
    pub fn stages_for(&self, event_type: &str) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t == event_type)
            .filter_map(|(_, data)| stage_of(data.as_ref()).map(str::to_string))
            .collect()
    }

    /// Position of the first event with this type for `stage`.
    #[must_use]
    pub fn position(&self, event_type: &str, stage: &str) -> Option<usize> {
        self.events
            .read()
            .iter()
            .position(|(t, data)| t == event_type && stage_of(data.as_ref()) == Some(stage))
    }
}

fn stage_of(data: Option<&Value>) -> Option<&str> {
    data.and_then(|d| d.get("stage")).and_then(Value::as_str)
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}
