//! Event sink trait and implementations.
//!
//! Sinks are taps on an [`super::EventBus`]: they see every posted event
//! synchronously, in posting order, without consuming it.

use super::{Event, EventBody, EventKind};
use tracing::{debug, error, info, warn, Level};

/// Trait for observers attached to an event bus.
pub trait EventSink: Send + Sync {
    /// Receives a posted event.
    ///
    /// Runs on the posting thread and must not block.
    fn try_emit(&self, event: &Event);
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::DEBUG }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Creates an info-level logging sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }
}

impl EventSink for LoggingEventSink {
    fn try_emit(&self, event: &Event) {
        // errors and warnings keep their own severity
        match &event.body {
            EventBody::Error(details) => {
                error!(origin = %event.origin, seqnum = event.seqnum, code = %details.code, debug = ?details.debug, "{}", details.message);
            }
            EventBody::Warning(details) => {
                warn!(origin = %event.origin, seqnum = event.seqnum, code = %details.code, debug = ?details.debug, "{}", details.message);
            }
            _ if self.level == Level::INFO => {
                info!(origin = %event.origin, seqnum = event.seqnum, "{event}");
            }
            _ => {
                debug!(origin = %event.origin, seqnum = event.seqnum, "{event}");
            }
        }
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<Event>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
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

    /// Returns events of one kind.
    #[must_use]
    pub fn events_of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    /// Returns the number of events of one kind.
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.events.read().iter().filter(|e| e.kind() == kind).count()
    }
}

impl EventSink for CollectingEventSink {
    fn try_emit(&self, event: &Event) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::State;
    use crate::events::{ErrorCode, ErrorDetails, EventOrigin};

    #[test]
    fn test_logging_sink() {
        let sink = LoggingEventSink::info();
        sink.try_emit(&Event::end_of_stream("p"));
        sink.try_emit(&Event::warning(
            EventOrigin::Stage("s".into()),
            ErrorDetails::new(ErrorCode::StreamFormat, "link failed"),
        ));
        // Should not panic
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.try_emit(&Event::stage_state_changed("a", State::Null, State::Ready));
        sink.try_emit(&Event::end_of_stream("p"));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.count(EventKind::EndOfStream), 1);
        assert_eq!(sink.events_of_kind(EventKind::StateChanged)[0].origin.name(), "a");
    }

    #[test]
    fn test_collecting_sink_clear() {
        let sink = CollectingEventSink::new();
        sink.try_emit(&Event::end_of_stream("p"));
        assert_eq!(sink.len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }
}
