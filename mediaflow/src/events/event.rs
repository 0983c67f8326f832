//! Event records posted on a pipeline's bus.

use crate::core::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Domain of a runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A URI, file or address could not be found or resolved.
    ResourceNotFound,
    /// A resource exists but could not be opened or bound.
    ResourceOpenFailed,
    /// Reading from a resource failed.
    ResourceRead,
    /// Writing to a resource failed.
    ResourceWrite,
    /// Stream data could not be decoded.
    StreamDecode,
    /// Capabilities could not be negotiated.
    StreamFormat,
    /// Internal data flow error (unlinked or unnegotiated port).
    StreamFailed,
    /// A stage failed to change state.
    StateChange,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ResourceNotFound => "resource not found",
            Self::ResourceOpenFailed => "resource open failed",
            Self::ResourceRead => "resource read failed",
            Self::ResourceWrite => "resource write failed",
            Self::StreamDecode => "stream decode failed",
            Self::StreamFormat => "stream format not negotiated",
            Self::StreamFailed => "stream failed",
            Self::StateChange => "state change failed",
        };
        f.write_str(s)
    }
}

/// Payload of an error or warning event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Error domain.
    pub code: ErrorCode,
    /// Human-readable diagnostic.
    pub message: String,
    /// Optional debug detail.
    pub debug: Option<String>,
}

impl ErrorDetails {
    /// Creates error details without debug info.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            debug: None,
        }
    }

    /// Attaches debug detail.
    #[must_use]
    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = Some(debug.into());
        self
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Who posted an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum EventOrigin {
    /// The pipeline itself.
    Pipeline(String),
    /// A stage inside the pipeline.
    Stage(String),
}

impl EventOrigin {
    /// Name of the originating object.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Pipeline(name) | Self::Stage(name) => name,
        }
    }

    /// Returns true for events posted by the pipeline.
    #[must_use]
    pub fn is_pipeline(&self) -> bool {
        matches!(self, Self::Pipeline(_))
    }
}

impl fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind-specific event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventBody {
    /// A lifecycle state changed.
    StateChanged {
        /// Previous state.
        old: State,
        /// New state.
        new: State,
        /// Final target when more steps are pending.
        pending: Option<State>,
    },
    /// A fatal runtime error.
    Error(ErrorDetails),
    /// A non-fatal diagnostic, e.g. a lazy link that failed after a type match.
    Warning(ErrorDetails),
    /// All sinks have consumed their last buffer.
    EndOfStream,
}

/// Discriminant of [`EventBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// See [`EventBody::StateChanged`].
    StateChanged,
    /// See [`EventBody::Error`].
    Error,
    /// See [`EventBody::Warning`].
    Warning,
    /// See [`EventBody::EndOfStream`].
    EndOfStream,
}

impl EventKind {
    const fn bit(self) -> u8 {
        match self {
            Self::StateChanged => 1,
            Self::Error => 1 << 1,
            Self::Warning => 1 << 2,
            Self::EndOfStream => 1 << 3,
        }
    }
}

/// A set of [`EventKind`]s used to filter bus polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventMask(u8);

impl EventMask {
    /// Matches nothing.
    pub const NONE: Self = Self(0);
    /// Matches every kind.
    pub const ALL: Self = Self(0b1111);
    /// The kinds the control loop acts on.
    pub const CONTROL: Self = Self(
        EventKind::StateChanged.bit() | EventKind::Error.bit() | EventKind::EndOfStream.bit(),
    );

    /// Returns true if `kind` is in the mask.
    #[must_use]
    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

impl From<EventKind> for EventMask {
    fn from(kind: EventKind) -> Self {
        Self(kind.bit())
    }
}

impl BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOr<EventKind> for EventMask {
    type Output = Self;

    fn bitor(self, rhs: EventKind) -> Self {
        Self(self.0 | rhs.bit())
    }
}

impl BitOr for EventKind {
    type Output = EventMask;

    fn bitor(self, rhs: Self) -> EventMask {
        EventMask(self.bit() | rhs.bit())
    }
}

impl BitOrAssign<EventKind> for EventMask {
    fn bitor_assign(&mut self, rhs: EventKind) {
        self.0 |= rhs.bit();
    }
}

/// An immutable notification posted by a stage or the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Who posted it.
    pub origin: EventOrigin,
    /// Monotonic sequence number assigned by the bus.
    pub seqnum: u64,
    /// Wall-clock time of posting.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    pub body: EventBody,
}

impl Event {
    /// Creates an event; the bus assigns the sequence number on post.
    #[must_use]
    pub fn new(origin: EventOrigin, body: EventBody) -> Self {
        Self {
            origin,
            seqnum: 0,
            timestamp: Utc::now(),
            body,
        }
    }

    /// A state change posted by the pipeline.
    #[must_use]
    pub fn pipeline_state_changed(
        pipeline: impl Into<String>,
        old: State,
        new: State,
        pending: Option<State>,
    ) -> Self {
        Self::new(
            EventOrigin::Pipeline(pipeline.into()),
            EventBody::StateChanged { old, new, pending },
        )
    }

    /// A state change posted by a stage.
    #[must_use]
    pub fn stage_state_changed(stage: impl Into<String>, old: State, new: State) -> Self {
        Self::new(
            EventOrigin::Stage(stage.into()),
            EventBody::StateChanged {
                old,
                new,
                pending: None,
            },
        )
    }

    /// An error posted by `origin`.
    #[must_use]
    pub fn error(origin: EventOrigin, details: ErrorDetails) -> Self {
        Self::new(origin, EventBody::Error(details))
    }

    /// A warning posted by `origin`.
    #[must_use]
    pub fn warning(origin: EventOrigin, details: ErrorDetails) -> Self {
        Self::new(origin, EventBody::Warning(details))
    }

    /// End of stream for the whole pipeline.
    #[must_use]
    pub fn end_of_stream(pipeline: impl Into<String>) -> Self {
        Self::new(EventOrigin::Pipeline(pipeline.into()), EventBody::EndOfStream)
    }

    /// The event's kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self.body {
            EventBody::StateChanged { .. } => EventKind::StateChanged,
            EventBody::Error(_) => EventKind::Error,
            EventBody::Warning(_) => EventKind::Warning,
            EventBody::EndOfStream => EventKind::EndOfStream,
        }
    }

    /// Error details, for error events.
    #[must_use]
    pub fn error_details(&self) -> Option<&ErrorDetails> {
        match &self.body {
            EventBody::Error(details) => Some(details),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            EventBody::StateChanged { old, new, pending } => match pending {
                Some(pending) => write!(
                    f,
                    "{}: state changed from {old} to {new} (pending {pending})",
                    self.origin
                ),
                None => write!(f, "{}: state changed from {old} to {new}", self.origin),
            },
            EventBody::Error(details) => write!(f, "{}: error: {details}", self.origin),
            EventBody::Warning(details) => write!(f, "{}: warning: {details}", self.origin),
            EventBody::EndOfStream => write!(f, "{}: end of stream", self.origin),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_contains() {
        let mask = EventKind::Error | EventKind::EndOfStream;
        assert!(mask.contains(EventKind::Error));
        assert!(mask.contains(EventKind::EndOfStream));
        assert!(!mask.contains(EventKind::Warning));
        assert!(!EventMask::CONTROL.contains(EventKind::Warning));
        assert!(EventMask::ALL.contains(EventKind::Warning));
    }

    #[test]
    fn test_event_kind_and_origin() {
        let event = Event::pipeline_state_changed("p", State::Null, State::Ready, Some(State::Playing));
        assert_eq!(event.kind(), EventKind::StateChanged);
        assert!(event.origin.is_pipeline());
        assert_eq!(event.origin.name(), "p");
        assert!(event.error_details().is_none());

        let err = Event::error(
            EventOrigin::Stage("source".into()),
            ErrorDetails::new(ErrorCode::ResourceNotFound, "missing").with_debug("file://x"),
        );
        assert_eq!(err.kind(), EventKind::Error);
        assert_eq!(err.error_details().and_then(|d| d.debug.as_deref()), Some("file://x"));
    }

    #[test]
    fn test_event_display() {
        let event = Event::stage_state_changed("udp_sink", State::Ready, State::Paused);
        assert_eq!(event.to_string(), "udp_sink: state changed from READY to PAUSED");
    }

    #[test]
    fn test_event_serializes_to_json() {
        let event = Event::end_of_stream("receive");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["body"]["kind"], "end_of_stream");
        assert_eq!(json["origin"]["type"], "pipeline");
    }
}
