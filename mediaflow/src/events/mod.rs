//! Pipeline events and the event bus.
//!
//! The bus is the only channel through which the controlling logic learns
//! about state changes, runtime errors and end of stream. Each pipeline owns
//! exactly one [`EventBus`]; there is no process-wide channel.

mod bus;
mod event;
mod sink;

pub use bus::{BusStats, EventBus, DEFAULT_BUS_CAPACITY};
pub use event::{
    ErrorCode, ErrorDetails, Event, EventBody, EventKind, EventMask, EventOrigin,
};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink};
