//! Observability utilities.
//!
//! Logging goes through `tracing`. This module installs the subscriber and
//! builds the span that wraps one pipeline run.

mod spans;
mod subscriber;

pub use spans::{RunSpanAttributes, SpanTimer};
pub use subscriber::{init_subscriber, LogFormat, LogSettings};
