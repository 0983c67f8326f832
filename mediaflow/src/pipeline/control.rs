//! The blocking control loop that observes a running pipeline.

use super::Pipeline;
use crate::events::{ErrorDetails, EventBody, EventMask, EventOrigin};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Why a control loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every sink consumed its last buffer.
    EndOfStream,
    /// A stage or the pipeline posted a fatal error.
    Error {
        /// Who posted it.
        origin: EventOrigin,
        /// What went wrong.
        details: ErrorDetails,
    },
    /// The bus was flushed before a terminal event arrived.
    BusClosed,
    /// The overall deadline passed.
    TimedOut,
}

impl RunOutcome {
    /// Returns true if the run ended on an error event.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfStream => f.write_str("end of stream"),
            Self::Error { origin, details } => write!(f, "error from {origin}: {details}"),
            Self::BusClosed => f.write_str("bus closed"),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Finite-state loop over a pipeline's bus.
///
/// Only pipeline-originated state changes, errors and end of stream are
/// polled for. The loop never changes the pipeline's state itself; the
/// caller decides how to tear down based on the [`RunOutcome`].
#[derive(Debug, Clone, Default)]
pub struct ControlLoop {
    timeout: Option<Duration>,
}

impl ControlLoop {
    /// A loop that waits forever.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gives up after `timeout` without a terminal event.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Blocks until a terminal event arrives.
    pub fn run(&self, pipeline: &Pipeline) -> RunOutcome {
        let bus = pipeline.bus();
        let deadline = self.timeout.map(|t| Instant::now() + t);

        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return RunOutcome::TimedOut;
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let Some(event) = bus.poll_filtered(remaining, EventMask::CONTROL) else {
                if bus.is_flushing() {
                    return RunOutcome::BusClosed;
                }
                continue;
            };

            match event.body {
                EventBody::StateChanged { old, new, pending } => {
                    if event.origin.is_pipeline() {
                        match pending {
                            Some(pending) => info!(
                                pipeline = %pipeline.name(),
                                from = %old,
                                to = %new,
                                %pending,
                                "Pipeline state changed from {old} to {new}"
                            ),
                            None => info!(
                                pipeline = %pipeline.name(),
                                from = %old,
                                to = %new,
                                "Pipeline state changed from {old} to {new}"
                            ),
                        }
                    }
                }
                EventBody::Error(details) => {
                    error!(
                        pipeline = %pipeline.name(),
                        origin = %event.origin,
                        code = %details.code,
                        "Error received from element {}: {}",
                        event.origin,
                        details.message
                    );
                    debug!(
                        debug = details.debug.as_deref().unwrap_or("none"),
                        "Debugging information"
                    );
                    return RunOutcome::Error {
                        origin: event.origin,
                        details,
                    };
                }
                EventBody::EndOfStream => {
                    info!(pipeline = %pipeline.name(), "End-Of-Stream reached.");
                    return RunOutcome::EndOfStream;
                }
                EventBody::Warning(_) => {
                    error!(pipeline = %pipeline.name(), event = %event, "Unexpected message received.");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ErrorCode, Event};
    use crate::graph::Graph;
    use crate::pipeline::PipelineOptions;

    fn empty_pipeline() -> Pipeline {
        Pipeline::with_options(
            Graph::new("control"),
            PipelineOptions::default().with_event_logging(false),
        )
        .unwrap()
    }

    #[test]
    fn test_stops_on_end_of_stream() {
        let pipeline = empty_pipeline();
        let bus = pipeline.bus();
        bus.post(Event::stage_state_changed("a", crate::core::State::Null, crate::core::State::Ready));
        bus.post(Event::end_of_stream("control"));
        assert_eq!(ControlLoop::new().run(&pipeline), RunOutcome::EndOfStream);
    }

    #[test]
    fn test_stops_on_error() {
        let pipeline = empty_pipeline();
        let details = ErrorDetails::new(ErrorCode::ResourceNotFound, "Resource not found.");
        pipeline
            .bus()
            .post(Event::error(EventOrigin::Stage("source".into()), details.clone()));

        let outcome = ControlLoop::new().run(&pipeline);
        assert!(outcome.is_error());
        assert_eq!(
            outcome,
            RunOutcome::Error {
                origin: EventOrigin::Stage("source".into()),
                details
            }
        );
    }

    #[test]
    fn test_warnings_are_not_terminal() {
        let pipeline = empty_pipeline();
        let bus = pipeline.bus();
        bus.post(Event::warning(
            EventOrigin::Stage("source".into()),
            ErrorDetails::new(ErrorCode::StreamFormat, "could not link"),
        ));
        let outcome = ControlLoop::new()
            .with_timeout(Duration::from_millis(50))
            .run(&pipeline);
        assert_eq!(outcome, RunOutcome::TimedOut);
    }

    #[test]
    fn test_flushed_bus_closes_loop() {
        let pipeline = empty_pipeline();
        pipeline.bus().set_flushing(true);
        assert_eq!(ControlLoop::new().run(&pipeline), RunOutcome::BusClosed);
    }
}
