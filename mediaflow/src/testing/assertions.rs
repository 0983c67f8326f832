//! Assertions over collected pipeline events.

use crate::core::State;
use crate::events::{Event, EventKind};

use super::fixtures::pipeline_transitions;

/// Asserts that no error event was posted.
///
/// # Panics
///
/// Panics listing the first error found.
pub fn assert_no_errors(events: &[Event]) {
    if let Some(event) = events.iter().find(|e| e.kind() == EventKind::Error) {
        panic!("Expected no error events, got: {event}");
    }
}

/// Asserts that at least one error event was posted.
///
/// # Panics
///
/// Panics if there is none.
pub fn assert_has_error(events: &[Event]) {
    assert!(
        events.iter().any(|e| e.kind() == EventKind::Error),
        "Expected an error event, got {} events without one",
        events.len()
    );
}

/// Asserts that end of stream was never posted.
///
/// # Panics
///
/// Panics if it was.
pub fn assert_no_end_of_stream(events: &[Event]) {
    assert!(
        !events.iter().any(|e| e.kind() == EventKind::EndOfStream),
        "Expected no end of stream"
    );
}

/// Asserts that the pipeline itself reported reaching `state`.
///
/// # Panics
///
/// Panics if no pipeline state change ends in `state`.
pub fn assert_pipeline_reached(events: &[Event], state: State) {
    let transitions = pipeline_transitions(events);
    assert!(
        transitions.iter().any(|(_, new)| *new == state),
        "Expected pipeline to reach {state}, transitions were {transitions:?}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ErrorCode, ErrorDetails, EventOrigin};

    fn error_event() -> Event {
        Event::error(
            EventOrigin::Stage("udp_sink".into()),
            ErrorDetails::new(ErrorCode::ResourceWrite, "send failed"),
        )
    }

    #[test]
    fn test_assert_no_errors() {
        assert_no_errors(&[Event::end_of_stream("p")]);
    }

    #[test]
    #[should_panic(expected = "Expected no error events")]
    fn test_assert_no_errors_fails() {
        assert_no_errors(&[error_event()]);
    }

    #[test]
    fn test_assert_has_error() {
        assert_has_error(&[error_event()]);
    }

    #[test]
    fn test_assert_pipeline_reached() {
        let events = [Event::pipeline_state_changed("p", State::Paused, State::Playing, None)];
        assert_pipeline_reached(&events, State::Playing);
        assert_no_end_of_stream(&events);
    }

    #[test]
    #[should_panic(expected = "Expected pipeline to reach PLAYING")]
    fn test_assert_pipeline_reached_fails() {
        assert_pipeline_reached(&[Event::stage_state_changed("a", State::Paused, State::Playing)], State::Playing);
    }
}
