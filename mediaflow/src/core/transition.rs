//! Single-step state transitions.

use super::State;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One adjacent-state transition, as delivered to a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateChange {
    /// Acquire resources.
    NullToReady,
    /// Prepare to flow; sources may discover their ports here.
    ReadyToPaused,
    /// Start data flow.
    PausedToPlaying,
    /// Stop data flow.
    PlayingToPaused,
    /// Flush and forget negotiated state.
    PausedToReady,
    /// Release resources.
    ReadyToNull,
}

impl StateChange {
    /// Returns the transition between two adjacent states.
    #[must_use]
    pub fn between(from: State, to: State) -> Option<Self> {
        match (from, to) {
            (State::Null, State::Ready) => Some(Self::NullToReady),
            (State::Ready, State::Paused) => Some(Self::ReadyToPaused),
            (State::Paused, State::Playing) => Some(Self::PausedToPlaying),
            (State::Playing, State::Paused) => Some(Self::PlayingToPaused),
            (State::Paused, State::Ready) => Some(Self::PausedToReady),
            (State::Ready, State::Null) => Some(Self::ReadyToNull),
            _ => None,
        }
    }

    /// The state the transition starts from.
    #[must_use]
    pub fn current(self) -> State {
        match self {
            Self::NullToReady => State::Null,
            Self::ReadyToPaused | Self::ReadyToNull => State::Ready,
            Self::PausedToPlaying | Self::PausedToReady => State::Paused,
            Self::PlayingToPaused => State::Playing,
        }
    }

    /// The state the transition ends in.
    #[must_use]
    pub fn next(self) -> State {
        match self {
            Self::ReadyToNull => State::Null,
            Self::NullToReady | Self::PausedToReady => State::Ready,
            Self::ReadyToPaused | Self::PlayingToPaused => State::Paused,
            Self::PausedToPlaying => State::Playing,
        }
    }

    /// Returns true for transitions towards `Playing`.
    #[must_use]
    pub fn is_upward(self) -> bool {
        self.next() > self.current()
    }
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.current(), self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_between_adjacent_only() {
        assert_eq!(
            StateChange::between(State::Null, State::Ready),
            Some(StateChange::NullToReady)
        );
        assert_eq!(StateChange::between(State::Null, State::Playing), None);
        assert_eq!(StateChange::between(State::Paused, State::Paused), None);
    }

    #[test]
    fn test_current_and_next_round_trip() {
        for from in State::ALL {
            for to in State::ALL {
                if let Some(change) = StateChange::between(from, to) {
                    assert_eq!(change.current(), from);
                    assert_eq!(change.next(), to);
                    assert_eq!(change.is_upward(), to > from);
                }
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(StateChange::ReadyToNull.to_string(), "READY -> NULL");
    }
}
