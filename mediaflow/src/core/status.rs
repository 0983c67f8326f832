//! Lifecycle states, stage kinds and state-change outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The role a stage plays in a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Produces data (network receiver, file/URI reader).
    Source,
    /// Consumes and produces data (scaler, encoder, payloader).
    Filter,
    /// Consumes data (network sender, renderer).
    Sink,
}

impl Default for StageKind {
    fn default() -> Self {
        Self::Filter
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Filter => write!(f, "filter"),
            Self::Sink => write!(f, "sink"),
        }
    }
}

/// Lifecycle state of a stage or pipeline.
///
/// States are totally ordered: `Null < Ready < Paused < Playing`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    /// Uninitialized; no resources held.
    #[default]
    Null,
    /// Resources (sockets, files) acquired.
    Ready,
    /// Negotiated and ready to flow, clock stopped.
    Paused,
    /// Data flowing.
    Playing,
}

impl State {
    /// All states in ascending order.
    pub const ALL: [Self; 4] = [Self::Null, Self::Ready, Self::Paused, Self::Playing];

    /// Returns the adjacent state one step towards `target`, if any.
    #[must_use]
    pub fn step_towards(self, target: Self) -> Option<Self> {
        match self.cmp(&target) {
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Less => Some(self.up()),
            std::cmp::Ordering::Greater => Some(self.down()),
        }
    }

    fn up(self) -> Self {
        match self {
            Self::Null => Self::Ready,
            Self::Ready => Self::Paused,
            Self::Paused | Self::Playing => Self::Playing,
        }
    }

    fn down(self) -> Self {
        match self {
            Self::Null | Self::Ready => Self::Null,
            Self::Paused => Self::Ready,
            Self::Playing => Self::Paused,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Ready => write!(f, "READY"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Playing => write!(f, "PLAYING"),
        }
    }
}

/// Result of a state change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateChangeOutcome {
    /// The change completed.
    Success,
    /// Still converging; completion is reported later.
    Async,
    /// The change failed.
    Failure,
}

impl StateChangeOutcome {
    /// Returns true for `Failure`.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure)
    }
}

impl fmt::Display for StateChangeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Async => write!(f, "async"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_are_ordered() {
        assert!(State::Null < State::Ready);
        assert!(State::Ready < State::Paused);
        assert!(State::Paused < State::Playing);
        assert_eq!(State::default(), State::Null);
    }

    #[test]
    fn test_step_towards() {
        assert_eq!(State::Null.step_towards(State::Playing), Some(State::Ready));
        assert_eq!(State::Playing.step_towards(State::Null), Some(State::Paused));
        assert_eq!(State::Paused.step_towards(State::Paused), None);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(State::Null.to_string(), "NULL");
        assert_eq!(State::Playing.to_string(), "PLAYING");
        assert_eq!(StageKind::Sink.to_string(), "sink");
    }

    #[test]
    fn test_state_serialize() {
        let json = serde_json::to_string(&State::Paused).unwrap();
        assert_eq!(json, r#""PAUSED""#);
        let back: State = serde_json::from_str(&json).unwrap();
        assert_eq!(back, State::Paused);
    }
}
