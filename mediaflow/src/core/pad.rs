//! Port direction and presence.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadDirection {
    /// Receives data from upstream.
    Input,
    /// Sends data downstream.
    Output,
}

impl fmt::Display for PadDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Whether a port exists from construction or appears at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadPresence {
    /// Created with the stage.
    Always,
    /// Announced once the stage has inspected its input (demuxers, decode bins).
    Sometimes,
}
