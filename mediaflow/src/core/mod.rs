//! Core domain model types for mediaflow.
//!
//! This module contains the fundamental types used throughout the framework:
//! - Lifecycle states and the single-step transitions between them
//! - Stage kinds and state change outcomes
//! - Port direction and presence

mod pad;
mod status;
mod transition;

pub use pad::{PadDirection, PadPresence};
pub use status::{StageKind, State, StateChangeOutcome};
pub use transition::StateChange;
