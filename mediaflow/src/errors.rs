//! Error types for the mediaflow framework.
//!
//! Construction-time and configuration failures are returned synchronously.
//! Failures that happen while media is flowing never come back as `Err` from a
//! blocking call: they travel as [`crate::events::Event`]s on the pipeline's bus.

use crate::core::State;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for mediaflow operations.
#[derive(Debug, Error)]
pub enum MediaflowError {
    /// The graph could not be built.
    #[error("{0}")]
    Construction(#[from] ConstructionError),

    /// The pipeline could not reach a requested state.
    #[error("{0}")]
    StateTransition(#[from] StateTransitionError),

    /// A port link could not be established.
    #[error("{0}")]
    Link(#[from] LinkError),

    /// Configuration input was invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error raised while building a graph or pipeline.
///
/// Always fatal: the partially built graph is released.
#[derive(Debug, Clone, Error)]
pub enum ConstructionError {
    /// No factory is registered under the requested name.
    #[error("Not all elements could be created: no factory '{factory}' for stage '{name}'")]
    MissingStage {
        /// Factory name that was requested.
        factory: String,
        /// Stage name it was requested for.
        name: String,
    },

    /// A stage with the same name already exists in the graph.
    #[error("Stage name '{0}' is already used in this graph")]
    DuplicateStage(String),

    /// A stage name or id does not belong to the graph.
    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    /// An eager link failed.
    #[error("Elements could not be linked: '{producer}' -> '{consumer}': {source}")]
    EagerLink {
        /// Producer stage.
        producer: String,
        /// Consumer stage.
        consumer: String,
        /// Underlying link failure.
        #[source]
        source: LinkError,
    },

    /// A stage rejected a configuration property.
    #[error("Invalid property '{property}' on stage '{stage}': {reason}")]
    InvalidProperty {
        /// Stage name.
        stage: String,
        /// Property key.
        property: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The worker pool could not be started.
    #[error("Could not start worker pool: {0}")]
    Runtime(String),
}

/// Outcome of a failed `link(output, input)`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The input port already has a peer. Callers treat this as satisfied.
    #[error("port '{0}' is already linked")]
    AlreadyLinked(String),

    /// The offered and accepted capabilities do not intersect.
    #[error("capabilities do not intersect: offered {offered}, accepted {accepted}")]
    TypeMismatch {
        /// What the producer offered.
        offered: String,
        /// What the consumer accepts.
        accepted: String,
    },

    /// A port does not exist on its stage.
    #[error("port '{0}' does not exist")]
    PortUnavailable(String),

    /// Output was given where an input is required, or vice versa.
    #[error("port '{0}' has the wrong direction for this link")]
    WrongDirection(String),

    /// One of the stages is being shut down.
    #[error("stage '{0}' is flushing")]
    Flushing(String),

    /// A port with this name already exists on the stage.
    #[error("port '{0}' already exists")]
    DuplicatePort(String),
}

impl LinkError {
    /// Returns true for the idempotent "already satisfied" outcome.
    #[must_use]
    pub fn is_already_linked(&self) -> bool {
        matches!(self, Self::AlreadyLinked(_))
    }
}

/// Error raised when a pipeline cannot reach a requested state.
#[derive(Debug, Clone, Error)]
#[error("Unable to set pipeline '{pipeline}' from {from} to {to}: {reason}")]
pub struct StateTransitionError {
    /// Pipeline name.
    pub pipeline: String,
    /// State before the request.
    pub from: State,
    /// Requested state.
    pub to: State,
    /// Diagnostic.
    pub reason: String,
}

impl StateTransitionError {
    /// Creates a new state transition error.
    #[must_use]
    pub fn new(pipeline: impl Into<String>, from: State, to: State, reason: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            from,
            to,
            reason: reason.into(),
        }
    }
}

/// Invalid configuration, detected before any stage is created.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The requested resolution is not in the lookup table.
    #[error("illegal resolution {0} (supported: 720, 1080, 2160)")]
    UnsupportedResolution(u32),

    /// A capability string could not be parsed.
    #[error("invalid capability string '{input}': {reason}")]
    InvalidCaps {
        /// The offending input.
        input: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A field has an out-of-range or malformed value.
    #[error("invalid value for '{field}': {reason}")]
    Invalid {
        /// Field name.
        field: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The config file could not be read.
    #[error("could not read config file '{}': {source}", path.display())]
    Read {
        /// File path.
        path: PathBuf,
        /// IO failure.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("could not parse config file '{}': {source}", path.display())]
    Parse {
        /// File path.
        path: PathBuf,
        /// Parser failure.
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    /// Creates an invalid-field error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Error returned by a stage that rejects a property.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropertyError {
    /// The stage has no property with this key.
    #[error("no such property")]
    Unknown,
    /// The value has the wrong type or range.
    #[error("{0}")]
    InvalidValue(String),
}

/// Result of pushing data or caps through a port.
///
/// Only [`FlowError::Error`] means something went wrong that the pipeline
/// must report; the stage has already posted the matching error event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// The output port has no peer.
    #[error("not-linked")]
    NotLinked,
    /// The stage or its peer is shutting down.
    #[error("flushing")]
    Flushing,
    /// The peer does not want more data.
    #[error("eos")]
    Eos,
    /// Caps could not be agreed with the peer.
    #[error("not-negotiated: {0}")]
    NotNegotiated(String),
    /// A fatal error, already posted on the bus.
    #[error("error")]
    Error,
}

impl FlowError {
    /// Returns true for outcomes that end streaming without being an error.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        matches!(self, Self::Flushing | Self::Eos)
    }
}
