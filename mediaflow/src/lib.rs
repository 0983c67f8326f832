//! # Mediaflow
//!
//! A media pipeline execution core, with the two RTP-over-UDP video
//! pipelines built on top of it.
//!
//! Mediaflow provides:
//!
//! - **Stage graphs**: stages connected by typed ports whose capabilities are
//!   negotiated when they are linked
//! - **Lazy pad discovery**: ports that appear only once a stream has been
//!   inspected, linked or rejected by media family as they are announced
//! - **A pipeline state machine**: NULL, READY, PAUSED and PLAYING, applied
//!   coherently to every stage, with asynchronous completion
//! - **An event bus**: state changes, errors and end of stream, observed
//!   without touching the streaming threads
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mediaflow::prelude::*;
//!
//! let registry = StageRegistry::with_builtins();
//! let config = SourceConfig::new().with_destination("127.0.0.1", 5000);
//! let pipeline = build_source_pipeline(&config, &registry)?;
//!
//! let status = run_pipeline(&pipeline)?;
//! println!("{status}");
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod caps;
pub mod config;
pub mod core;
pub mod elements;
pub mod errors;
pub mod events;
pub mod graph;
pub mod observability;
pub mod pipeline;
pub mod roles;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::caps::{Capability, CapabilitySet, CapsValue};
    pub use crate::config::{ReceiveConfig, Resolution, SourceConfig};
    pub use crate::core::{StageKind, State, StateChange, StateChangeOutcome};
    pub use crate::elements::StageRegistry;
    pub use crate::errors::{
        ConfigError, ConstructionError, FlowError, LinkError, MediaflowError,
        StateTransitionError,
    };
    pub use crate::events::{ErrorCode, ErrorDetails, Event, EventBus, EventKind};
    pub use crate::graph::{Graph, LazyLinkState, PadNegotiation, StageId};
    pub use crate::pipeline::{ControlLoop, Pipeline, PipelineOptions, RunOutcome, TeardownGuard};
    pub use crate::roles::{
        build_receive_pipeline, build_source_pipeline, run_pipeline, Role, RunStatus,
    };
    pub use crate::stages::{Buffer, PortTemplate, Stage, StageContext};
}
