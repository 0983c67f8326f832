//! Stage trait and the handles stages use at runtime.
//!
//! Stages are the processing units of a mediaflow graph. A stage declares its
//! ports through [`PortTemplate`]s, reacts to one-step state changes, and
//! exchanges [`Buffer`]s with its peers through a [`StageContext`].

mod buffer;
mod context;
mod template;

pub use buffer::Buffer;
pub use context::StageContext;
pub use template::PortTemplate;

use crate::caps::{Capability, CapabilitySet};
use crate::core::{StageKind, StateChange, StateChangeOutcome};
use crate::errors::{FlowError, PropertyError};
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for pipeline stages.
///
/// All methods except [`produce`](Self::produce) are called synchronously on
/// whichever thread drives the pipeline or pushes data, and must not block
/// for unbounded time.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Factory name the stage was registered under (e.g. `udpsink`).
    fn factory_name(&self) -> &'static str;

    /// Source, filter or sink.
    fn kind(&self) -> StageKind;

    /// Ports the stage has, or may announce.
    fn templates(&self) -> Vec<PortTemplate>;

    /// Sets a configuration property. Called while the pipeline is at NULL.
    fn set_property(&self, _key: &str, _value: &serde_json::Value) -> Result<(), PropertyError> {
        Err(PropertyError::Unknown)
    }

    /// Narrows the caps of one of the stage's ports beyond its template.
    ///
    /// Called under the graph lock; must not call back into the pipeline.
    fn port_caps(&self, _port: &str) -> Option<CapabilitySet> {
        None
    }

    /// Applies one state step.
    ///
    /// Returning [`StateChangeOutcome::Async`] obliges the stage to call
    /// [`StageContext::complete_state`] later.
    fn change_state(&self, _change: StateChange, _ctx: &StageContext) -> StateChangeOutcome {
        StateChangeOutcome::Success
    }

    /// Caps on an input port were fixed by the upstream peer.
    fn set_caps(&self, _ctx: &StageContext, _port: &str, _caps: &Capability) -> Result<(), FlowError> {
        Ok(())
    }

    /// Handles a buffer arriving on an input port.
    fn chain(&self, _ctx: &StageContext, _port: &str, _buffer: Buffer) -> Result<(), FlowError> {
        Ok(())
    }

    /// Handles end of stream on an input port.
    ///
    /// Sinks report it to the pipeline; everything else forwards it downstream.
    fn handle_eos(&self, ctx: &StageContext, _port: &str) {
        match self.kind() {
            StageKind::Sink => ctx.post_eos(),
            StageKind::Source | StageKind::Filter => ctx.push_eos_all(),
        }
    }

    /// Streaming loop for sources, run on the worker pool while PLAYING.
    ///
    /// The task is cancelled when the pipeline leaves PLAYING.
    async fn produce(&self, _ctx: &StageContext) -> Result<(), FlowError> {
        Ok(())
    }
}
