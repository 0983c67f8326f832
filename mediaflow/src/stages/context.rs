//! The handle a stage uses to talk to its pipeline.

use super::Buffer;
use crate::caps::{Capability, CapabilitySet};
use crate::core::StateChangeOutcome;
use crate::errors::{FlowError, LinkError};
use crate::events::{ErrorCode, ErrorDetails, Event, EventOrigin};
use crate::graph::{PadNegotiation, PortId, StageId};
use crate::pipeline::PipelineShared;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Runtime handle passed to every [`super::Stage`] callback.
///
/// Cheap to clone; a stage may move a clone into a task it spawns.
#[derive(Clone)]
pub struct StageContext {
    shared: Arc<PipelineShared>,
    stage: StageId,
    // request generation of the state change this context was handed to
    generation: Option<u64>,
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("pipeline", &self.shared.name)
            .field("stage", &self.stage_name())
            .finish()
    }
}

impl StageContext {
    pub(crate) fn new(shared: Arc<PipelineShared>, stage: StageId) -> Self {
        Self {
            shared,
            stage,
            generation: None,
        }
    }

    pub(crate) fn for_transition(
        shared: Arc<PipelineShared>,
        stage: StageId,
        generation: u64,
    ) -> Self {
        Self {
            shared,
            stage,
            generation: Some(generation),
        }
    }

    fn for_stage(&self, stage: StageId) -> Self {
        Self::new(Arc::clone(&self.shared), stage)
    }

    /// Id of the stage this context belongs to.
    #[must_use]
    pub fn stage_id(&self) -> StageId {
        self.stage
    }

    /// Name of the stage this context belongs to.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        self.shared.graph.stage_name(self.stage).unwrap_or("?")
    }

    /// Name of the owning pipeline.
    #[must_use]
    pub fn pipeline_name(&self) -> &str {
        &self.shared.name
    }

    /// Returns true while the stage is being shut down.
    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.shared.graph.is_flushing(self.stage)
    }

    /// Announces a new output port and runs the lazy-link observers.
    ///
    /// A link that fails after its type matched is reported as a warning
    /// event; it never stops the pipeline. Announcements from a stage at
    /// NULL, or from a state change that was since superseded, are dropped.
    pub fn announce_port(&self, name: &str, caps: Capability) -> Vec<PadNegotiation> {
        let live = || self.shared.accepts_announcement(self.stage, self.generation);
        match self
            .shared
            .graph
            .announce_port_while(self.stage, name, caps, live)
        {
            Ok((_, outcomes)) => {
                for outcome in &outcomes {
                    if let PadNegotiation::LinkFailed { reason } = outcome {
                        self.warning(
                            ErrorCode::StreamFormat,
                            format!("Could not link announced port '{name}'"),
                            Some(reason.clone()),
                        );
                    }
                }
                outcomes
            }
            Err(LinkError::Flushing(_)) => {
                debug!(stage = self.stage_name(), port = name, "stale announcement ignored");
                Vec::new()
            }
            Err(err) => {
                self.warning(
                    ErrorCode::StreamFormat,
                    format!("Could not announce port '{name}'"),
                    Some(err.to_string()),
                );
                Vec::new()
            }
        }
    }

    /// Fixes the caps on an output port and informs the peer.
    ///
    /// # Errors
    ///
    /// [`FlowError::NotLinked`] without a peer, [`FlowError::NotNegotiated`]
    /// if the peer does not accept `caps`, or whatever the peer's
    /// `set_caps` returns.
    pub fn set_output_caps(&self, port: &str, caps: Capability) -> Result<(), FlowError> {
        let route = self.shared.graph.route(self.stage, port)?;
        self.negotiate(route.port, &caps)
    }

    fn negotiate(&self, port: PortId, caps: &Capability) -> Result<(), FlowError> {
        let route = self.shared.graph.fix_caps(port, caps)?;
        debug!(stage = self.stage_name(), caps = %caps, "negotiated output caps");
        let Some(node) = self.shared.graph.node(route.peer_stage) else {
            return Err(FlowError::NotLinked);
        };
        node.behaviour
            .set_caps(&self.for_stage(route.peer_stage), &route.peer_port, caps)
    }

    /// Negotiated caps of one of this stage's ports.
    #[must_use]
    pub fn current_caps(&self, port: &str) -> Option<Capability> {
        self.shared.graph.current_caps(self.stage, port)
    }

    /// Caps accepted by the peer of an output port.
    #[must_use]
    pub fn query_peer_caps(&self, port: &str) -> Option<CapabilitySet> {
        self.shared.graph.peer_caps(self.stage, port)
    }

    /// Pushes a buffer to the peer of an output port.
    ///
    /// The peer's `chain` runs on the calling thread. Caps are fixed on
    /// first use if the stage did not negotiate them explicitly.
    ///
    /// # Errors
    ///
    /// [`FlowError::NotLinked`] without a peer, [`FlowError::Flushing`]
    /// during teardown, or the peer's error.
    pub fn push(&self, port: &str, buffer: Buffer) -> Result<(), FlowError> {
        let route = self.shared.graph.route(self.stage, port)?;
        if !route.negotiated {
            let caps = self.shared.graph.default_caps(route.port)?;
            self.negotiate(route.port, &caps)?;
        }
        trace!(stage = self.stage_name(), port, len = buffer.len(), "push");
        let Some(node) = self.shared.graph.node(route.peer_stage) else {
            return Err(FlowError::NotLinked);
        };
        node.behaviour
            .chain(&self.for_stage(route.peer_stage), &route.peer_port, buffer)
    }

    /// Sends end of stream through one output port.
    pub fn push_eos(&self, port: &str) {
        match self.shared.graph.route(self.stage, port) {
            Ok(route) => {
                if let Some(node) = self.shared.graph.node(route.peer_stage) {
                    node.behaviour
                        .handle_eos(&self.for_stage(route.peer_stage), &route.peer_port);
                }
            }
            Err(err) => debug!(stage = self.stage_name(), port, reason = %err, "end of stream not forwarded"),
        }
    }

    /// Sends end of stream through every output port.
    pub fn push_eos_all(&self) {
        for port in self.shared.graph.output_ports(self.stage) {
            self.push_eos(&port);
        }
    }

    /// Reports that this sink has consumed its last buffer.
    pub fn post_eos(&self) {
        self.shared.sink_eos(self.stage);
    }

    /// Posts a fatal error event and returns [`FlowError::Error`].
    pub fn error(
        &self,
        code: ErrorCode,
        message: impl Into<String>,
        debug: Option<String>,
    ) -> FlowError {
        let mut details = ErrorDetails::new(code, message);
        details.debug = debug;
        self.shared.post_stage_error(self.stage, details);
        FlowError::Error
    }

    /// Posts a non-fatal warning event.
    pub fn warning(&self, code: ErrorCode, message: impl Into<String>, debug: Option<String>) {
        let mut details = ErrorDetails::new(code, message);
        details.debug = debug;
        self.shared.bus.post(Event::warning(
            EventOrigin::Stage(self.stage_name().to_string()),
            details,
        ));
    }

    /// Completes a state change this stage answered with `Async`.
    pub fn complete_state(&self, outcome: StateChangeOutcome) {
        self.shared
            .complete_state(self.stage, self.generation, outcome);
    }

    /// Spawns a task on the pipeline's worker pool.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.shared.handle.spawn(future)
    }

    pub(crate) fn streaming_finished(&self, result: Result<(), FlowError>) {
        self.shared.streaming_finished(self.stage, result);
    }
}
