//! Pipeline: a graph plus its lifecycle state, event bus and worker pool.
//!
//! This module provides:
//! - [`Pipeline`] and its state machine ([`Pipeline::request_state`])
//! - [`ControlLoop`], the blocking event loop that drives a run to completion
//! - [`TeardownGuard`], which returns a pipeline to NULL on every exit path

mod control;
mod shared;
mod streaming;

pub use control::{ControlLoop, RunOutcome};
pub(crate) use shared::PipelineShared;

use crate::core::{State, StateChangeOutcome};
use crate::errors::{ConstructionError, StateTransitionError};
use crate::events::{EventBus, LoggingEventSink, DEFAULT_BUS_CAPACITY};
use crate::graph::Graph;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{error, info};
use uuid::Uuid;

/// Pipeline construction options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Worker threads in the pipeline's internal pool.
    pub workers: usize,
    /// Pending events before the bus warns about a slow reader.
    pub bus_capacity: usize,
    /// Log every posted event at debug level.
    pub log_events: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            bus_capacity: DEFAULT_BUS_CAPACITY,
            log_events: true,
        }
    }
}

impl PipelineOptions {
    /// Sets the worker pool size.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the bus capacity.
    #[must_use]
    pub fn with_bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    /// Enables or disables event logging.
    #[must_use]
    pub fn with_event_logging(mut self, enabled: bool) -> Self {
        self.log_events = enabled;
        self
    }
}

/// A graph plus the single authoritative lifecycle state shared by its stages.
///
/// The pipeline owns its [`EventBus`] and the worker pool its stages stream
/// on. Dropping a pipeline that is not at NULL is a programming error: it is
/// logged and the pipeline is forced down to NULL first.
pub struct Pipeline {
    shared: Arc<PipelineShared>,
    runtime: Option<Runtime>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.shared.name)
            .field("run_id", &self.shared.run_id)
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates a pipeline with default options.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructionError::Runtime`] if the worker pool cannot start.
    pub fn new(graph: Graph) -> Result<Self, ConstructionError> {
        Self::with_options(graph, PipelineOptions::default())
    }

    /// Creates a pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ConstructionError::Runtime`] if the worker pool cannot start.
    pub fn with_options(graph: Graph, options: PipelineOptions) -> Result<Self, ConstructionError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(options.workers.max(1))
            .thread_name(format!("{}-worker", graph.name()))
            .enable_all()
            .build()
            .map_err(|e| ConstructionError::Runtime(e.to_string()))?;

        let bus = Arc::new(EventBus::with_capacity(graph.name(), options.bus_capacity));
        if options.log_events {
            bus.add_sink(Arc::new(LoggingEventSink::debug()));
        }

        let shared = Arc::new(PipelineShared::new(graph, bus, runtime.handle().clone()));
        info!(
            pipeline = %shared.name,
            run_id = %shared.run_id,
            stages = shared.graph.len(),
            workers = options.workers,
            "created pipeline"
        );
        Ok(Self {
            shared,
            runtime: Some(runtime),
        })
    }

    /// Pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Identifier of this pipeline instance, recorded in log spans.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.shared.run_id
    }

    /// The graph the pipeline drives.
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.shared.graph
    }

    /// The pipeline's event bus.
    #[must_use]
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.shared.bus)
    }

    /// Last state the whole pipeline reached.
    #[must_use]
    pub fn current_state(&self) -> State {
        self.shared.current_state()
    }

    /// Most recently requested state.
    #[must_use]
    pub fn target_state(&self) -> State {
        self.shared.target_state()
    }

    /// Requests a lifecycle state.
    ///
    /// Steps through every intermediate state. Returns `Async` when a stage
    /// needs more time; completion is then observed as a pipeline
    /// `StateChanged` event. A lower target cancels a pending upward
    /// transition. Downward transitions always complete.
    pub fn request_state(&self, target: State) -> StateChangeOutcome {
        self.shared.request_state(target)
    }

    /// Like [`request_state`](Self::request_state), with `Failure` as an error.
    ///
    /// # Errors
    ///
    /// Returns [`StateTransitionError`] if the pipeline cannot reach `target`.
    pub fn set_state(&self, target: State) -> Result<StateChangeOutcome, StateTransitionError> {
        let from = self.current_state();
        match self.request_state(target) {
            StateChangeOutcome::Failure => Err(StateTransitionError::new(
                self.name(),
                from,
                target,
                self.shared
                    .last_failure()
                    .unwrap_or_else(|| "a stage refused the change".to_string()),
            )),
            outcome => Ok(outcome),
        }
    }

    /// Waits for the pending request to settle.
    ///
    /// Returns the outcome, the current state and the pending target if any.
    /// `None` waits forever.
    #[must_use]
    pub fn state(&self, timeout: Option<Duration>) -> (StateChangeOutcome, State, Option<State>) {
        self.shared.wait_settled(timeout)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let stuck = self.current_state() != State::Null || self.shared.graph.max_state() != State::Null;
        if stuck {
            error!(
                pipeline = %self.shared.name,
                state = %self.current_state(),
                "pipeline dropped while not at NULL, forcing teardown"
            );
            self.shared.request_state(State::Null);
        }
        self.shared.stop_all_streaming();
        self.shared.bus.set_flushing(true);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Drives a pipeline back to NULL when dropped.
#[must_use = "the pipeline is torn down when the guard is dropped"]
pub struct TeardownGuard<'a> {
    pipeline: Option<&'a Pipeline>,
}

impl<'a> TeardownGuard<'a> {
    /// Creates a guard for `pipeline`.
    pub fn new(pipeline: &'a Pipeline) -> Self {
        Self {
            pipeline: Some(pipeline),
        }
    }

    /// Disarms the guard, leaving the pipeline in its current state.
    pub fn disarm(&mut self) {
        self.pipeline = None;
    }
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            info!(pipeline = %pipeline.name(), "tearing down pipeline");
            if pipeline.request_state(State::Null) == StateChangeOutcome::Failure {
                error!(pipeline = %pipeline.name(), "teardown to NULL failed");
            }
        }
    }
}
