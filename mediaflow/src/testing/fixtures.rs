//! Test fixtures for pipeline testing.

use std::sync::Arc;
use std::time::Duration;

use crate::core::State;
use crate::events::{Event, EventBody, EventBus, EventKind, EventMask};
use crate::graph::Graph;
use crate::pipeline::{ControlLoop, Pipeline, PipelineOptions, RunOutcome};
use crate::stages::Stage;

/// Builds a pipeline for tests: one worker, no event logging.
///
/// # Panics
///
/// Panics if the worker pool cannot start.
#[must_use]
pub fn test_pipeline(graph: Graph) -> Pipeline {
    Pipeline::with_options(
        graph,
        PipelineOptions::default()
            .with_workers(1)
            .with_event_logging(false),
    )
    .unwrap_or_else(|err| panic!("test pipeline: {err}"))
}

/// Builds a graph of stages linked in a chain.
///
/// # Panics
///
/// Panics if a stage cannot be added or an eager link fails.
#[must_use]
pub fn linear_graph(name: &str, stages: Vec<(&str, Arc<dyn Stage>)>) -> Graph {
    let mut graph = Graph::new(name);
    let ids: Vec<_> = stages
        .into_iter()
        .map(|(name, stage)| {
            graph
                .add_stage(name, stage)
                .unwrap_or_else(|err| panic!("add {name}: {err}"))
        })
        .collect();
    graph
        .link_many(&ids)
        .unwrap_or_else(|err| panic!("link: {err}"));
    graph
}

/// Plays a pipeline until end of stream, an error or `timeout`, then
/// returns it to NULL.
///
/// # Panics
///
/// Panics if the pipeline refuses PLAYING outright.
pub fn play_to_end(pipeline: &Pipeline, timeout: Duration) -> RunOutcome {
    pipeline
        .set_state(State::Playing)
        .unwrap_or_else(|err| panic!("play: {err}"));
    let outcome = ControlLoop::new().with_timeout(timeout).run(pipeline);
    pipeline.request_state(State::Null);
    outcome
}

/// Pops every pending event without waiting.
#[must_use]
pub fn drain_events(bus: &EventBus) -> Vec<Event> {
    std::iter::from_fn(|| bus.pop()).collect()
}

/// Waits for the next event of `kind`, discarding everything else.
#[must_use]
pub fn wait_for_kind(bus: &EventBus, kind: EventKind, timeout: Duration) -> Option<Event> {
    bus.poll_filtered(Some(timeout), EventMask::from(kind))
}

/// Waits until the pipeline posts a state change to `state`.
///
/// Returns the events consumed on the way, or `None` on timeout.
#[must_use]
pub fn wait_for_pipeline_state(bus: &EventBus, state: State, timeout: Duration) -> Option<Vec<Event>> {
    let deadline = std::time::Instant::now() + timeout;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline.checked_duration_since(std::time::Instant::now())?;
        let event = bus.poll(Some(remaining))?;
        let reached = event.origin.is_pipeline()
            && matches!(event.body, EventBody::StateChanged { new, .. } if new == state);
        seen.push(event);
        if reached {
            return Some(seen);
        }
    }
}

/// `(old, new)` pairs of the pipeline-originated state changes in `events`.
#[must_use]
pub fn pipeline_transitions(events: &[Event]) -> Vec<(State, State)> {
    events
        .iter()
        .filter(|e| e.origin.is_pipeline())
        .filter_map(|e| match e.body {
            EventBody::StateChanged { old, new, .. } => Some((old, new)),
            _ => None,
        })
        .collect()
}

/// Number of events of `kind`.
#[must_use]
pub fn count_kind(events: &[Event], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind() == kind).count()
}
