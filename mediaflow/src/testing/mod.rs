//! Testing utilities for mediaflow pipelines.
//!
//! This module provides:
//! - Mock stages (scripted sources, recording sinks, failing stages)
//! - Event collection helpers
//! - Assertions over collected events

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_has_error, assert_no_end_of_stream, assert_no_errors, assert_pipeline_reached,
};
pub use fixtures::{
    count_kind, drain_events, linear_graph, pipeline_transitions, play_to_end, test_pipeline,
    wait_for_kind, wait_for_pipeline_state,
};
pub use mocks::{FailingStage, RecordingSink, ScriptedSource, StallingStage};
