//! State machine, lazy linking and event bus behaviour through the public API.

use mediaflow::caps::{Capability, RAW_AUDIO, RAW_VIDEO};
use mediaflow::core::{State, StateChange, StateChangeOutcome};
use mediaflow::events::{CollectingEventSink, ErrorCode, EventKind, EventOrigin};
use mediaflow::graph::{Graph, LazyLinkState};
use mediaflow::pipeline::{ControlLoop, RunOutcome};
use mediaflow::testing::{
    assert_has_error, assert_no_end_of_stream, assert_pipeline_reached, pipeline_transitions,
    play_to_end, test_pipeline, wait_for_kind, FailingStage, RecordingSink, ScriptedSource,
    StallingStage,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn raw_video() -> Capability {
    Capability::new(RAW_VIDEO)
        .with_str("format", "I420")
        .with_int("width", 320)
        .with_int("height", 240)
}

fn raw_audio() -> Capability {
    Capability::new(RAW_AUDIO).with_int("rate", 48_000)
}

#[test]
fn test_audio_pad_rejected_video_pad_linked() {
    let source = Arc::new(
        ScriptedSource::new()
            .with_announcements(vec![raw_audio(), raw_video()])
            .with_buffers(3),
    );
    let sink = Arc::new(RecordingSink::new());
    let mut graph = Graph::new("two-pads");
    let src = graph.add_stage("source", source.clone()).unwrap();
    let dst = graph.add_stage("sink", sink.clone()).unwrap();
    let lazy = graph.register_lazy_link(src, dst, RAW_VIDEO).unwrap();

    let pipeline = test_pipeline(graph);
    let collector = Arc::new(CollectingEventSink::new());
    pipeline.bus().add_sink(collector.clone());

    pipeline.set_state(State::Playing).unwrap();
    let outcome = ControlLoop::new()
        .with_timeout(Duration::from_secs(5))
        .run(&pipeline);

    assert_eq!(outcome, RunOutcome::EndOfStream);
    assert_eq!(lazy.state(), LazyLinkState::Linked);
    assert_eq!(pipeline.graph().link_count(), 1);
    assert_eq!(sink.buffer_count(), 3);
    assert_eq!(sink.caps().unwrap().media_type(), RAW_VIDEO);
    assert_eq!(collector.count(EventKind::Warning), 0);

    pipeline.request_state(State::Null);
    assert_eq!(pipeline.current_state(), State::Null);
    assert_eq!(lazy.state(), LazyLinkState::NoPadsYet);
}

#[test]
fn test_eager_relink_changes_nothing() {
    let mut graph = Graph::new("relink");
    let src = graph
        .add_stage("source", Arc::new(ScriptedSource::new().with_output(raw_video())))
        .unwrap();
    let dst = graph.add_stage("sink", Arc::new(RecordingSink::new())).unwrap();
    let out = graph.port_id(src, "src").unwrap();
    let input = graph.port_id(dst, "sink").unwrap();

    graph.add_link(out, input).unwrap();
    let links = graph.links();
    for _ in 0..3 {
        assert!(graph.add_link(out, input).unwrap_err().is_already_linked());
    }
    assert_eq!(graph.links(), links);
    assert!(graph.is_runnable());
}

#[test]
fn test_no_end_of_stream_before_playing() {
    let source = Arc::new(ScriptedSource::new().with_output(raw_video()));
    let sink = Arc::new(RecordingSink::new());
    let mut graph = Graph::new("eos");
    let ids = [
        graph.add_stage("source", source).unwrap(),
        graph.add_stage("sink", sink.clone()).unwrap(),
    ];
    graph.link_many(&ids).unwrap();

    let pipeline = test_pipeline(graph);
    let collector = Arc::new(CollectingEventSink::new());
    pipeline.bus().add_sink(collector.clone());

    assert_eq!(
        pipeline.set_state(State::Paused).unwrap(),
        StateChangeOutcome::Success
    );
    std::thread::sleep(Duration::from_millis(50));
    assert_no_end_of_stream(&collector.events());
    assert_pipeline_reached(&collector.events(), State::Paused);

    // no buffers: the source ends the stream as soon as it starts
    pipeline.set_state(State::Playing).unwrap();
    assert!(wait_for_kind(&pipeline.bus(), EventKind::EndOfStream, Duration::from_secs(5)).is_some());
    assert_eq!(sink.eos_count(), 1);
    assert_eq!(collector.count(EventKind::EndOfStream), 1);

    pipeline.request_state(State::Null);
}

#[test]
fn test_failed_transition_then_null_releases_everything() {
    let failing = Arc::new(FailingStage::on(StateChange::ReadyToPaused));
    let mut graph = Graph::new("failing");
    let ids = [
        graph
            .add_stage("source", Arc::new(ScriptedSource::new().with_output(raw_video())))
            .unwrap(),
        graph.add_stage("sink", failing.clone()).unwrap(),
    ];
    graph.link_many(&ids).unwrap();

    let pipeline = test_pipeline(graph);
    let collector = Arc::new(CollectingEventSink::new());
    pipeline.bus().add_sink(collector.clone());

    let err = pipeline.set_state(State::Playing).unwrap_err();
    assert_eq!(err.to, State::Playing);
    assert!(err.reason.contains("sink"));
    assert_has_error(&collector.events());

    assert_eq!(pipeline.request_state(State::Null), StateChangeOutcome::Success);
    assert_eq!(pipeline.current_state(), State::Null);
    assert_eq!(
        failing.changes(),
        vec![
            StateChange::NullToReady,
            StateChange::ReadyToPaused,
            StateChange::ReadyToNull
        ]
    );
}

#[test]
fn test_null_cancels_stalled_upward_transition() {
    let stalling = Arc::new(StallingStage::on(StateChange::ReadyToPaused));
    let mut graph = Graph::new("stalled");
    let ids = [
        graph
            .add_stage("source", Arc::new(ScriptedSource::new().with_output(raw_video())))
            .unwrap(),
        graph.add_stage("sink", stalling.clone()).unwrap(),
    ];
    graph.link_many(&ids).unwrap();

    let pipeline = test_pipeline(graph);
    let collector = Arc::new(CollectingEventSink::new());
    pipeline.bus().add_sink(collector.clone());

    assert_eq!(pipeline.request_state(State::Playing), StateChangeOutcome::Async);
    assert_eq!(pipeline.current_state(), State::Ready);

    assert_eq!(pipeline.request_state(State::Null), StateChangeOutcome::Success);
    assert_eq!(pipeline.current_state(), State::Null);
    assert_eq!(stalling.changes().last(), Some(&StateChange::ReadyToNull));
    let reached: Vec<State> = pipeline_transitions(&collector.events())
        .into_iter()
        .map(|(_, new)| new)
        .collect();
    assert!(!reached.contains(&State::Paused));
}

#[test]
fn test_cancelled_preroll_leaves_nothing_behind() {
    let source = Arc::new(
        ScriptedSource::new()
            .with_announcements(vec![raw_video()])
            .with_async_preroll()
            .with_buffers(3),
    );
    let sink = Arc::new(RecordingSink::new());
    let mut graph = Graph::new("cancelled-preroll");
    let src = graph.add_stage("source", source).unwrap();
    let dst = graph.add_stage("sink", sink.clone()).unwrap();
    let lazy = graph.register_lazy_link(src, dst, RAW_VIDEO).unwrap();

    let pipeline = test_pipeline(graph);
    let collector = Arc::new(CollectingEventSink::new());
    pipeline.bus().add_sink(collector.clone());

    assert_eq!(pipeline.request_state(State::Playing), StateChangeOutcome::Async);
    assert_eq!(pipeline.request_state(State::Null), StateChangeOutcome::Success);
    // the preroll task wakes up after the cancel and must not announce
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(lazy.state(), LazyLinkState::NoPadsYet);
    assert_eq!(pipeline.graph().link_count(), 0);
    assert_eq!(collector.count(EventKind::Warning), 0);
    // the sink went to PAUSED on its own; the pipeline never did
    assert_eq!(
        pipeline_transitions(&collector.events()),
        vec![(State::Null, State::Ready), (State::Ready, State::Null)]
    );

    pipeline.set_state(State::Playing).unwrap();
    let outcome = ControlLoop::new()
        .with_timeout(Duration::from_secs(5))
        .run(&pipeline);
    assert_eq!(outcome, RunOutcome::EndOfStream);
    assert_eq!(lazy.state(), LazyLinkState::Linked);
    assert_eq!(sink.buffer_count(), 3);
    assert_eq!(collector.count(EventKind::Error), 0);

    pipeline.request_state(State::Null);
}

#[test]
fn test_streaming_error_ends_run() {
    let mut graph = Graph::new("stream-error");
    let ids = [
        graph
            .add_stage(
                "source",
                Arc::new(
                    ScriptedSource::new()
                        .with_output(raw_video())
                        .with_buffers(5)
                        .with_error_after(2),
                ),
            )
            .unwrap(),
        graph.add_stage("sink", Arc::new(RecordingSink::new())).unwrap(),
    ];
    graph.link_many(&ids).unwrap();
    let pipeline = test_pipeline(graph);

    match play_to_end(&pipeline, Duration::from_secs(5)) {
        RunOutcome::Error { origin, details } => {
            assert_eq!(origin, EventOrigin::Stage("source".to_string()));
            assert_eq!(details.code, ErrorCode::StreamFailed);
        }
        other => panic!("unexpected outcome: {other}"),
    }
    assert_eq!(pipeline.current_state(), State::Null);
}

#[test]
fn test_dropping_playing_pipeline_tears_down() {
    let sink = Arc::new(RecordingSink::new());
    let mut graph = Graph::new("dropped");
    let ids = [
        graph
            .add_stage(
                "source",
                Arc::new(
                    ScriptedSource::new()
                        .with_output(raw_video())
                        .with_buffers(1000)
                        .with_interval(Duration::from_millis(10)),
                ),
            )
            .unwrap(),
        graph.add_stage("sink", sink.clone()).unwrap(),
    ];
    graph.link_many(&ids).unwrap();

    let pipeline = test_pipeline(graph);
    pipeline.set_state(State::Playing).unwrap();
    drop(pipeline);

    assert_eq!(sink.changes().last(), Some(&StateChange::ReadyToNull));
}
