//! The send and receive pipelines talking over loopback UDP.

use mediaflow::config::{ReceiveConfig, SourceConfig};
use mediaflow::core::{State, StateChangeOutcome};
use mediaflow::elements::StageRegistry;
use mediaflow::errors::MediaflowError;
use mediaflow::events::{CollectingEventSink, EventKind};
use mediaflow::pipeline::{ControlLoop, RunOutcome};
use mediaflow::roles::{build_receive_pipeline, build_source_pipeline, run_pipeline};
use pretty_assertions::assert_eq;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

fn free_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

#[test]
fn test_loopback_send_then_receive() {
    let registry = StageRegistry::with_builtins();
    let port = free_port();

    let receive_config = ReceiveConfig::new()
        .with_listen("127.0.0.1", port)
        .with_idle_timeout_ms(500);
    let receiver = build_receive_pipeline(&receive_config, &registry).unwrap();
    let received = Arc::new(CollectingEventSink::new());
    receiver.bus().add_sink(received.clone());
    receiver.set_state(State::Playing).unwrap();

    let send_config = SourceConfig::new()
        .with_uri("test://video?frames=3&width=64&height=48&fps=30")
        .with_destination("127.0.0.1", port)
        .with_resolution(720);
    let sender = build_source_pipeline(&send_config, &registry).unwrap();
    let status = run_pipeline(&sender).unwrap();
    assert_eq!(status.outcome(), &RunOutcome::EndOfStream);
    assert_eq!(status.exit_code(), 0);
    assert_eq!(sender.current_state(), State::Null);

    // the receiver only ends its stream after hearing at least one packet
    let outcome = ControlLoop::new()
        .with_timeout(Duration::from_secs(10))
        .run(&receiver);
    receiver.request_state(State::Null);

    assert_eq!(outcome, RunOutcome::EndOfStream);
    assert_eq!(received.count(EventKind::Error), 0);
}

#[test]
fn test_receive_port_in_use_fails_to_start() {
    let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let config = ReceiveConfig::new().with_listen("127.0.0.1", port);
    let receiver = build_receive_pipeline(&config, &StageRegistry::with_builtins()).unwrap();
    let err = run_pipeline(&receiver).unwrap_err();

    assert!(matches!(err, MediaflowError::StateTransition(_)));
    assert_eq!(receiver.current_state(), State::Null);
}

#[test]
fn test_unknown_uri_scheme_is_a_runtime_error() {
    let config = SourceConfig::new()
        .with_uri("http://example.invalid/movie.mp4")
        .with_destination("127.0.0.1", free_port());
    let sender = build_source_pipeline(&config, &StageRegistry::with_builtins()).unwrap();

    let status = run_pipeline(&sender).unwrap();
    match status.outcome() {
        RunOutcome::Error { origin, .. } => assert_eq!(origin.name(), "source"),
        other => panic!("unexpected outcome: {other}"),
    }
    assert_eq!(status.exit_code(), 0);
}

#[test]
fn test_send_pipeline_runs_after_cancelled_start() {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let config = SourceConfig::new()
        .with_uri("test://video?frames=2&width=64&height=48&fps=30")
        .with_destination("127.0.0.1", socket.local_addr().unwrap().port())
        .with_resolution(720);
    let sender = build_source_pipeline(&config, &StageRegistry::with_builtins()).unwrap();

    let _ = sender.request_state(State::Playing);
    assert_eq!(sender.request_state(State::Null), StateChangeOutcome::Success);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(sender.graph().link_count(), 5);

    let status = run_pipeline(&sender).unwrap();
    assert_eq!(status.outcome(), &RunOutcome::EndOfStream);
    assert_eq!(sender.current_state(), State::Null);
}
