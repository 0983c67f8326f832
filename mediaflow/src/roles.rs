//! The send and receive pipelines, and the run loop shared by both.
//!
//! ```text
//! send:    uridecodebin ~> videoscale -> capsfilter -> videoconvert
//!              -> x264enc -> rtph264pay -> udpsink
//! receive: udpsrc -> rtph264depay -> avdec_h264 -> autovideosink
//! ```
//!
//! `~>` is the lazy link: the decoder's ports only exist once the URI has
//! been inspected, and only its raw video port is linked.

use crate::caps::RAW_VIDEO;
use crate::config::{ReceiveConfig, SourceConfig};
use crate::core::State;
use crate::elements::StageRegistry;
use crate::errors::{ConstructionError, MediaflowError};
use crate::graph::{Graph, StageId};
use crate::observability::{RunSpanAttributes, SpanTimer};
use crate::pipeline::{ControlLoop, Pipeline, PipelineOptions, RunOutcome, TeardownGuard};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::info;

/// Which end of the transport a pipeline implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Reads media and streams it out.
    Send,
    /// Listens and renders.
    Receive,
}

impl Role {
    /// Lowercase name, as used for the subcommand.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Receive => "receive",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn add(
    graph: &mut Graph,
    registry: &StageRegistry,
    factory: &str,
    name: &str,
    properties: &[(&str, Value)],
) -> Result<StageId, ConstructionError> {
    let id = graph.add_stage(name, registry.make(factory, name)?)?;
    for (key, value) in properties {
        graph.set_property(id, key, value.clone())?;
    }
    Ok(id)
}

/// Builds the send pipeline.
///
/// The resolution is checked before any stage is created.
///
/// # Errors
///
/// [`MediaflowError::Config`] for invalid settings,
/// [`MediaflowError::Construction`] for a missing stage or a failed link.
pub fn build_source_pipeline(
    config: &SourceConfig,
    registry: &StageRegistry,
) -> Result<Pipeline, MediaflowError> {
    let resolution = config.resolution()?;
    config.validate()?;
    info!(
        uri = %config.uri,
        host = %config.host,
        port = config.port,
        bitrate = config.bitrate,
        %resolution,
        "building send pipeline"
    );

    let mut graph = Graph::new(Role::Send.as_str());
    let source = add(
        &mut graph,
        registry,
        "uridecodebin",
        "source",
        &[("uri", Value::from(config.uri.as_str()))],
    )?;
    let scale = add(&mut graph, registry, "videoscale", "vid_scale", &[])?;
    let filter = add(
        &mut graph,
        registry,
        "capsfilter",
        "vid_scale_caps_filter",
        &[("caps", Value::from(resolution.caps()))],
    )?;
    let convert = add(&mut graph, registry, "videoconvert", "vid_convert", &[])?;
    let encoder = add(
        &mut graph,
        registry,
        "x264enc",
        "x264_enc",
        &[("bitrate", Value::from(config.bitrate))],
    )?;
    let payloader = add(&mut graph, registry, "rtph264pay", "rtph_264_pay", &[])?;
    let sink = add(
        &mut graph,
        registry,
        "udpsink",
        "udp_sink",
        &[
            ("host", Value::from(config.host.as_str())),
            ("port", Value::from(config.port)),
        ],
    )?;

    graph.link_many(&[scale, filter, convert, encoder, payloader, sink])?;
    graph.register_lazy_link(source, scale, RAW_VIDEO)?;

    let options = PipelineOptions::default().with_workers(config.workers);
    Ok(Pipeline::with_options(graph, options)?)
}

/// Builds the receive pipeline.
///
/// # Errors
///
/// [`MediaflowError::Config`] for invalid settings,
/// [`MediaflowError::Construction`] for a missing stage or a failed link.
pub fn build_receive_pipeline(
    config: &ReceiveConfig,
    registry: &StageRegistry,
) -> Result<Pipeline, MediaflowError> {
    config.validate()?;
    info!(
        address = %config.address,
        port = config.port,
        caps = %config.caps,
        "building receive pipeline"
    );

    let mut graph = Graph::new(Role::Receive.as_str());
    let source = add(
        &mut graph,
        registry,
        "udpsrc",
        "udp_src",
        &[
            ("address", Value::from(config.address.as_str())),
            ("port", Value::from(config.port)),
            ("caps", Value::from(config.caps.as_str())),
            ("timeout-ms", Value::from(config.idle_timeout_ms)),
        ],
    )?;
    let depayloader = add(&mut graph, registry, "rtph264depay", "rtph_264_dep", &[])?;
    let decoder = add(&mut graph, registry, "avdec_h264", "x264_dec", &[])?;
    let sink = add(&mut graph, registry, "autovideosink", "vid_sink", &[])?;
    graph.link_many(&[source, depayloader, decoder, sink])?;

    let options = PipelineOptions::default().with_workers(config.workers);
    Ok(Pipeline::with_options(graph, options)?)
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatus {
    outcome: RunOutcome,
    elapsed: Duration,
}

impl RunStatus {
    /// What stopped the control loop.
    #[must_use]
    pub fn outcome(&self) -> &RunOutcome {
        &self.outcome
    }

    /// Wall time from the PLAYING request to the end of teardown.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Process exit code.
    ///
    /// An error reported on the bus still ends the run gracefully, so only a
    /// run that never reached a terminal event is non-zero.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self.outcome {
            RunOutcome::EndOfStream | RunOutcome::Error { .. } | RunOutcome::BusClosed => 0,
            RunOutcome::TimedOut => 1,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after {:.3}s", self.outcome, self.elapsed.as_secs_f64())
    }
}

/// Plays `pipeline` until end of stream or an error, then tears it down.
///
/// # Errors
///
/// [`MediaflowError::StateTransition`] if PLAYING cannot be reached. The
/// pipeline is back at NULL in every case.
pub fn run_pipeline(pipeline: &Pipeline) -> Result<RunStatus, MediaflowError> {
    run_pipeline_with(pipeline, &ControlLoop::new(), None)
}

/// [`run_pipeline`] with an explicit control loop and role for the log span.
///
/// # Errors
///
/// See [`run_pipeline`].
pub fn run_pipeline_with(
    pipeline: &Pipeline,
    control: &ControlLoop,
    role: Option<Role>,
) -> Result<RunStatus, MediaflowError> {
    let mut attributes = RunSpanAttributes::of(pipeline);
    if let Some(role) = role {
        attributes = attributes.with_role(role.as_str());
    }
    let span = attributes.span();
    let _entered = span.enter();

    let timer = SpanTimer::start(pipeline.name());
    let outcome = {
        let _teardown = TeardownGuard::new(pipeline);
        pipeline.set_state(State::Playing)?;
        control.run(pipeline)
    };
    let status = RunStatus {
        outcome,
        elapsed: timer.finish(),
    };
    info!(pipeline = %pipeline.name(), %status, "run finished");
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConfigError;
    use crate::events::{CollectingEventSink, EventKind};
    use crate::graph::LazyLinkState;
    use std::sync::Arc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_illegal_resolution_creates_nothing() {
        let mut registry = StageRegistry::empty();
        registry.register("uridecodebin", || unreachable!("no stage may be created"));
        let config = SourceConfig::new().with_resolution(480);
        let err = build_source_pipeline(&config, &registry).unwrap_err();
        assert!(matches!(
            err,
            MediaflowError::Config(ConfigError::UnsupportedResolution(480))
        ));
    }

    #[test]
    fn test_missing_factory_is_construction_error() {
        let mut registry = StageRegistry::with_builtins();
        registry.unregister("x264enc");
        let err = build_source_pipeline(&SourceConfig::new(), &registry).unwrap_err();
        match err {
            MediaflowError::Construction(ConstructionError::MissingStage { factory, name }) => {
                assert_eq!((factory.as_str(), name.as_str()), ("x264enc", "x264_enc"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_source_pipeline_shape() {
        let pipeline =
            build_source_pipeline(&SourceConfig::new(), &StageRegistry::with_builtins()).unwrap();
        let graph = pipeline.graph();
        assert_eq!(graph.name(), "send");
        assert_eq!(graph.len(), 7);
        assert_eq!(graph.link_count(), 5);
        assert!(graph.is_runnable());
        assert_eq!(graph.lazy_links().len(), 1);
        assert_eq!(graph.lazy_links()[0].state(), LazyLinkState::NoPadsYet);
    }

    #[test]
    fn test_receive_pipeline_shape() {
        let pipeline =
            build_receive_pipeline(&ReceiveConfig::new(), &StageRegistry::with_builtins()).unwrap();
        let graph = pipeline.graph();
        assert_eq!(graph.name(), "receive");
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.link_count(), 3);
    }

    #[test]
    fn test_send_pipeline_streams_to_end() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        let config = SourceConfig::new()
            .with_uri("test://video?frames=2&width=64&height=48&fps=30")
            .with_destination("127.0.0.1", port)
            .with_resolution(720);
        let pipeline = build_source_pipeline(&config, &StageRegistry::with_builtins()).unwrap();

        let events = Arc::new(CollectingEventSink::new());
        pipeline.bus().add_sink(events.clone());

        let guard = TeardownGuard::new(&pipeline);
        pipeline.set_state(State::Playing).unwrap();
        let outcome = ControlLoop::new()
            .with_timeout(Duration::from_secs(10))
            .run(&pipeline);
        assert_eq!(outcome, RunOutcome::EndOfStream);
        assert_eq!(
            pipeline.graph().lazy_links()[0].state(),
            LazyLinkState::Linked
        );
        assert_eq!(pipeline.graph().link_count(), 6);
        assert_eq!(events.count(EventKind::Error), 0);

        // teardown releases the announced port and resets the lazy link
        drop(guard);
        assert_eq!(pipeline.current_state(), State::Null);
        assert_eq!(pipeline.graph().link_count(), 5);
        assert_eq!(
            pipeline.graph().lazy_links()[0].state(),
            LazyLinkState::NoPadsYet
        );
    }

    #[test]
    fn test_exit_codes() {
        let status = |outcome| RunStatus {
            outcome,
            elapsed: Duration::ZERO,
        };
        assert_eq!(status(RunOutcome::EndOfStream).exit_code(), 0);
        assert_eq!(status(RunOutcome::BusClosed).exit_code(), 0);
        assert_eq!(status(RunOutcome::TimedOut).exit_code(), 1);
    }
}
