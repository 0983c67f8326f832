//! Terminal stages: `autovideosink` and `fakesink`.

use super::video::VideoInfo;
use crate::caps::{Capability, CapabilitySet, RAW_VIDEO};
use crate::core::{StageKind, StateChange, StateChangeOutcome};
use crate::errors::FlowError;
use crate::stages::{Buffer, PortTemplate, Stage, StageContext};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace};

/// Renders raw video. There is no window; frames are counted and logged.
#[derive(Debug, Default)]
pub struct VideoSink {
    format: Mutex<Option<VideoInfo>>,
    frames: AtomicU64,
}

impl VideoSink {
    /// Creates a sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames rendered since READY.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Geometry of the stream being rendered.
    #[must_use]
    pub fn video_info(&self) -> Option<VideoInfo> {
        *self.format.lock()
    }
}

#[async_trait]
impl Stage for VideoSink {
    fn factory_name(&self) -> &'static str {
        "autovideosink"
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    fn templates(&self) -> Vec<PortTemplate> {
        vec![PortTemplate::input("sink", Capability::new(RAW_VIDEO))]
    }

    fn change_state(&self, change: StateChange, ctx: &StageContext) -> StateChangeOutcome {
        match change {
            StateChange::NullToReady => self.frames.store(0, Ordering::Relaxed),
            StateChange::PausedToReady => {
                debug!(stage = ctx.stage_name(), frames = self.frames(), "stopped rendering");
                self.format.lock().take();
            }
            _ => {}
        }
        StateChangeOutcome::Success
    }

    fn set_caps(&self, ctx: &StageContext, _port: &str, caps: &Capability) -> Result<(), FlowError> {
        let info = VideoInfo::from_caps(caps);
        if let Some(info) = info {
            info!(
                stage = ctx.stage_name(),
                width = info.width,
                height = info.height,
                fps = %format!("{}/{}", info.fps_n, info.fps_d),
                "rendering video"
            );
        }
        *self.format.lock() = info;
        Ok(())
    }

    fn chain(&self, ctx: &StageContext, _port: &str, buffer: Buffer) -> Result<(), FlowError> {
        let frame = self.frames.fetch_add(1, Ordering::Relaxed);
        trace!(stage = ctx.stage_name(), frame, pts = ?buffer.pts, len = buffer.len(), "rendered frame");
        Ok(())
    }
}

/// Accepts and drops anything.
#[derive(Debug, Default)]
pub struct FakeSink {
    buffers: AtomicU64,
}

impl FakeSink {
    /// Creates a sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers dropped so far.
    #[must_use]
    pub fn buffers(&self) -> u64 {
        self.buffers.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Stage for FakeSink {
    fn factory_name(&self) -> &'static str {
        "fakesink"
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    fn templates(&self) -> Vec<PortTemplate> {
        vec![PortTemplate::input("sink", CapabilitySet::any())]
    }

    fn chain(&self, _ctx: &StageContext, _port: &str, _buffer: Buffer) -> Result<(), FlowError> {
        self.buffers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RunOutcome;
    use crate::testing::{linear_graph, play_to_end, test_pipeline, ScriptedSource};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_video_sink_counts_frames() {
        let sink = Arc::new(VideoSink::new());
        let pipeline = test_pipeline(linear_graph(
            "render",
            vec![
                (
                    "source",
                    Arc::new(
                        ScriptedSource::new()
                            .with_output(VideoInfo::new(2, 2, 25).to_caps())
                            .with_buffers(4),
                    ) as Arc<dyn Stage>,
                ),
                ("sink", Arc::clone(&sink) as Arc<dyn Stage>),
            ],
        ));

        assert_eq!(play_to_end(&pipeline, Duration::from_secs(5)), RunOutcome::EndOfStream);
        assert_eq!(sink.frames(), 4);
        // format is dropped again on the way down
        assert_eq!(sink.video_info(), None);
    }

    #[test]
    fn test_fake_sink_takes_anything() {
        let sink = Arc::new(FakeSink::new());
        let pipeline = test_pipeline(linear_graph(
            "discard",
            vec![
                (
                    "source",
                    Arc::new(
                        ScriptedSource::new()
                            .with_output(Capability::new("application/octet-stream"))
                            .with_buffers(2),
                    ) as Arc<dyn Stage>,
                ),
                ("sink", Arc::clone(&sink) as Arc<dyn Stage>),
            ],
        ));

        assert_eq!(play_to_end(&pipeline, Duration::from_secs(5)), RunOutcome::EndOfStream);
        assert_eq!(sink.buffers(), 2);
    }
}
