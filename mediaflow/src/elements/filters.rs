//! Raw video filters: `videoscale`, `capsfilter` and `videoconvert`.

use super::props;
use super::video::{rgb_to_i420, scale_i420, VideoInfo, I420, MAX_DIMENSION};
use crate::caps::{Capability, CapabilitySet, CapsValue, RAW_VIDEO};
use crate::core::StageKind;
use crate::errors::{FlowError, PropertyError};
use crate::stages::{Buffer, PortTemplate, Stage, StageContext};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

const SINK: &str = "sink";
const SRC: &str = "src";
const RGB: &str = "RGB";

fn sized_raw_video() -> Capability {
    Capability::new(RAW_VIDEO)
        .with_str("format", I420)
        .with_range("width", 1, MAX_DIMENSION)
        .with_range("height", 1, MAX_DIMENSION)
}

fn frame_info(caps: &Capability) -> Result<VideoInfo, FlowError> {
    VideoInfo::from_caps(caps)
        .ok_or_else(|| FlowError::NotNegotiated(format!("{caps} has no frame size")))
}

/// Resizes I420 frames to whatever size the downstream peer asks for.
#[derive(Debug, Default)]
pub struct VideoScale {
    negotiated: Mutex<Option<(VideoInfo, VideoInfo)>>,
}

impl VideoScale {
    /// Creates a scaler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the output size: whatever the peer fixes, the input size otherwise.
    fn output_for(input: &VideoInfo, peer: Option<&CapabilitySet>) -> VideoInfo {
        let wanted = peer.and_then(|set| set.intersect_one(&sized_raw_video()));
        let dimension = |name: &str, fallback: u32| {
            wanted
                .as_ref()
                .and_then(|caps| caps.get_int(name))
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(fallback)
        };
        VideoInfo {
            width: dimension("width", input.width),
            height: dimension("height", input.height),
            ..*input
        }
    }
}

#[async_trait]
impl Stage for VideoScale {
    fn factory_name(&self) -> &'static str {
        "videoscale"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn templates(&self) -> Vec<PortTemplate> {
        vec![
            PortTemplate::input(SINK, sized_raw_video()),
            PortTemplate::output(SRC, sized_raw_video()),
        ]
    }

    fn set_caps(&self, ctx: &StageContext, _port: &str, caps: &Capability) -> Result<(), FlowError> {
        let input = frame_info(caps)?;
        let output = Self::output_for(&input, ctx.query_peer_caps(SRC).as_ref());
        debug!(
            stage = ctx.stage_name(),
            from = %format!("{}x{}", input.width, input.height),
            to = %format!("{}x{}", output.width, output.height),
            "configured scaler"
        );
        ctx.set_output_caps(SRC, output.to_caps())?;
        *self.negotiated.lock() = Some((input, output));
        Ok(())
    }

    fn chain(&self, ctx: &StageContext, _port: &str, buffer: Buffer) -> Result<(), FlowError> {
        let Some((input, output)) = *self.negotiated.lock() else {
            return Err(FlowError::NotNegotiated("scaler received data before caps".to_string()));
        };
        if input.width == output.width && input.height == output.height {
            return ctx.push(SRC, buffer);
        }
        let scaled = scale_i420(&buffer.data, &input, &output);
        ctx.push(SRC, buffer.map_data(scaled))
    }
}

/// Restricts the caps flowing through it to the `caps` property.
#[derive(Debug, Default)]
pub struct CapsFilter {
    filter: Mutex<Option<Capability>>,
}

impl CapsFilter {
    /// Creates a filter that lets anything through.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a filter restricted to `caps`.
    #[must_use]
    pub fn with_caps(caps: Capability) -> Self {
        Self {
            filter: Mutex::new(Some(caps)),
        }
    }
}

#[async_trait]
impl Stage for CapsFilter {
    fn factory_name(&self) -> &'static str {
        "capsfilter"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn templates(&self) -> Vec<PortTemplate> {
        vec![
            PortTemplate::input(SINK, CapabilitySet::any()),
            PortTemplate::output(SRC, CapabilitySet::any()),
        ]
    }

    fn set_property(&self, key: &str, value: &serde_json::Value) -> Result<(), PropertyError> {
        match key {
            "caps" => {
                *self.filter.lock() = Some(props::caps(value)?);
                Ok(())
            }
            _ => Err(PropertyError::Unknown),
        }
    }

    fn port_caps(&self, _port: &str) -> Option<CapabilitySet> {
        self.filter.lock().clone().map(CapabilitySet::single)
    }

    fn set_caps(&self, ctx: &StageContext, _port: &str, caps: &Capability) -> Result<(), FlowError> {
        let filter = self.filter.lock().clone();
        let out = match filter {
            Some(filter) => filter.intersect(caps).ok_or_else(|| {
                FlowError::NotNegotiated(format!("{caps} does not match filter {filter}"))
            })?,
            None => caps.clone(),
        };
        ctx.set_output_caps(SRC, out.fixate())
    }

    fn chain(&self, ctx: &StageContext, _port: &str, buffer: Buffer) -> Result<(), FlowError> {
        ctx.push(SRC, buffer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    Passthrough,
    FromRgb(VideoInfo),
}

/// Converts raw video to I420. I420 input passes through untouched.
#[derive(Debug, Default)]
pub struct VideoConvert {
    conversion: Mutex<Option<Conversion>>,
}

impl VideoConvert {
    /// Creates a converter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Stage for VideoConvert {
    fn factory_name(&self) -> &'static str {
        "videoconvert"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn templates(&self) -> Vec<PortTemplate> {
        vec![
            PortTemplate::input(
                SINK,
                CapabilitySet::OneOf(vec![
                    Capability::new(RAW_VIDEO).with_str("format", I420),
                    Capability::new(RAW_VIDEO).with_str("format", RGB),
                ]),
            ),
            PortTemplate::output(SRC, Capability::new(RAW_VIDEO).with_str("format", I420)),
        ]
    }

    fn set_caps(&self, ctx: &StageContext, _port: &str, caps: &Capability) -> Result<(), FlowError> {
        let conversion = match caps.get_str("format") {
            Some(RGB) => Conversion::FromRgb(frame_info(caps)?),
            _ => Conversion::Passthrough,
        };
        let mut out = caps.clone();
        out.set_field("format", CapsValue::Str(I420.to_string()));
        ctx.set_output_caps(SRC, out)?;
        *self.conversion.lock() = Some(conversion);
        Ok(())
    }

    fn chain(&self, ctx: &StageContext, _port: &str, buffer: Buffer) -> Result<(), FlowError> {
        let conversion = *self.conversion.lock();
        match conversion {
            Some(Conversion::FromRgb(info)) => {
                let converted = rgb_to_i420(&buffer.data, &info);
                ctx.push(SRC, buffer.map_data(converted))
            }
            Some(Conversion::Passthrough) | None => ctx.push(SRC, buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RunOutcome;
    use crate::testing::{linear_graph, play_to_end, test_pipeline, RecordingSink, ScriptedSource};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn run(stages: Vec<(&str, Arc<dyn Stage>)>, sink: &Arc<RecordingSink>) -> RunOutcome {
        let mut stages = stages;
        stages.push(("sink", Arc::clone(sink) as Arc<dyn Stage>));
        let pipeline = test_pipeline(linear_graph("filters", stages));
        play_to_end(&pipeline, Duration::from_secs(5))
    }

    #[test]
    fn test_scale_follows_downstream_filter() {
        let source = ScriptedSource::new()
            .with_output(VideoInfo::new(4, 4, 30).to_caps())
            .with_buffers(2);
        let filter = Capability::new(RAW_VIDEO).with_int("width", 8).with_int("height", 2);
        let sink = Arc::new(RecordingSink::new());

        let outcome = run(
            vec![
                ("source", Arc::new(source)),
                ("scale", Arc::new(VideoScale::new())),
                ("filter", Arc::new(CapsFilter::with_caps(filter))),
            ],
            &sink,
        );

        assert_eq!(outcome, RunOutcome::EndOfStream);
        let caps = sink.caps().unwrap();
        assert_eq!((caps.get_int("width"), caps.get_int("height")), (Some(8), Some(2)));
        assert_eq!(sink.buffer_count(), 2);
        assert_eq!(sink.buffers()[0].len(), VideoInfo::new(8, 2, 30).frame_size());
    }

    #[test]
    fn test_scale_keeps_size_without_constraint() {
        let info = VideoInfo::new(4, 4, 30);
        assert_eq!(VideoScale::output_for(&info, None), info);
        assert_eq!(VideoScale::output_for(&info, Some(&CapabilitySet::any())), info);
    }

    #[test]
    fn test_caps_filter_narrows_port_caps() {
        let filter = CapsFilter::new();
        assert_eq!(filter.port_caps(SINK), None);
        filter
            .set_property("caps", &serde_json::json!("video/x-raw, width=640"))
            .unwrap();
        let narrowed = filter.port_caps(SRC).unwrap();
        assert!(narrowed.accepts(&Capability::new(RAW_VIDEO).with_int("width", 640)));
        assert!(!narrowed.accepts(&Capability::new(RAW_VIDEO).with_int("width", 320)));
        assert!(filter.set_property("caps", &serde_json::json!(640)).is_err());
        assert_eq!(
            filter.set_property("format", &serde_json::json!("I420")),
            Err(PropertyError::Unknown)
        );
    }

    #[test]
    fn test_convert_rgb_to_i420() {
        let rgb = Capability::new(RAW_VIDEO)
            .with_str("format", RGB)
            .with_int("width", 2)
            .with_int("height", 2);
        let source = ScriptedSource::new().with_output(rgb).with_buffers(1);
        let sink = Arc::new(RecordingSink::new());

        let outcome = run(
            vec![
                ("source", Arc::new(source)),
                ("convert", Arc::new(VideoConvert::new())),
            ],
            &sink,
        );

        assert_eq!(outcome, RunOutcome::EndOfStream);
        assert_eq!(sink.caps().unwrap().get_str("format"), Some(I420));
        // 16 zero bytes cover the 12-byte RGB frame: all black
        assert_eq!(sink.buffers()[0].data.as_ref(), &[16, 16, 16, 16, 128, 128]);
    }
}
