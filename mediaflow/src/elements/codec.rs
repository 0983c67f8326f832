//! `x264enc` and `avdec_h264` stand-ins.
//!
//! Frames are not really compressed. Each access unit is a fixed header
//! followed by filler sized to the configured bitrate:
//!
//! ```text
//! "MFV1" | width u32 | height u32 | index u32 | flags u8 | luma u8 | filler
//! ```
//!
//! All integers are big-endian. The decoder rebuilds a flat frame of the
//! recorded mean luma, which is enough for the receive side to render
//! something of the right size.

use super::props;
use super::video::{VideoInfo, I420, MAX_DIMENSION};
use crate::caps::{Capability, H264, RAW_VIDEO};
use crate::core::StageKind;
use crate::errors::{FlowError, PropertyError};
use crate::events::ErrorCode;
use crate::stages::{Buffer, PortTemplate, Stage, StageContext};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace};

const SINK: &str = "sink";
const SRC: &str = "src";

const MAGIC: &[u8; 4] = b"MFV1";
const FLAG_KEYFRAME: u8 = 0x01;
/// Bytes before the filler.
pub const HEADER_LEN: usize = 18;
const MIN_ACCESS_UNIT: usize = 64;

const DEFAULT_BITRATE: u64 = 3000;
const DEFAULT_KEY_INTERVAL: u64 = 30;

/// The fixed header of an encoded access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessUnitHeader {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frame index since the encoder started.
    pub index: u32,
    /// The frame can be decoded on its own.
    pub keyframe: bool,
    /// Mean luma of the source frame.
    pub luma: u8,
}

impl AccessUnitHeader {
    fn write(&self, out: &mut BytesMut) {
        out.put_slice(MAGIC);
        out.put_u32(self.width);
        out.put_u32(self.height);
        out.put_u32(self.index);
        out.put_u8(if self.keyframe { FLAG_KEYFRAME } else { 0 });
        out.put_u8(self.luma);
    }

    /// Parses the header at the start of an access unit.
    ///
    /// # Errors
    ///
    /// Returns a description of what is wrong with the data.
    pub fn parse(mut data: &[u8]) -> Result<Self, String> {
        if data.len() < HEADER_LEN {
            return Err(format!("access unit of {} bytes is shorter than its header", data.len()));
        }
        if &data[..4] != MAGIC {
            return Err(format!("bad magic {:02x?}", &data[..4]));
        }
        data.advance(4);
        let width = data.get_u32();
        let height = data.get_u32();
        let index = data.get_u32();
        let flags = data.get_u8();
        let luma = data.get_u8();
        let max = u32::try_from(MAX_DIMENSION).unwrap_or(u32::MAX);
        if width == 0 || height == 0 || width > max || height > max {
            return Err(format!("invalid frame size {width}x{height}"));
        }
        Ok(Self {
            width,
            height,
            index,
            keyframe: flags & FLAG_KEYFRAME != 0,
            luma,
        })
    }
}

fn mean_luma(data: &[u8], info: &VideoInfo) -> u8 {
    let plane = (info.width as usize * info.height as usize).min(data.len());
    if plane == 0 {
        return 16;
    }
    let sum: u64 = data[..plane].iter().map(|&b| u64::from(b)).sum();
    u8::try_from(sum / plane as u64).unwrap_or(u8::MAX)
}

#[derive(Debug, Default)]
struct EncoderState {
    info: Option<VideoInfo>,
    frames: u32,
}

/// Turns raw I420 frames into access units sized by `bitrate` (kbps).
#[derive(Debug)]
pub struct VideoEncoder {
    bitrate: Mutex<u64>,
    key_interval: Mutex<u64>,
    state: Mutex<EncoderState>,
}

impl Default for VideoEncoder {
    fn default() -> Self {
        Self {
            bitrate: Mutex::new(DEFAULT_BITRATE),
            key_interval: Mutex::new(DEFAULT_KEY_INTERVAL),
            state: Mutex::new(EncoderState::default()),
        }
    }
}

impl VideoEncoder {
    /// Creates an encoder at 3000 kbps.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configured bitrate in kbps.
    #[must_use]
    pub fn bitrate(&self) -> u64 {
        *self.bitrate.lock()
    }

    /// Size of one access unit at the configured bitrate.
    #[must_use]
    pub fn access_unit_size(&self, info: &VideoInfo) -> usize {
        let bytes_per_second = self.bitrate() * 1000 / 8;
        let per_frame = bytes_per_second * u64::from(info.fps_d) / u64::from(info.fps_n.max(1));
        usize::try_from(per_frame).unwrap_or(usize::MAX).max(MIN_ACCESS_UNIT)
    }

    fn encode(&self, data: &[u8], info: &VideoInfo, index: u32) -> Bytes {
        let header = AccessUnitHeader {
            width: info.width,
            height: info.height,
            index,
            keyframe: u64::from(index) % (*self.key_interval.lock()).max(1) == 0,
            luma: mean_luma(data, info),
        };
        let size = self.access_unit_size(info);
        let mut out = BytesMut::with_capacity(size);
        header.write(&mut out);
        // filler that never repeats the magic
        out.resize(size, 0xA5);
        out.freeze()
    }
}

#[async_trait]
impl Stage for VideoEncoder {
    fn factory_name(&self) -> &'static str {
        "x264enc"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn templates(&self) -> Vec<PortTemplate> {
        vec![
            PortTemplate::input(
                SINK,
                Capability::new(RAW_VIDEO)
                    .with_str("format", I420)
                    .with_range("width", 1, MAX_DIMENSION)
                    .with_range("height", 1, MAX_DIMENSION),
            ),
            PortTemplate::output(
                SRC,
                Capability::new(H264)
                    .with_str("stream-format", "byte-stream")
                    .with_str("alignment", "au"),
            ),
        ]
    }

    fn set_property(&self, key: &str, value: &serde_json::Value) -> Result<(), PropertyError> {
        match key {
            "bitrate" => *self.bitrate.lock() = props::uint(value, 1, 2_048_000)?,
            "key-int-max" => *self.key_interval.lock() = props::uint(value, 1, 10_000)?,
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    fn set_caps(&self, ctx: &StageContext, _port: &str, caps: &Capability) -> Result<(), FlowError> {
        let info = VideoInfo::from_caps(caps)
            .ok_or_else(|| FlowError::NotNegotiated(format!("{caps} has no frame size")))?;
        let (fps_n, fps_d) = (
            i32::try_from(info.fps_n).unwrap_or(i32::MAX),
            i32::try_from(info.fps_d).unwrap_or(1),
        );
        let out = Capability::new(H264)
            .with_str("stream-format", "byte-stream")
            .with_str("alignment", "au")
            .with_int("width", i64::from(info.width))
            .with_int("height", i64::from(info.height))
            .with_fraction("framerate", fps_n, fps_d);
        ctx.set_output_caps(SRC, out)?;
        debug!(
            stage = ctx.stage_name(),
            bitrate = self.bitrate(),
            unit = self.access_unit_size(&info),
            "configured encoder"
        );
        *self.state.lock() = EncoderState {
            info: Some(info),
            frames: 0,
        };
        Ok(())
    }

    fn chain(&self, ctx: &StageContext, _port: &str, buffer: Buffer) -> Result<(), FlowError> {
        let (info, index) = {
            let mut state = self.state.lock();
            let Some(info) = state.info else {
                return Err(FlowError::NotNegotiated("encoder received data before caps".to_string()));
            };
            let index = state.frames;
            state.frames = state.frames.wrapping_add(1);
            (info, index)
        };
        let unit = self.encode(&buffer.data, &info, index);
        trace!(stage = ctx.stage_name(), index, len = unit.len(), "encoded frame");
        ctx.push(
            SRC,
            buffer.map_data(unit).with_offset(u64::from(index)).with_marker(true),
        )
    }
}

/// Validates access units and emits flat raw frames of the encoded size.
#[derive(Debug, Default)]
pub struct VideoDecoder {
    output: Mutex<Option<VideoInfo>>,
    framerate: Mutex<Option<(u32, u32)>>,
}

impl VideoDecoder {
    /// Creates a decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(header: &AccessUnitHeader, info: &VideoInfo) -> Vec<u8> {
        let luma = info.width as usize * info.height as usize;
        let mut frame = vec![header.luma; luma];
        frame.resize(info.frame_size(), 128);
        frame
    }
}

#[async_trait]
impl Stage for VideoDecoder {
    fn factory_name(&self) -> &'static str {
        "avdec_h264"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn templates(&self) -> Vec<PortTemplate> {
        vec![
            PortTemplate::input(SINK, Capability::new(H264)),
            PortTemplate::output(SRC, Capability::new(RAW_VIDEO).with_str("format", I420)),
        ]
    }

    fn set_caps(&self, _ctx: &StageContext, _port: &str, caps: &Capability) -> Result<(), FlowError> {
        *self.framerate.lock() = caps
            .get_fraction("framerate")
            .and_then(|(n, d)| Some((u32::try_from(n).ok()?, u32::try_from(d).ok()?)))
            .filter(|(n, d)| *n > 0 && *d > 0);
        Ok(())
    }

    fn chain(&self, ctx: &StageContext, _port: &str, buffer: Buffer) -> Result<(), FlowError> {
        let header = AccessUnitHeader::parse(&buffer.data).map_err(|reason| {
            ctx.error(
                ErrorCode::StreamDecode,
                "Could not decode stream.",
                Some(reason),
            )
        })?;

        let (fps_n, fps_d) = self.framerate.lock().unwrap_or((30, 1));
        let info = VideoInfo {
            width: header.width,
            height: header.height,
            fps_n,
            fps_d,
        };
        let current = *self.output.lock();
        if current != Some(info) {
            debug!(
                stage = ctx.stage_name(),
                width = info.width,
                height = info.height,
                "decoder output size changed"
            );
            ctx.set_output_caps(SRC, info.to_caps())?;
            *self.output.lock() = Some(info);
        }

        let pts = buffer.pts.unwrap_or_else(|| info.pts(u64::from(header.index)));
        let frame = Self::decode(&header, &info);
        ctx.push(
            SRC,
            Buffer::new(frame)
                .with_pts(pts)
                .with_offset(u64::from(header.index)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::State;
    use crate::events::{EventBody, EventKind};
    use crate::pipeline::RunOutcome;
    use crate::testing::{
        linear_graph, play_to_end, test_pipeline, wait_for_kind, RecordingSink, ScriptedSource,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_access_unit_size_follows_bitrate() {
        let encoder = VideoEncoder::new();
        let info = VideoInfo::new(1920, 1080, 30);
        assert_eq!(encoder.access_unit_size(&info), 3000 * 1000 / 8 / 30);

        encoder.set_property("bitrate", &serde_json::json!(1)).unwrap();
        assert_eq!(encoder.access_unit_size(&info), MIN_ACCESS_UNIT);
        assert!(encoder.set_property("bitrate", &serde_json::json!(0)).is_err());
    }

    #[test]
    fn test_header_round_trip_through_encoder() {
        let encoder = VideoEncoder::new();
        let info = VideoInfo::new(4, 2, 30);
        let unit = encoder.encode(&[50; 12], &info, 30);
        let header = AccessUnitHeader::parse(&unit).unwrap();
        assert_eq!(
            header,
            AccessUnitHeader {
                width: 4,
                height: 2,
                index: 30,
                keyframe: true,
                luma: 50
            }
        );
        assert!(!AccessUnitHeader::parse(&encoder.encode(&[0; 12], &info, 31)).unwrap().keyframe);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(AccessUnitHeader::parse(b"MFV1").unwrap_err().contains("shorter"));
        assert!(AccessUnitHeader::parse(&[0u8; 32]).unwrap_err().contains("magic"));

        let mut zero = BytesMut::new();
        AccessUnitHeader {
            width: 0,
            height: 10,
            index: 0,
            keyframe: true,
            luma: 0,
        }
        .write(&mut zero);
        assert!(AccessUnitHeader::parse(&zero).unwrap_err().contains("0x10"));
    }

    #[test]
    fn test_encode_then_decode_restores_frame_size() {
        let source = ScriptedSource::new()
            .with_output(VideoInfo::new(4, 4, 30).to_caps())
            .with_buffers(3);
        let sink = Arc::new(RecordingSink::new());
        let pipeline = test_pipeline(linear_graph(
            "codec",
            vec![
                ("source", Arc::new(source) as Arc<dyn Stage>),
                ("encoder", Arc::new(VideoEncoder::new())),
                ("decoder", Arc::new(VideoDecoder::new())),
                ("sink", Arc::clone(&sink) as Arc<dyn Stage>),
            ],
        ));

        assert_eq!(play_to_end(&pipeline, Duration::from_secs(5)), RunOutcome::EndOfStream);
        let buffers = sink.buffers();
        assert_eq!(buffers.len(), 3);
        assert!(buffers.iter().all(|b| b.len() == 24));
        assert_eq!(buffers[2].offset, 2);
        assert_eq!(sink.caps().unwrap().get_int("width"), Some(4));
    }

    #[test]
    fn test_decoder_reports_bad_data() {
        let source = ScriptedSource::new()
            .with_output(Capability::new(H264))
            .with_buffers(1);
        let pipeline = test_pipeline(linear_graph(
            "bad-stream",
            vec![
                ("source", Arc::new(source) as Arc<dyn Stage>),
                ("decoder", Arc::new(VideoDecoder::new())),
                ("sink", Arc::new(RecordingSink::new())),
            ],
        ));
        let bus = pipeline.bus();

        pipeline.set_state(State::Playing).unwrap();
        let event = wait_for_kind(&bus, EventKind::Error, Duration::from_secs(5)).unwrap();
        assert_eq!(event.origin.name(), "decoder");
        match event.body {
            EventBody::Error(details) => assert_eq!(details.code, ErrorCode::StreamDecode),
            other => panic!("unexpected event {other:?}"),
        }
        pipeline.request_state(State::Null);
    }
}
