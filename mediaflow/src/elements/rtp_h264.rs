//! `rtph264pay` and `rtph264depay`: access units in and out of RTP packets.

use super::props;
use crate::caps::{Capability, H264, RTP};
use crate::core::StageKind;
use crate::errors::{FlowError, PropertyError};
use crate::events::ErrorCode;
use crate::stages::{Buffer, PortTemplate, Stage, StageContext};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rtp::packet::Packet;
use std::time::Duration;
use tracing::{debug, trace};
use webrtc_util::marshal::{Marshal, MarshalSize, Unmarshal};

const SINK: &str = "sink";
const SRC: &str = "src";

/// RTP clock for video.
pub const CLOCK_RATE: u32 = 90_000;
/// First dynamic payload type.
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;
const DEFAULT_MTU: usize = 1400;
const RTP_HEADER_LEN: usize = 12;

/// Caps of the H.264 RTP stream carried on payload type `pt`.
#[must_use]
pub fn rtp_video_caps(pt: u8) -> Capability {
    Capability::new(RTP)
        .with_str("media", "video")
        .with_int("clock-rate", i64::from(CLOCK_RATE))
        .with_str("encoding-name", "H264")
        .with_int("payload", i64::from(pt))
}

fn h264_caps() -> Capability {
    Capability::new(H264)
        .with_str("stream-format", "byte-stream")
        .with_str("alignment", "au")
}

fn rtp_timestamp(base: u32, pts: Duration) -> u32 {
    let ticks = pts.as_nanos() * u128::from(CLOCK_RATE) / 1_000_000_000;
    // RTP timestamps wrap at 32 bits
    base.wrapping_add((ticks % (1u128 << 32)) as u32)
}

#[derive(Debug)]
struct PayloaderState {
    sequence: u16,
    ssrc: u32,
    timestamp_base: u32,
}

impl Default for PayloaderState {
    fn default() -> Self {
        Self {
            sequence: rand::random(),
            ssrc: rand::random(),
            timestamp_base: rand::random(),
        }
    }
}

/// Splits access units into RTP packets no larger than `mtu`.
#[derive(Debug)]
pub struct RtpPayloader {
    payload_type: Mutex<u8>,
    mtu: Mutex<usize>,
    state: Mutex<PayloaderState>,
}

impl Default for RtpPayloader {
    fn default() -> Self {
        Self {
            payload_type: Mutex::new(DEFAULT_PAYLOAD_TYPE),
            mtu: Mutex::new(DEFAULT_MTU),
            state: Mutex::new(PayloaderState::default()),
        }
    }
}

impl RtpPayloader {
    /// Creates a payloader for payload type 96.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configured payload type.
    #[must_use]
    pub fn payload_type(&self) -> u8 {
        *self.payload_type.lock()
    }

    /// Builds the packets for one access unit.
    fn packetize(&self, data: &Bytes, pts: Duration) -> Result<Vec<Bytes>, String> {
        let payload_type = self.payload_type();
        let chunk = self.mtu.lock().saturating_sub(RTP_HEADER_LEN).max(1);
        let mut state = self.state.lock();
        let timestamp = rtp_timestamp(state.timestamp_base, pts);
        let count = data.len().div_ceil(chunk).max(1);

        let mut packets = Vec::with_capacity(count);
        for index in 0..count {
            let start = index * chunk;
            let end = (start + chunk).min(data.len());
            let packet = Packet {
                header: rtp::header::Header {
                    version: 2,
                    marker: index + 1 == count,
                    payload_type,
                    sequence_number: state.sequence,
                    timestamp,
                    ssrc: state.ssrc,
                    ..Default::default()
                },
                payload: data.slice(start..end),
            };
            state.sequence = state.sequence.wrapping_add(1);

            let mut buf = vec![0u8; packet.marshal_size()];
            packet
                .marshal_to(&mut buf)
                .map_err(|e| format!("RTP marshal error: {e}"))?;
            packets.push(Bytes::from(buf));
        }
        Ok(packets)
    }
}

#[async_trait]
impl Stage for RtpPayloader {
    fn factory_name(&self) -> &'static str {
        "rtph264pay"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn templates(&self) -> Vec<PortTemplate> {
        vec![
            PortTemplate::input(SINK, Capability::new(H264)),
            PortTemplate::output(
                SRC,
                Capability::new(RTP)
                    .with_str("media", "video")
                    .with_int("clock-rate", i64::from(CLOCK_RATE))
                    .with_str("encoding-name", "H264")
                    .with_range("payload", 96, 127),
            ),
        ]
    }

    fn set_property(&self, key: &str, value: &serde_json::Value) -> Result<(), PropertyError> {
        match key {
            // range checked, the casts cannot truncate
            "pt" => *self.payload_type.lock() = props::uint(value, 96, 127)? as u8,
            "mtu" => *self.mtu.lock() = props::uint(value, 28, 65_507)? as usize,
            "ssrc" => self.state.lock().ssrc = props::uint(value, 0, u64::from(u32::MAX))? as u32,
            _ => return Err(PropertyError::Unknown),
        }
        Ok(())
    }

    fn set_caps(&self, ctx: &StageContext, _port: &str, _caps: &Capability) -> Result<(), FlowError> {
        ctx.set_output_caps(SRC, rtp_video_caps(self.payload_type()))
    }

    fn chain(&self, ctx: &StageContext, _port: &str, buffer: Buffer) -> Result<(), FlowError> {
        let pts = buffer.pts.unwrap_or_default();
        let packets = self.packetize(&buffer.data, pts).map_err(|reason| {
            ctx.error(ErrorCode::StreamFailed, "Could not payload stream.", Some(reason))
        })?;
        trace!(stage = ctx.stage_name(), packets = packets.len(), len = buffer.len(), "payloaded access unit");
        let last = packets.len().saturating_sub(1);
        for (index, packet) in packets.into_iter().enumerate() {
            ctx.push(
                SRC,
                Buffer::new(packet)
                    .with_pts(pts)
                    .with_offset(buffer.offset)
                    .with_marker(index == last),
            )?;
        }
        Ok(())
    }
}

/// Reassembles access units from packets in arrival order.
///
/// A sequence gap discards the unit in progress and everything up to the
/// next marker.
#[derive(Debug, Default)]
struct Reassembler {
    pending: BytesMut,
    expected: Option<u16>,
    resync: bool,
    first_timestamp: Option<u32>,
}

impl Reassembler {
    fn push(&mut self, packet: &Packet) -> Option<(Bytes, Duration)> {
        let header = &packet.header;
        if self.expected.is_some_and(|seq| seq != header.sequence_number) {
            debug!(
                expected = self.expected,
                got = header.sequence_number,
                "sequence gap, dropping partial access unit"
            );
            self.pending.clear();
            self.resync = true;
        }
        self.expected = Some(header.sequence_number.wrapping_add(1));

        if self.resync {
            if header.marker {
                self.resync = false;
            }
            return None;
        }

        self.pending.extend_from_slice(&packet.payload);
        if !header.marker {
            return None;
        }
        let base = *self.first_timestamp.get_or_insert(header.timestamp);
        let ticks = header.timestamp.wrapping_sub(base);
        let pts = Duration::from_nanos(u64::from(ticks) * 1_000_000_000 / u64::from(CLOCK_RATE));
        Some((self.pending.split().freeze(), pts))
    }
}

/// Joins RTP fragments back into access units.
#[derive(Debug, Default)]
pub struct RtpDepayloader {
    reassembler: Mutex<Reassembler>,
    units: Mutex<u64>,
}

impl RtpDepayloader {
    /// Creates a depayloader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Stage for RtpDepayloader {
    fn factory_name(&self) -> &'static str {
        "rtph264depay"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn templates(&self) -> Vec<PortTemplate> {
        vec![
            PortTemplate::input(
                SINK,
                Capability::new(RTP)
                    .with_str("media", "video")
                    .with_str("encoding-name", "H264"),
            ),
            PortTemplate::output(SRC, h264_caps()),
        ]
    }

    fn set_caps(&self, ctx: &StageContext, _port: &str, caps: &Capability) -> Result<(), FlowError> {
        debug!(stage = ctx.stage_name(), caps = %caps, "depayloading");
        ctx.set_output_caps(SRC, h264_caps())
    }

    fn chain(&self, ctx: &StageContext, _port: &str, buffer: Buffer) -> Result<(), FlowError> {
        let packet = match Packet::unmarshal(&mut buffer.data.as_ref()) {
            Ok(packet) => packet,
            Err(e) => {
                ctx.warning(
                    ErrorCode::StreamDecode,
                    "Dropped malformed RTP packet.",
                    Some(e.to_string()),
                );
                return Ok(());
            }
        };
        let Some((unit, pts)) = self.reassembler.lock().push(&packet) else {
            return Ok(());
        };
        let offset = {
            let mut units = self.units.lock();
            *units += 1;
            *units - 1
        };
        ctx.push(
            SRC,
            Buffer::new(unit).with_pts(pts).with_offset(offset).with_marker(true),
        )
    }

    fn handle_eos(&self, ctx: &StageContext, _port: &str) {
        let mut reassembler = self.reassembler.lock();
        if !reassembler.pending.is_empty() {
            debug!(
                stage = ctx.stage_name(),
                bytes = reassembler.pending.len(),
                "discarding incomplete access unit at end of stream"
            );
        }
        *reassembler = Reassembler::default();
        drop(reassembler);
        ctx.push_eos_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RunOutcome;
    use crate::testing::{linear_graph, play_to_end, test_pipeline, RecordingSink, ScriptedSource};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn parse(packet: &Bytes) -> Packet {
        Packet::unmarshal(&mut packet.as_ref()).unwrap()
    }

    #[test]
    fn test_packetize_respects_mtu_and_marks_last() {
        let pay = RtpPayloader::new();
        pay.set_property("mtu", &serde_json::json!(40)).unwrap();
        pay.set_property("ssrc", &serde_json::json!(7)).unwrap();

        let unit = Bytes::from((0..100u8).collect::<Vec<_>>());
        let packets = pay.packetize(&unit, Duration::from_secs(1)).unwrap();
        assert_eq!(packets.len(), 4);
        assert!(packets.iter().all(|p| p.len() <= 40));

        let parsed: Vec<Packet> = packets.iter().map(parse).collect();
        assert_eq!(
            parsed.iter().map(|p| p.header.marker).collect::<Vec<_>>(),
            vec![false, false, false, true]
        );
        assert!(parsed.iter().all(|p| p.header.payload_type == 96 && p.header.ssrc == 7));
        assert!(parsed.iter().all(|p| p.header.timestamp == parsed[0].header.timestamp));
        assert_eq!(
            parsed[1].header.sequence_number,
            parsed[0].header.sequence_number.wrapping_add(1)
        );
    }

    #[test]
    fn test_payload_type_range() {
        let pay = RtpPayloader::new();
        assert!(pay.set_property("pt", &serde_json::json!(95)).is_err());
        pay.set_property("pt", &serde_json::json!(100)).unwrap();
        assert_eq!(pay.payload_type(), 100);
        assert_eq!(rtp_video_caps(100).get_int("payload"), Some(100));
    }

    #[test]
    fn test_rtp_timestamp_uses_video_clock() {
        assert_eq!(rtp_timestamp(0, Duration::from_secs(1)), CLOCK_RATE);
        assert_eq!(rtp_timestamp(u32::MAX, Duration::from_nanos(1_000_000_000 / 90_000 + 1)), 0);
    }

    #[test]
    fn test_reassembler_drops_unit_after_gap() {
        let pay = RtpPayloader::new();
        // 16 payload bytes per packet
        pay.set_property("mtu", &serde_json::json!(28)).unwrap();
        let first = pay.packetize(&Bytes::from(vec![1u8; 40]), Duration::ZERO).unwrap();
        let second = pay.packetize(&Bytes::from(vec![2u8; 40]), Duration::from_millis(40)).unwrap();
        let third = pay.packetize(&Bytes::from(vec![3u8; 8]), Duration::from_millis(80)).unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        assert_eq!(third.len(), 1);

        let mut reassembler = Reassembler::default();
        let mut units = Vec::new();
        // lose the middle fragment of the first unit
        for packet in [&first[0], &first[2]].into_iter().chain(&second).chain(&third) {
            units.extend(reassembler.push(&parse(packet)));
        }

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].0, Bytes::from(vec![2u8; 40]));
        assert_eq!(units[1].0, Bytes::from(vec![3u8; 8]));
        assert_eq!(units[1].1 - units[0].1, Duration::from_millis(40));
    }

    #[test]
    fn test_payload_and_depayload_in_pipeline() {
        let source = ScriptedSource::new()
            .with_output(Capability::new(H264))
            .with_buffer_size(40)
            .with_buffers(3);
        let pay = RtpPayloader::new();
        // every unit goes out as three fragments
        pay.set_property("mtu", &serde_json::json!(28)).unwrap();
        let sink = Arc::new(RecordingSink::new());
        let pipeline = test_pipeline(linear_graph(
            "rtp",
            vec![
                ("source", Arc::new(source) as Arc<dyn Stage>),
                ("pay", Arc::new(pay)),
                ("depay", Arc::new(RtpDepayloader::new())),
                ("sink", Arc::clone(&sink) as Arc<dyn Stage>),
            ],
        ));

        assert_eq!(play_to_end(&pipeline, Duration::from_secs(5)), RunOutcome::EndOfStream);
        assert_eq!(sink.buffer_count(), 3);
        assert!(sink.buffers().iter().all(|b| b.data.as_ref() == [0u8; 40]));
        assert_eq!(sink.caps().unwrap().media_type(), H264);
    }
}
