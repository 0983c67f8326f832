//! Built-in stages.
//!
//! These stand in for the media plugins a real deployment would load. Each
//! one honours the port and caps contract of the plugin it is named after,
//! so the send and receive pipelines can run end to end:
//!
//! | factory         | stage              | role                          |
//! |-----------------|--------------------|-------------------------------|
//! | `uridecodebin`  | [`UriSource`]      | URI to raw streams, lazy pads |
//! | `videoscale`    | [`VideoScale`]     | resize to the downstream size |
//! | `capsfilter`    | [`CapsFilter`]     | restrict caps                 |
//! | `videoconvert`  | [`VideoConvert`]   | normalise to I420             |
//! | `x264enc`       | [`VideoEncoder`]   | raw video to access units     |
//! | `rtph264pay`    | [`RtpPayloader`]   | access units to RTP           |
//! | `udpsink`       | [`UdpSink`]        | datagrams out                 |
//! | `udpsrc`        | [`UdpSource`]      | datagrams in                  |
//! | `rtph264depay`  | [`RtpDepayloader`] | RTP to access units           |
//! | `avdec_h264`    | [`VideoDecoder`]   | access units to raw video     |
//! | `autovideosink` | [`VideoSink`]      | render                        |
//! | `fakesink`      | [`FakeSink`]       | discard                       |
//!
//! Stages are created by name through a [`StageRegistry`].

mod codec;
mod filters;
mod props;
mod registry;
mod rtp_h264;
mod sinks;
mod udp;
mod uri_source;
mod video;

pub use codec::{AccessUnitHeader, VideoDecoder, VideoEncoder};
pub use filters::{CapsFilter, VideoConvert, VideoScale};
pub use registry::{StageFactory, StageRegistry};
pub use rtp_h264::{rtp_video_caps, RtpDepayloader, RtpPayloader, CLOCK_RATE, DEFAULT_PAYLOAD_TYPE};
pub use sinks::{FakeSink, VideoSink};
pub use udp::{UdpSink, UdpSource};
pub use uri_source::UriSource;
pub use video::{rgb_to_i420, scale_i420, VideoInfo, I420};
