//! Raw I420 video helpers.

use crate::caps::{Capability, RAW_VIDEO};
use std::time::Duration;

/// Pixel format every built-in raw video stage speaks.
pub const I420: &str = "I420";

/// Largest frame side accepted by the built-in stages.
pub const MAX_DIMENSION: i64 = 8192;

/// Geometry and rate of a raw video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Framerate numerator.
    pub fps_n: u32,
    /// Framerate denominator.
    pub fps_d: u32,
}

impl VideoInfo {
    /// Creates a description at `fps` frames per second.
    #[must_use]
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps_n: fps.max(1),
            fps_d: 1,
        }
    }

    /// Reads width, height and framerate from fixed caps.
    #[must_use]
    pub fn from_caps(caps: &Capability) -> Option<Self> {
        let width = u32::try_from(caps.get_int("width")?).ok()?;
        let height = u32::try_from(caps.get_int("height")?).ok()?;
        let (fps_n, fps_d) = caps
            .get_fraction("framerate")
            .and_then(|(n, d)| Some((u32::try_from(n).ok()?, u32::try_from(d).ok()?)))
            .filter(|(n, d)| *n > 0 && *d > 0)
            .unwrap_or((30, 1));
        (width > 0 && height > 0).then_some(Self {
            width,
            height,
            fps_n,
            fps_d,
        })
    }

    /// Fixed raw video caps for this geometry.
    #[must_use]
    pub fn to_caps(&self) -> Capability {
        Capability::new(RAW_VIDEO)
            .with_str("format", I420)
            .with_int("width", i64::from(self.width))
            .with_int("height", i64::from(self.height))
            .with_fraction(
                "framerate",
                i32::try_from(self.fps_n).unwrap_or(i32::MAX),
                i32::try_from(self.fps_d).unwrap_or(1),
            )
    }

    /// Bytes in one I420 frame.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        let (w, h) = (self.width as usize, self.height as usize);
        w * h + 2 * (w.div_ceil(2) * h.div_ceil(2))
    }

    /// Display time of one frame.
    #[must_use]
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.fps_d)) / self.fps_n.max(1)
    }

    /// Presentation time of frame `index`.
    #[must_use]
    pub fn pts(&self, index: u64) -> Duration {
        Duration::from_nanos(
            index.saturating_mul(1_000_000_000).saturating_mul(u64::from(self.fps_d))
                / u64::from(self.fps_n.max(1)),
        )
    }
}

/// Nearest-neighbour resize of one I420 frame.
///
/// Missing input bytes read as black.
#[must_use]
pub fn scale_i420(data: &[u8], from: &VideoInfo, to: &VideoInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(to.frame_size());
    let planes = [
        (from.width as usize, from.height as usize, to.width as usize, to.height as usize),
        (
            (from.width as usize).div_ceil(2),
            (from.height as usize).div_ceil(2),
            (to.width as usize).div_ceil(2),
            (to.height as usize).div_ceil(2),
        ),
    ];

    let mut offset = 0;
    for (plane, (sw, sh, dw, dh)) in [planes[0], planes[1], planes[1]].into_iter().enumerate() {
        let black = if plane == 0 { 16 } else { 128 };
        for y in 0..dh {
            let sy = y * sh / dh.max(1);
            for x in 0..dw {
                let sx = x * sw / dw.max(1);
                out.push(data.get(offset + sy * sw + sx).copied().unwrap_or(black));
            }
        }
        offset += sw * sh;
    }
    out
}

/// Converts packed RGB to I420 with BT.601 studio-range coefficients.
///
/// Chroma is taken from the top-left pixel of each 2x2 block.
#[must_use]
pub fn rgb_to_i420(data: &[u8], info: &VideoInfo) -> Vec<u8> {
    let (w, h) = (info.width as usize, info.height as usize);
    let pixel = |x: usize, y: usize| -> (i32, i32, i32) {
        let at = (y * w + x) * 3;
        match data.get(at..at + 3) {
            Some(p) => (i32::from(p[0]), i32::from(p[1]), i32::from(p[2])),
            None => (0, 0, 0),
        }
    };
    let clamp = |v: i32| v.clamp(0, 255) as u8;

    let mut out = Vec::with_capacity(info.frame_size());
    for y in 0..h {
        for x in 0..w {
            let (r, g, b) = pixel(x, y);
            out.push(clamp(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16));
        }
    }
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let mut u = Vec::with_capacity(cw * ch);
    let mut v = Vec::with_capacity(cw * ch);
    for y in 0..ch {
        for x in 0..cw {
            let (r, g, b) = pixel(x * 2, y * 2);
            u.push(clamp(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128));
            v.push(clamp(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128));
        }
    }
    out.extend(u);
    out.extend(v);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_frame_size_rounds_chroma_up() {
        assert_eq!(VideoInfo::new(4, 4, 30).frame_size(), 24);
        assert_eq!(VideoInfo::new(3, 3, 30).frame_size(), 9 + 2 * 4);
        assert_eq!(VideoInfo::new(1920, 1080, 30).frame_size(), 1920 * 1080 * 3 / 2);
    }

    #[test]
    fn test_caps_round_trip_and_default_rate() {
        let info = VideoInfo::new(640, 360, 25);
        assert_eq!(VideoInfo::from_caps(&info.to_caps()), Some(info));

        let bare = Capability::new(RAW_VIDEO).with_int("width", 2).with_int("height", 2);
        assert_eq!(VideoInfo::from_caps(&bare).map(|i| i.fps_n), Some(30));
        assert_eq!(VideoInfo::from_caps(&Capability::new(RAW_VIDEO)), None);
    }

    #[test]
    fn test_pts_and_duration() {
        let info = VideoInfo::new(2, 2, 25);
        assert_eq!(info.frame_duration(), Duration::from_millis(40));
        assert_eq!(info.pts(10), Duration::from_millis(400));
    }

    #[test]
    fn test_scale_doubles_pixels() {
        let from = VideoInfo::new(2, 2, 30);
        let to = VideoInfo::new(4, 4, 30);
        // Y plane 1 2 / 3 4, then one U and one V sample
        let frame = [1, 2, 3, 4, 100, 200];
        let scaled = scale_i420(&frame, &from, &to);
        assert_eq!(scaled.len(), to.frame_size());
        assert_eq!(&scaled[..8], &[1, 1, 2, 2, 1, 1, 2, 2]);
        assert_eq!(&scaled[16..20], &[100, 100, 100, 100]);
        assert_eq!(&scaled[20..24], &[200, 200, 200, 200]);
    }

    #[test]
    fn test_rgb_black_and_white() {
        let info = VideoInfo::new(2, 2, 30);
        let black = rgb_to_i420(&[0; 12], &info);
        assert_eq!(black, vec![16, 16, 16, 16, 128, 128]);

        let white = rgb_to_i420(&[255; 12], &info);
        assert_eq!(&white[..4], &[235, 235, 235, 235]);
        assert_eq!(&white[4..], &[128, 128]);
    }
}
