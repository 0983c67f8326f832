//! Media buffers passed between stages.

use bytes::Bytes;
use std::time::Duration;

/// A chunk of media data flowing from an output port to its peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    /// Payload bytes.
    pub data: Bytes,
    /// Presentation timestamp relative to the start of the stream.
    pub pts: Option<Duration>,
    /// Sequence index assigned by the producing stage.
    pub offset: u64,
    /// Marks the last buffer of a frame or access unit.
    pub marker: bool,
}

impl Buffer {
    /// Creates a buffer around `data`.
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Sets the presentation timestamp.
    #[must_use]
    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Sets the sequence index.
    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Sets the marker flag.
    #[must_use]
    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true for an empty payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a buffer with the same metadata and new data.
    #[must_use]
    pub fn map_data(&self, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pts: self.pts,
            offset: self.offset,
            marker: self.marker,
        }
    }
}
