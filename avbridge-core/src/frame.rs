//! The unit moved through the pipeline.

use std::fmt::Debug;

use bytes::Bytes;

use crate::codec::WireCodec;
use crate::error::FrameError;
use crate::header::{FrameHeader, HEADER_SIZE};

// ── MediaKind ────────────────────────────────────────────────────

/// Which lane a frame belongs to. The discriminant is the wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MediaKind {
    Audio = 0x01,
    Video = 0x02,
}

impl MediaKind {
    /// Both kinds, in lane order.
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];

    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Maps a wire tag back to a kind; `None` for anything unknown.
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(MediaKind::Audio),
            0x02 => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

// ── MediaFrame ───────────────────────────────────────────────────

/// One timestamped unit of media.
///
/// Frames are immutable once built. The payload is a [`Bytes`] so a
/// frame can be handed from producer to queue to consumer without
/// copying, but there is no way to edit it after construction.
#[derive(Clone, PartialEq, Eq)]
pub struct MediaFrame {
    kind: MediaKind,
    timestamp: u64,
    payload: Bytes,
}

impl MediaFrame {
    pub fn new(kind: MediaKind, timestamp: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            timestamp,
            payload: payload.into(),
        }
    }

    pub fn audio(timestamp: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(MediaKind::Audio, timestamp, payload)
    }

    pub fn video(timestamp: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(MediaKind::Video, timestamp, payload)
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Capture-time timestamp in monotonic device units.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Size of this frame on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Consume the frame, keeping only its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Serialize header and payload into one contiguous buffer.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        WireCodec::default().encode_frame(self)
    }

    /// Decode exactly one frame from the front of `bytes`.
    ///
    /// `bytes` is treated as the whole remaining stream: a short buffer
    /// is reported as [`FrameError::Truncated`]. For incremental
    /// parsing use [`WireCodec`] through `tokio_util::codec`.
    ///
    /// Returns the frame and the number of bytes it occupied.
    pub fn decode(bytes: &[u8], max_payload: usize) -> Result<(Self, usize), FrameError> {
        let header = FrameHeader::parse(bytes)?;
        header.check_payload_len(max_payload)?;

        let frame_len = header.frame_len();
        if bytes.len() < frame_len {
            return Err(FrameError::Truncated {
                needed: frame_len,
                available: bytes.len(),
            });
        }

        let kind = header.kind().ok_or(FrameError::InvalidKind {
            tag: header.tag(),
            frame_len,
        })?;
        let payload = Bytes::copy_from_slice(&bytes[HEADER_SIZE..frame_len]);
        Ok((Self::new(kind, header.timestamp(), payload), frame_len))
    }
}

impl Debug for MediaFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaFrame")
            .field("kind", &self.kind)
            .field("timestamp", &self.timestamp)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
