//! Fixed 13-byte frame header.
//!
//! ```text
//! offset 0..8   timestamp       u64 (little-endian)
//! offset 8      kind tag        u8  (0x01 audio, 0x02 video)
//! offset 9..13  payload length  u32 (little-endian)
//! ```
//!
//! The tag has its own byte. It never overlaps the timestamp field.

use crate::error::FrameError;
use crate::frame::MediaKind;

pub type FrameHeaderBytes = [u8; HEADER_SIZE];
pub const HEADER_SIZE: usize = 13;

const TIMESTAMP: std::ops::Range<usize> = 0..8;
const TAG: usize = 8;
const PAYLOAD_LEN: std::ops::Range<usize> = 9..13;

/// Decoded header. The tag is kept raw so unknown kinds can still be
/// measured and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    timestamp: u64,
    tag: u8,
    payload_len: u32,
}

impl FrameHeader {
    pub fn new(kind: MediaKind, timestamp: u64, payload_len: u32) -> Self {
        Self {
            timestamp,
            tag: kind.tag(),
            payload_len,
        }
    }

    pub fn to_bytes(&self) -> FrameHeaderBytes {
        let mut header: FrameHeaderBytes = [0; HEADER_SIZE];
        header[TIMESTAMP].copy_from_slice(&self.timestamp.to_le_bytes());
        header[TAG] = self.tag;
        header[PAYLOAD_LEN].copy_from_slice(&self.payload_len.to_le_bytes());
        header
    }

    /// Parse the header at the front of `bytes`.
    ///
    /// Fails with [`FrameError::Truncated`] if fewer than
    /// [`HEADER_SIZE`] bytes are present. The tag is not validated.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let Some(header) = bytes.first_chunk::<HEADER_SIZE>() else {
            return Err(FrameError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        };

        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&header[TIMESTAMP]);
        let mut payload_len = [0u8; 4];
        payload_len.copy_from_slice(&header[PAYLOAD_LEN]);

        Ok(Self {
            timestamp: u64::from_le_bytes(timestamp),
            tag: header[TAG],
            payload_len: u32::from_le_bytes(payload_len),
        })
    }

    /// Rejects payload lengths above `max`. A length this large means
    /// the stream can no longer be trusted.
    pub fn check_payload_len(&self, max: usize) -> Result<(), FrameError> {
        if self.payload_len() > max {
            return Err(FrameError::Oversized {
                size: self.payload_len(),
                max,
            });
        }
        Ok(())
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_tag(self.tag)
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len as usize
    }

    /// Header plus payload.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len()
    }
}
