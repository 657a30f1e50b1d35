//! `tokio_util` codec for the media wire format.
//!
//! The decoder is pull-based: it returns `Ok(None)` until a whole frame
//! is buffered, so it works for any split of the byte stream. Frames
//! with an unknown kind tag are skipped without buffering their payload
//! and reported as [`Decoded::Skipped`].

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;
use crate::frame::MediaFrame;
use crate::header::{FrameHeader, HEADER_SIZE};

/// Default upper bound on a single payload (4 MiB, room for one
/// uncompressed 1080p NV12 frame with headroom).
pub const DEFAULT_MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// One item produced by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(MediaFrame),
    /// A frame whose tag is unknown. Its `payload_len` bytes are
    /// discarded and parsing resumes after them.
    Skipped { tag: u8, payload_len: usize },
}

#[derive(Debug, Clone)]
pub struct WireCodec {
    max_payload: usize,
    // Payload bytes of a skipped frame not yet seen.
    skip_remaining: usize,
}

impl WireCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            skip_remaining: 0,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encode a single frame into a fresh buffer.
    pub fn encode_frame(&self, frame: &MediaFrame) -> Result<Bytes, FrameError> {
        let mut dst = BytesMut::with_capacity(frame.wire_len());
        self.write_frame(frame, &mut dst)?;
        Ok(dst.freeze())
    }

    fn write_frame(&self, frame: &MediaFrame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = frame.payload_len();
        if len > self.max_payload || len > u32::MAX as usize {
            return Err(FrameError::Oversized {
                size: len,
                max: self.max_payload,
            });
        }

        let header = FrameHeader::new(frame.kind(), frame.timestamp(), len as u32);
        dst.reserve(frame.wire_len());
        dst.extend_from_slice(&header.to_bytes());
        dst.extend_from_slice(frame.payload());
        Ok(())
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for WireCodec {
    type Item = Decoded;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.skip_remaining > 0 {
            let n = self.skip_remaining.min(src.len());
            src.advance(n);
            self.skip_remaining -= n;
            if self.skip_remaining > 0 {
                return Ok(None);
            }
        }

        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        let header = FrameHeader::parse(src)?;
        header.check_payload_len(self.max_payload)?;

        let Some(kind) = header.kind() else {
            // Length is within bounds, so trust it and drop the frame.
            src.advance(HEADER_SIZE);
            let available = header.payload_len().min(src.len());
            src.advance(available);
            self.skip_remaining = header.payload_len() - available;
            return Ok(Some(Decoded::Skipped {
                tag: header.tag(),
                payload_len: header.payload_len(),
            }));
        };

        if src.len() < header.frame_len() {
            src.reserve(header.frame_len() - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(header.payload_len()).freeze();
        Ok(Some(Decoded::Frame(MediaFrame::new(
            kind,
            header.timestamp(),
            payload,
        ))))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(buf)? {
            return Ok(Some(item));
        }
        if buf.is_empty() && self.skip_remaining == 0 {
            return Ok(None);
        }

        let needed = if self.skip_remaining > 0 {
            self.skip_remaining
        } else {
            FrameHeader::parse(buf).map_or(HEADER_SIZE, |h| h.frame_len())
        };
        Err(FrameError::Truncated {
            needed,
            available: buf.len(),
        })
    }
}

impl Encoder<MediaFrame> for WireCodec {
    type Error = FrameError;

    fn encode(&mut self, item: MediaFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.write_frame(&item, dst)
    }
}
