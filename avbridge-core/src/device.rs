//! Seams to the platform's capture, render and codec facilities.
//!
//! The session never talks to hardware directly. A [`MediaBackend`]
//! hands out one capture device, one render sink and one codec per
//! media kind, and [`MediaDevices::acquire`] takes all six or none.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::error::{CodecError, DeviceError, RedirectError};
use crate::frame::MediaKind;
use crate::pipeline::{CaptureSink, LaneIo};

/// A source of raw media, typically driven by a platform callback.
pub trait CaptureDevice: Send {
    /// Start delivering buffers into `sink`. The device keeps the sink
    /// until [`stop_capture`](Self::stop_capture).
    fn start_capture(&mut self, sink: CaptureSink) -> Result<(), DeviceError>;

    /// Stop delivering and drop the sink. Must be safe to call when
    /// not capturing.
    fn stop_capture(&mut self);
}

/// Where decoded remote media ends up.
pub trait RenderSink: Send + Sync {
    fn submit(&self, raw: Bytes, timestamp: u64);
}

/// Converts between raw and encoded payloads for one media kind.
///
/// Errors apply to a single buffer only; the frame is dropped and
/// counted.
pub trait FrameCodec: Send + Sync {
    fn encode(&self, raw: Bytes) -> Result<Bytes, CodecError>;
    fn decode(&self, encoded: Bytes) -> Result<Bytes, CodecError>;
}

/// Factory for the per-kind collaborators.
pub trait MediaBackend: Send + Sync {
    fn capture(&self, kind: MediaKind) -> Result<Box<dyn CaptureDevice>, DeviceError>;
    fn render(&self, kind: MediaKind) -> Result<Arc<dyn RenderSink>, DeviceError>;
    fn codec(&self, kind: MediaKind) -> Result<Arc<dyn FrameCodec>, CodecError>;
}

/// Codec for media that is already encoded at capture time.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCodec;

impl FrameCodec for PassthroughCodec {
    fn encode(&self, raw: Bytes) -> Result<Bytes, CodecError> {
        Ok(raw)
    }

    fn decode(&self, encoded: Bytes) -> Result<Bytes, CodecError> {
        Ok(encoded)
    }
}

// ── Acquired devices ─────────────────────────────────────────────

pub struct LaneDevices {
    pub capture: Box<dyn CaptureDevice>,
    pub render: Arc<dyn RenderSink>,
    pub codec: Arc<dyn FrameCodec>,
}

impl LaneDevices {
    fn acquire(backend: &dyn MediaBackend, kind: MediaKind) -> Result<Self, RedirectError> {
        let capture = backend
            .capture(kind)
            .map_err(|source| RedirectError::DeviceNotFound { kind, source })?;
        let render = backend
            .render(kind)
            .map_err(|source| RedirectError::DeviceNotFound { kind, source })?;
        let codec = backend
            .codec(kind)
            .map_err(|e| RedirectError::CodecInitFailed {
                kind,
                reason: e.0,
            })?;
        Ok(Self {
            capture,
            render,
            codec,
        })
    }

    /// The parts of this lane the pipeline tasks need.
    pub fn io(&self) -> LaneIo {
        LaneIo {
            codec: Arc::clone(&self.codec),
            render: Arc::clone(&self.render),
        }
    }
}

/// Collaborators for both lanes.
pub struct MediaDevices {
    pub audio: LaneDevices,
    pub video: LaneDevices,
}

impl MediaDevices {
    /// Acquire everything for both lanes. On error, whatever was
    /// already acquired is dropped before returning.
    pub fn acquire(backend: &dyn MediaBackend) -> Result<Self, RedirectError> {
        let audio = LaneDevices::acquire(backend, MediaKind::Audio)?;
        let video = LaneDevices::acquire(backend, MediaKind::Video)?;
        debug!("media devices acquired");
        Ok(Self { audio, video })
    }

    pub fn lane_mut(&mut self, kind: MediaKind) -> &mut LaneDevices {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    /// Stop capture on both lanes.
    pub fn stop_capture(&mut self) {
        self.audio.capture.stop_capture();
        self.video.capture.stop_capture();
    }
}

/// Whether the session currently holds its devices.
#[derive(Default)]
pub enum DeviceSlot {
    #[default]
    Uninitialized,
    Ready(MediaDevices),
    /// Released for good. The session cannot be reused.
    Closed,
}

impl DeviceSlot {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn devices_mut(&mut self) -> Option<&mut MediaDevices> {
        match self {
            Self::Ready(devices) => Some(devices),
            _ => None,
        }
    }

    /// Release the devices, stopping capture first.
    pub fn close(&mut self) {
        if let Self::Ready(devices) = self {
            devices.stop_capture();
        }
        *self = Self::Closed;
    }
}

impl std::fmt::Display for DeviceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Ready(_) => write!(f, "Ready"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}
