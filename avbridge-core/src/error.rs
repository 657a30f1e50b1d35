//! Domain-specific error types for media redirection.
//!
//! All fallible operations return `Result<T, RedirectError>`.
//! No panics on invalid input. Every error is typed and carries an
//! [`ErrorKind`] when it is something the host should be told about.

use std::time::Duration;

use thiserror::Error;

use crate::frame::MediaKind;

// ── ErrorKind ────────────────────────────────────────────────────

/// Host-facing classification of an error.
///
/// Lets the host tell "retry later" (`ConnectionFailed`,
/// `NetworkTimeout`) apart from "feature unavailable"
/// (`DeviceNotFound`, `CodecInitFailed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionFailed,
    DeviceNotFound,
    CodecInitFailed,
    BufferOverflow,
    NetworkTimeout,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed => write!(f, "ConnectionFailed"),
            Self::DeviceNotFound => write!(f, "DeviceNotFound"),
            Self::CodecInitFailed => write!(f, "CodecInitFailed"),
            Self::BufferOverflow => write!(f, "BufferOverflow"),
            Self::NetworkTimeout => write!(f, "NetworkTimeout"),
        }
    }
}

// ── RedirectError ────────────────────────────────────────────────

/// The canonical error type for the redirection transport.
#[derive(Debug, Error)]
pub enum RedirectError {
    // ── Setup Errors ─────────────────────────────────────────────
    /// A capture or render device for `kind` could not be acquired.
    #[error("{kind} device not available")]
    DeviceNotFound {
        kind: MediaKind,
        #[source]
        source: DeviceError,
    },

    /// The codec for `kind` could not be created.
    #[error("failed to initialize {kind} codec: {reason}")]
    CodecInitFailed { kind: MediaKind, reason: String },

    // ── Transport Errors ─────────────────────────────────────────
    /// The remote endpoint could not be reached or the link dropped.
    #[error("failed to connect to remote endpoint: {0}")]
    ConnectionFailed(String),

    /// An open or write exceeded its deadline.
    #[error("network connection timeout after {0:?}")]
    NetworkTimeout(Duration),

    /// The transport write queue is full.
    #[error("buffer overflow: {0}")]
    BufferOverflow(&'static str),

    /// The channel is not open (never opened, closed, or failed).
    #[error("channel closed")]
    ChannelClosed,

    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    // ── Framing Errors ───────────────────────────────────────────
    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Frame(#[from] FrameError),

    // ── Lifecycle Errors ─────────────────────────────────────────
    /// The requested operation is not legal in the current state.
    #[error("invalid state: cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: String,
    },
}

impl RedirectError {
    /// Host-facing classification, if this error is one the status
    /// interface reports.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::DeviceNotFound { .. } => Some(ErrorKind::DeviceNotFound),
            Self::CodecInitFailed { .. } => Some(ErrorKind::CodecInitFailed),
            Self::ConnectionFailed(_) | Self::ChannelClosed | Self::Io(_) => {
                Some(ErrorKind::ConnectionFailed)
            }
            Self::Frame(FrameError::Io(_)) => Some(ErrorKind::ConnectionFailed),
            Self::Frame(_) => None,
            Self::NetworkTimeout(_) => Some(ErrorKind::NetworkTimeout),
            Self::BufferOverflow(_) => Some(ErrorKind::BufferOverflow),
            Self::InvalidState { .. } => None,
        }
    }

    pub(crate) fn invalid_state(action: &'static str, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            action,
            state: state.to_string(),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RedirectError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RedirectError::ChannelClosed
    }
}

// ── FrameError ───────────────────────────────────────────────────

/// Errors raised by the wire framing layer.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The kind tag is not a known media kind. `frame_len` is the full
    /// on-wire size of the offending frame (header plus payload).
    #[error("invalid media kind tag {tag:#04x} in {frame_len} byte frame")]
    InvalidKind { tag: u8, frame_len: usize },

    /// The stream ended before a complete frame was available.
    #[error("truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// The declared payload length is larger than allowed.
    #[error("payload too large: {size} bytes (max {max})")]
    Oversized { size: usize, max: usize },

    /// The underlying stream failed while reading.
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Collaborator errors ──────────────────────────────────────────

/// Failure reported by a capture or render collaborator.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No device of the requested kind exists.
    #[error("no device present")]
    NotFound,

    /// The device exists but is held by another client.
    #[error("device busy: {0}")]
    Busy(String),

    /// The device failed to start or stop.
    #[error("device failure: {0}")]
    Failed(String),
}

/// Failure reported by a [`FrameCodec`](crate::device::FrameCodec)
/// for a single buffer. Never fatal to the session.
#[derive(Debug, Error)]
#[error("codec error: {0}")]
pub struct CodecError(pub String);
