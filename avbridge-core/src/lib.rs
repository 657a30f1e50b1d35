//! # avbridge-core
//!
//! Media redirection transport: moves live audio and video between local
//! capture/render devices and a remote desktop session over one TCP
//! stream.
//!
//! This crate contains:
//! - **Framing**: `MediaFrame`, `FrameHeader` and the `WireCodec` for
//!   framed TCP I/O via `tokio_util`
//! - **Network**: `TransportChannel`, a single-peer TCP channel with
//!   listen and connect modes
//! - **Pipeline**: bounded per-lane queues with drop policies, and the
//!   tasks that move frames between devices and the channel
//! - **Session**: `RedirectionSession`, the lifecycle state machine with
//!   bounded reconnect
//! - **State**: transition-checked `SessionState` and `ConnectionState`
//! - **Device**: traits for capture, render and codec collaborators
//! - **Error**: `RedirectError`, typed with a host-facing `ErrorKind`

pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod frame;
pub mod header;
pub mod network;
pub mod pipeline;
pub mod registration;
pub mod session;
pub mod state;
pub mod task;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{DEFAULT_MAX_PAYLOAD, Decoded, WireCodec};
pub use config::{DEFAULT_PORT, LaneConfig, ReconnectPolicy, SessionConfig};
pub use device::{
    CaptureDevice, DeviceSlot, FrameCodec, LaneDevices, MediaBackend, MediaDevices,
    PassthroughCodec, RenderSink,
};
pub use error::{CodecError, DeviceError, ErrorKind, FrameError, RedirectError};
pub use event::{ErrorEvent, SessionEvent, SessionObserver, SessionWarning};
pub use frame::{MediaFrame, MediaKind};
pub use header::{FrameHeader, HEADER_SIZE};
pub use network::{
    ChannelConfig, ChannelSender, ChannelState, Endpoint, Inbound, TransportChannel,
    TransportEvent,
};
pub use pipeline::{
    CaptureSink, DropPolicy, LaneIo, LaneQueue, LaneStats, Pipeline, PushOutcome,
};
pub use registration::{Capabilities, Registration};
pub use session::RedirectionSession;
pub use state::{
    ConnectionState, ConnectionTracker, ConnectionTransition, FailureReason,
    LifecycleTransition, SessionState,
};
pub use task::TaskSet;
