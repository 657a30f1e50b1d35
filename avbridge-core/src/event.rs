//! What the session tells its host.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{ErrorKind, RedirectError};
use crate::registration::Registration;
use crate::state::{ConnectionTransition, LifecycleTransition};

/// Non-fatal conditions worth surfacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionWarning {
    /// An inbound frame had an unknown kind tag and was skipped.
    FrameSkipped { tag: u8, payload_len: usize },
    /// A second peer tried to connect and was turned away.
    PeerRejected(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
    /// The session is faulted and will not recover on its own.
    pub terminal: bool,
}

impl ErrorEvent {
    /// Build from an error that has a host-facing kind.
    pub fn from_error(error: &RedirectError, terminal: bool) -> Option<Self> {
        error.kind().map(|kind| Self {
            kind,
            message: error.to_string(),
            terminal,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Registered(Registration),
    LifecycleChanged(LifecycleTransition),
    ConnectionChanged(ConnectionTransition),
    ReconnectScheduled { attempt: u32, delay: Duration },
    Warning(SessionWarning),
    Error(ErrorEvent),
}

/// Receives session events. Called on the session's task, so
/// implementations should return quickly.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}
