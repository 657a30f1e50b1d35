//! Authoritative connection state, owned by the session.
//!
//! [`ConnectionTracker`] is the only thing that mutates a
//! [`ConnectionState`]. Each transition method returns the
//! [`ConnectionTransition`] it performed so the caller can publish it;
//! nothing is emitted as a side effect of assignment.

use std::net::SocketAddr;

use crate::error::{ErrorKind, RedirectError};

// ── FailureReason ────────────────────────────────────────────────

/// Why a connection left the healthy path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Connect, accept, read or write failed at the socket layer.
    Io(String),
    /// Open or write exceeded its deadline.
    Timeout,
    /// The peer closed the stream while we still wanted it.
    PeerClosed,
    /// The inbound byte stream could not be framed any more.
    Framing(String),
}

impl FailureReason {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout => ErrorKind::NetworkTimeout,
            Self::Io(_) | Self::PeerClosed | Self::Framing(_) => ErrorKind::ConnectionFailed,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Timeout => write!(f, "timed out"),
            Self::PeerClosed => write!(f, "peer closed the connection"),
            Self::Framing(e) => write!(f, "unrecoverable framing error: {e}"),
        }
    }
}

// ── ConnectionState ──────────────────────────────────────────────

/// ```text
///  Disconnected ──► Connecting ──► Connected
///       ▲  ▲            │              │
///       │  │            ▼              ▼
///       │  └──────── Failed ◄──────────┘
///       └──────────────────────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected { peer: SocketAddr },
    Failed(FailureReason),
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { peer } => write!(f, "Connected({peer})"),
            Self::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// A state change, reported to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTransition {
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

// ── ConnectionTracker ────────────────────────────────────────────

/// Holds the current state and the one before it, for diagnostics.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    current: ConnectionState,
    previous: Option<ConnectionState>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &ConnectionState {
        &self.current
    }

    pub fn previous(&self) -> Option<&ConnectionState> {
        self.previous.as_ref()
    }

    /// Valid from: `Disconnected`, `Failed`.
    pub fn begin_connect(&mut self) -> Result<ConnectionTransition, RedirectError> {
        match self.current {
            ConnectionState::Disconnected | ConnectionState::Failed(_) => {
                Ok(self.replace(ConnectionState::Connecting))
            }
            _ => Err(RedirectError::invalid_state("connect", &self.current)),
        }
    }

    /// Valid from: `Connecting`.
    pub fn establish(&mut self, peer: SocketAddr) -> Result<ConnectionTransition, RedirectError> {
        match self.current {
            ConnectionState::Connecting => Ok(self.replace(ConnectionState::Connected { peer })),
            _ => Err(RedirectError::invalid_state("establish", &self.current)),
        }
    }

    /// Valid from: `Connecting`, `Connected`.
    pub fn fail(&mut self, reason: FailureReason) -> Result<ConnectionTransition, RedirectError> {
        match self.current {
            ConnectionState::Connecting | ConnectionState::Connected { .. } => {
                Ok(self.replace(ConnectionState::Failed(reason)))
            }
            _ => Err(RedirectError::invalid_state("fail", &self.current)),
        }
    }

    /// Valid from anywhere. Returns `None` if already disconnected.
    pub fn disconnect(&mut self) -> Option<ConnectionTransition> {
        if self.current == ConnectionState::Disconnected {
            return None;
        }
        Some(self.replace(ConnectionState::Disconnected))
    }

    fn replace(&mut self, next: ConnectionState) -> ConnectionTransition {
        let previous = std::mem::replace(&mut self.current, next);
        self.previous = Some(previous.clone());
        ConnectionTransition {
            previous,
            current: self.current.clone(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
