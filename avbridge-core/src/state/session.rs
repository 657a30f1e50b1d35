//! Redirection session lifecycle.

use std::time::Instant;

use crate::error::{ErrorKind, RedirectError};

/// ```text
///  Idle ──► Initializing ──► Active ──► Deactivating ──► Idle
///   │            │             │              │            │
///   └────────────┴─────────────┴──► Faulted ◄─┴────────────┘
/// ```
///
/// `Idle` after a deactivation still holds the acquired devices, so
/// `activate` is legal from both `Initializing` and `Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    /// Devices acquired, transport not yet opened.
    Initializing,
    Active {
        since: Instant,
    },
    Deactivating,
    /// Terminal. Carries the error class that caused it.
    Faulted(ErrorKind),
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Active { .. } => write!(f, "Active"),
            Self::Deactivating => write!(f, "Deactivating"),
            Self::Faulted(kind) => write!(f, "Faulted({kind})"),
        }
    }
}

/// A lifecycle change, reported to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleTransition {
    pub previous: SessionState,
    pub current: SessionState,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted(_))
    }

    /// How long the session has been active. `None` in any other state.
    pub fn active_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Active { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Idle`.
    pub fn begin_initialize(&mut self) -> Result<LifecycleTransition, RedirectError> {
        match self {
            Self::Idle => Ok(self.replace(Self::Initializing)),
            _ => Err(RedirectError::invalid_state("initialize", &*self)),
        }
    }

    /// Valid from: `Initializing`, `Idle`.
    pub fn activate(&mut self) -> Result<LifecycleTransition, RedirectError> {
        match self {
            Self::Initializing | Self::Idle => Ok(self.replace(Self::Active {
                since: Instant::now(),
            })),
            _ => Err(RedirectError::invalid_state("activate", &*self)),
        }
    }

    /// Valid from: `Active`.
    pub fn begin_deactivate(&mut self) -> Result<LifecycleTransition, RedirectError> {
        match self {
            Self::Active { .. } => Ok(self.replace(Self::Deactivating)),
            _ => Err(RedirectError::invalid_state("deactivate", &*self)),
        }
    }

    /// Valid from: `Deactivating`.
    pub fn finish_deactivate(&mut self) -> Result<LifecycleTransition, RedirectError> {
        match self {
            Self::Deactivating => Ok(self.replace(Self::Idle)),
            _ => Err(RedirectError::invalid_state("finish deactivation", &*self)),
        }
    }

    /// Move to `Faulted` from anywhere. Returns `None` if already faulted.
    pub fn fault(&mut self, kind: ErrorKind) -> Option<LifecycleTransition> {
        if self.is_faulted() {
            return None;
        }
        Some(self.replace(Self::Faulted(kind)))
    }

    fn replace(&mut self, next: Self) -> LifecycleTransition {
        let previous = std::mem::replace(self, next);
        LifecycleTransition {
            previous,
            current: self.clone(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
