//! Session tuning knobs.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::frame::MediaKind;
use crate::network::{ChannelConfig, Endpoint};
use crate::pipeline::DropPolicy;
use crate::registration::Registration;

/// Port the helper uses when none is configured.
pub const DEFAULT_PORT: u16 = 9001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneConfig {
    /// Frames held per direction before the drop policy applies.
    pub capacity: usize,
    pub policy: DropPolicy,
}

impl LaneConfig {
    pub fn for_kind(kind: MediaKind) -> Self {
        let capacity = match kind {
            // ~80 ms of 20 ms audio packets; stale audio is worse than none.
            MediaKind::Audio => 4,
            // Half a second at 30 fps to absorb keyframe bursts.
            MediaKind::Video => 16,
        };
        Self {
            capacity,
            policy: DropPolicy::default_for(kind),
        }
    }
}

/// Bounded exponential backoff for reconnecting after a transport
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How long a link must stay up, without the peer sending anything,
    /// before it counts as healthy and the retry budget is refilled.
    pub stable_after: Duration,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None`
    /// once the attempts are used up.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(
            self.initial_backoff
                .saturating_mul(factor)
                .min(self.max_backoff),
        )
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            stable_after: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: Endpoint,
    pub channel: ChannelConfig,
    pub audio: LaneConfig,
    pub video: LaneConfig,
    pub reconnect: ReconnectPolicy,
    pub registration: Registration,
}

impl SessionConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            channel: ChannelConfig::default(),
            audio: LaneConfig::for_kind(MediaKind::Audio),
            video: LaneConfig::for_kind(MediaKind::Video),
            reconnect: ReconnectPolicy::default(),
            registration: Registration::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(Endpoint::Connect(SocketAddr::from((
            Ipv4Addr::LOCALHOST,
            DEFAULT_PORT,
        ))))
    }
}
