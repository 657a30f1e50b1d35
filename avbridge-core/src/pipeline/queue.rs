//! Bounded per-lane frame queue.
//!
//! Producers never wait: when the queue is full the lane's
//! [`DropPolicy`] decides which frame is lost, and the loss is counted.
//! The lock is held only for the push or pop itself.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::frame::{MediaFrame, MediaKind};

/// What to give up when a lane queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest queued frame to make room. Keeps latency low.
    DropOldest,
    /// Reject the incoming frame. Keeps already-queued frames intact.
    DropNewest,
}

impl DropPolicy {
    /// Audio favours freshness; video keeps what it already has, since
    /// later frames may depend on earlier ones.
    pub const fn default_for(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => DropPolicy::DropOldest,
            MediaKind::Video => DropPolicy::DropNewest,
        }
    }
}

/// Result of [`LaneQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued, after evicting the oldest frame.
    DroppedOldest,
    /// Not queued; the queue was full.
    Rejected,
}

impl PushOutcome {
    pub fn dropped(self) -> bool {
        !matches!(self, PushOutcome::Queued)
    }
}

#[derive(Debug)]
pub struct LaneQueue {
    frames: Mutex<VecDeque<MediaFrame>>,
    capacity: usize,
    policy: DropPolicy,
    dropped: AtomicU64,
}

impl LaneQueue {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize, policy: DropPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, frame: MediaFrame) -> PushOutcome {
        let mut frames = self.frames.lock();
        if frames.len() < self.capacity {
            frames.push_back(frame);
            return PushOutcome::Queued;
        }

        self.dropped.fetch_add(1, Ordering::Relaxed);
        match self.policy {
            DropPolicy::DropOldest => {
                frames.pop_front();
                frames.push_back(frame);
                PushOutcome::DroppedOldest
            }
            DropPolicy::DropNewest => PushOutcome::Rejected,
        }
    }

    pub fn pop(&self) -> Option<MediaFrame> {
        self.frames.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> DropPolicy {
        self.policy
    }

    /// Frames lost to overflow since creation. Never decreases.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard everything queued. Returns how many frames were removed.
    pub fn clear(&self) -> usize {
        let mut frames = self.frames.lock();
        let n = frames.len();
        frames.clear();
        n
    }
}
