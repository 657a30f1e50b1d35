use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::queue::{LaneQueue, PushOutcome};
use crate::codec::WireCodec;
use crate::config::LaneConfig;
use crate::device::{FrameCodec, RenderSink};
use crate::frame::{MediaFrame, MediaKind};
use crate::network::ChannelSender;

/// One direction-pair of queues for a single media kind.
#[derive(Debug)]
pub(crate) struct Lane {
    kind: MediaKind,
    open: AtomicBool,
    pub(crate) outgoing: LaneQueue,
    outgoing_ready: Notify,
    pub(crate) incoming: LaneQueue,
    incoming_ready: Notify,
    codec_failures: AtomicU64,
    sent: AtomicU64,
    received: AtomicU64,
    rendered: AtomicU64,
}

impl Lane {
    pub(crate) fn new(kind: MediaKind, config: &LaneConfig) -> Self {
        Self {
            kind,
            open: AtomicBool::new(true),
            outgoing: LaneQueue::new(config.capacity, config.policy),
            outgoing_ready: Notify::new(),
            incoming: LaneQueue::new(config.capacity, config.policy),
            incoming_ready: Notify::new(),
            codec_failures: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            rendered: AtomicU64::new(0),
        }
    }

    pub(crate) fn kind(&self) -> MediaKind {
        self.kind
    }

    pub(crate) fn push_outgoing(&self, frame: MediaFrame) -> PushOutcome {
        let outcome = self.outgoing.push(frame);
        if outcome != PushOutcome::Rejected {
            self.outgoing_ready.notify_one();
        }
        outcome
    }

    pub(crate) fn push_incoming(&self, frame: MediaFrame) -> PushOutcome {
        let outcome = self.incoming.push(frame);
        if outcome != PushOutcome::Rejected {
            self.incoming_ready.notify_one();
        }
        outcome
    }

    /// Stop accepting capture input and discard everything queued.
    pub(crate) fn close(&self) -> usize {
        self.open.store(false, Ordering::Release);
        self.outgoing.clear() + self.incoming.clear()
    }

    pub(crate) fn count_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn count_codec_failure(&self) {
        self.codec_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> LaneStats {
        LaneStats {
            kind: self.kind,
            outgoing_len: self.outgoing.len(),
            incoming_len: self.incoming.len(),
            outgoing_dropped: self.outgoing.dropped(),
            incoming_dropped: self.incoming.dropped(),
            codec_failures: self.codec_failures.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            rendered: self.rendered.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters for one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneStats {
    pub kind: MediaKind,
    pub outgoing_len: usize,
    pub incoming_len: usize,
    /// Captured frames lost to overflow. Monotonic.
    pub outgoing_dropped: u64,
    /// Received frames lost to overflow. Monotonic.
    pub incoming_dropped: u64,
    pub codec_failures: u64,
    pub sent: u64,
    /// Frames that arrived from the peer, before any overflow.
    pub received: u64,
    pub rendered: u64,
}

impl LaneStats {
    pub fn dropped(&self) -> u64 {
        self.outgoing_dropped + self.incoming_dropped
    }
}

// ── CaptureSink ──────────────────────────────────────────────────

/// Producer handle given to a [`CaptureDevice`](crate::device::CaptureDevice).
///
/// `push` never blocks and is safe to call from a platform callback
/// thread. There is one sink per lane per activation; once the lane is
/// torn down, pushes are rejected without being counted as drops.
#[derive(Debug)]
pub struct CaptureSink {
    lane: Arc<Lane>,
}

impl CaptureSink {
    pub(crate) fn new(lane: Arc<Lane>) -> Self {
        Self { lane }
    }

    pub fn kind(&self) -> MediaKind {
        self.lane.kind()
    }

    pub fn is_open(&self) -> bool {
        self.lane.open.load(Ordering::Acquire)
    }

    /// Queue a raw captured buffer for sending.
    pub fn push(&self, raw: impl Into<Bytes>, timestamp: u64) -> PushOutcome {
        if !self.is_open() {
            return PushOutcome::Rejected;
        }
        let outcome = self
            .lane
            .push_outgoing(MediaFrame::new(self.lane.kind(), timestamp, raw));
        if outcome.dropped() {
            trace!(kind = %self.lane.kind(), ?outcome, "capture overflow");
        }
        outcome
    }
}

// ── Lane tasks ───────────────────────────────────────────────────

/// Collaborators the lane tasks call into.
#[derive(Clone)]
pub struct LaneIo {
    pub codec: Arc<dyn FrameCodec>,
    pub render: Arc<dyn RenderSink>,
}

/// Wait for the next frame from `queue`, or `None` once cancelled.
async fn next_frame(
    queue: &LaneQueue,
    ready: &Notify,
    token: &CancellationToken,
) -> Option<MediaFrame> {
    loop {
        if let Some(frame) = queue.pop() {
            return Some(frame);
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            _ = ready.notified() => {}
        }
    }
}

/// capture queue → codec encode → framing → transport.
pub(crate) async fn send_loop(
    lane: Arc<Lane>,
    codec: Arc<dyn FrameCodec>,
    sender: ChannelSender,
    wire: WireCodec,
    token: CancellationToken,
) {
    loop {
        // Wait for transport room first so frames stay in the lane
        // queue, where the drop policy applies, while the socket is slow.
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            permit = sender.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let Some(raw) = next_frame(&lane.outgoing, &lane.outgoing_ready, &token).await else {
            break;
        };

        let encoded = match codec.encode(raw.payload().clone()) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(kind = %lane.kind(), ts = raw.timestamp(), "encode failed: {e}");
                lane.count_codec_failure();
                continue;
            }
        };

        let frame = MediaFrame::new(lane.kind(), raw.timestamp(), encoded);
        match wire.encode_frame(&frame) {
            Ok(bytes) => {
                permit.send(bytes);
                lane.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(kind = %lane.kind(), "dropping unsendable frame: {e}");
                lane.count_codec_failure();
            }
        }
    }
}

/// incoming queue → codec decode → render sink.
pub(crate) async fn render_loop(lane: Arc<Lane>, io: LaneIo, token: CancellationToken) {
    while let Some(frame) = next_frame(&lane.incoming, &lane.incoming_ready, &token).await {
        let timestamp = frame.timestamp();
        match io.codec.decode(frame.into_payload()) {
            Ok(raw) => {
                io.render.submit(raw, timestamp);
                lane.rendered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(kind = %lane.kind(), ts = timestamp, "decode failed: {e}");
                lane.count_codec_failure();
            }
        }
    }
}
