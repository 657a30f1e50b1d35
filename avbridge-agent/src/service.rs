//! Agent service core logic.
//!
//! Runs one redirection session with synthetic devices until stopped or
//! until the session gives up reconnecting.

use std::sync::Arc;

use avbridge_core::{MediaKind, RedirectionSession, SessionEvent, SessionObserver, SessionWarning};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::devices::SyntheticBackend;

// ── LogObserver ──────────────────────────────────────────────────

/// Writes every session event to the log.
#[derive(Debug, Default)]
pub struct LogObserver;

impl SessionObserver for LogObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Registered(reg) => {
                info!(
                    id = %reg.identifier,
                    version = %reg.version,
                    platform = %reg.platform,
                    capabilities = ?reg.capabilities.host_names(),
                    "registered"
                );
            }
            SessionEvent::LifecycleChanged(t) => {
                info!("session {} → {}", t.previous, t.current);
            }
            SessionEvent::ConnectionChanged(t) => {
                info!("connection {} → {}", t.previous, t.current);
            }
            SessionEvent::ReconnectScheduled { attempt, delay } => {
                info!(attempt, "reconnecting in {delay:?}");
            }
            SessionEvent::Warning(SessionWarning::FrameSkipped { tag, payload_len }) => {
                warn!(tag, payload_len, "peer sent a frame of unknown kind");
            }
            SessionEvent::Warning(SessionWarning::PeerRejected(peer)) => {
                warn!(%peer, "turned away extra peer");
            }
            SessionEvent::Error(e) if e.terminal => error!(kind = %e.kind, "{}", e.message),
            SessionEvent::Error(e) => warn!(kind = %e.kind, "{}", e.message),
        }
    }
}

// ── AgentService ─────────────────────────────────────────────────

pub struct AgentService {
    config: AgentConfig,
    stop: CancellationToken,
}

impl AgentService {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            stop: CancellationToken::new(),
        }
    }

    /// Handle that stops [`run`](Self::run) from another task.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Run until stopped.
    ///
    /// 1. Acquires the synthetic devices and announces the registration.
    /// 2. Opens the transport (listen or connect).
    /// 3. Supervises the link, reconnecting on failure.
    /// 4. Shuts the session down when stopped or faulted.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let session_config = self.config.to_session_config()?;
        let backend = Arc::new(SyntheticBackend::new(self.config.media.clone()));
        let observer = Arc::new(LogObserver);

        let mut session = RedirectionSession::new(session_config, backend);
        session.set_observer(&observer);
        session.initialize()?;

        let activated = tokio::select! {
            r = session.activate() => Some(r),
            _ = self.stop.cancelled() => None,
        };
        let result = match activated {
            Some(Ok(())) => session.supervise(self.stop.clone()).await,
            Some(Err(e)) => Err(e),
            None => Ok(()),
        };

        for kind in MediaKind::ALL {
            if let Some(stats) = session.lane_stats(kind) {
                info!(
                    %kind,
                    sent = stats.sent,
                    rendered = stats.rendered,
                    dropped = stats.dropped(),
                    codec_failures = stats.codec_failures,
                    "lane totals"
                );
            }
        }
        session.shutdown().await;
        info!("agent stopped");
        result.map_err(Into::into)
    }
}

// ── Tests ────────────────────────────────────────────────────────
