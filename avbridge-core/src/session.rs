//! The redirection session: device ownership, lifecycle and recovery.
//!
//! A [`RedirectionSession`] is driven from a single task. It owns the
//! authoritative [`SessionState`] and [`ConnectionState`], and it is the
//! only place either changes. Every change is reported to the observer
//! as a [`SessionEvent`].
//!
//! Each activation builds a fresh [`TransportChannel`] and [`Pipeline`];
//! deactivation tears both down completely before anything new is
//! opened, so two connections never overlap.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::device::{DeviceSlot, MediaBackend, MediaDevices};
use crate::error::{ErrorKind, RedirectError};
use crate::event::{ErrorEvent, SessionEvent, SessionObserver, SessionWarning};
use crate::frame::MediaKind;
use crate::network::{ChannelState, TransportChannel, TransportEvent};
use crate::pipeline::{LaneStats, Pipeline};
use crate::registration::Registration;
use crate::state::{ConnectionState, ConnectionTracker, FailureReason, SessionState};

/// Everything that exists only while a connection is up.
struct ActiveLink {
    channel: TransportChannel,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    pipeline: Pipeline,
    established: Instant,
}

impl ActiveLink {
    /// Whether the peer has shown it is really there: it sent us a frame,
    /// or the link stayed up for `stable_after`.
    fn proved_healthy(&self, stable_after: Duration) -> bool {
        let received: u64 = MediaKind::ALL
            .into_iter()
            .map(|kind| self.pipeline.stats(kind).received)
            .sum();
        received > 0 || self.established.elapsed() >= stable_after
    }
}

pub struct RedirectionSession {
    config: SessionConfig,
    backend: Arc<dyn MediaBackend>,
    state: SessionState,
    connection: ConnectionTracker,
    devices: DeviceSlot,
    observer: Option<Weak<dyn SessionObserver>>,
    link: Option<ActiveLink>,
    registered: bool,
    /// Reconnect attempts since the last healthy link. Survives
    /// successful reconnects so a flapping peer still runs out of retries.
    reconnect_attempts: u32,
}

impl RedirectionSession {
    pub fn new(config: SessionConfig, backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            config,
            backend,
            state: SessionState::default(),
            connection: ConnectionTracker::new(),
            devices: DeviceSlot::default(),
            observer: None,
            link: None,
            registered: false,
            reconnect_attempts: 0,
        }
    }

    /// Register the host observer. Only a weak reference is kept; events
    /// stop once the caller drops its `Arc`.
    pub fn set_observer<O: SessionObserver + 'static>(&mut self, observer: &Arc<O>) {
        let weak: Weak<dyn SessionObserver> = Arc::downgrade(observer) as Weak<dyn SessionObserver>;
        self.observer = Some(weak);
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn connection_state(&self) -> &ConnectionState {
        self.connection.current()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registration(&self) -> &Registration {
        &self.config.registration
    }

    /// Counters for the current activation. `None` when not connected.
    pub fn lane_stats(&self, kind: MediaKind) -> Option<LaneStats> {
        self.link.as_ref().map(|link| link.pipeline.stats(kind))
    }

    /// State of the underlying channel, for diagnostics.
    pub fn channel_state(&self) -> ChannelState {
        self.link
            .as_ref()
            .map_or(ChannelState::Closed, |link| link.channel.state())
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Acquire capture, render and codec for both lanes.
    ///
    /// All or nothing: on failure nothing is held and the session is
    /// `Faulted`. The registration descriptor is announced on the first
    /// success.
    pub fn initialize(&mut self) -> Result<(), RedirectError> {
        if matches!(self.devices, DeviceSlot::Closed) {
            return Err(RedirectError::invalid_state("initialize", "shut down"));
        }
        let t = self.state.begin_initialize()?;
        self.emit(SessionEvent::LifecycleChanged(t));

        match MediaDevices::acquire(self.backend.as_ref()) {
            Ok(devices) => {
                self.devices = DeviceSlot::Ready(devices);
                info!(id = %self.config.registration.identifier, "session initialized");
                if !self.registered {
                    self.registered = true;
                    self.emit(SessionEvent::Registered(self.config.registration.clone()));
                }
                Ok(())
            }
            Err(e) => {
                error!("initialization failed: {e}");
                self.fault(&e);
                Err(e)
            }
        }
    }

    /// Open the transport, start both lanes and capture, then go
    /// `Active`.
    ///
    /// A no-op when already active. On failure nothing is left running,
    /// the lifecycle state is unchanged and the connection state records
    /// why.
    pub async fn activate(&mut self) -> Result<(), RedirectError> {
        if self.state.is_active() {
            return Ok(());
        }
        if !matches!(self.state, SessionState::Initializing | SessionState::Idle) {
            return Err(RedirectError::invalid_state("activate", &self.state));
        }
        if !self.devices.is_ready() {
            return Err(RedirectError::invalid_state(
                "activate",
                format!("{} (devices {})", self.state, self.devices),
            ));
        }

        let t = self.connection.begin_connect()?;
        self.emit(SessionEvent::ConnectionChanged(t));
        info!(endpoint = %self.config.endpoint, "activating");

        match self.open_link().await {
            Ok((link, peer)) => {
                let t = self.connection.establish(peer)?;
                self.emit(SessionEvent::ConnectionChanged(t));
                self.link = Some(link);
                let t = self.state.activate()?;
                self.emit(SessionEvent::LifecycleChanged(t));
                info!(%peer, "session active");
                Ok(())
            }
            Err(e) => {
                let t = match failure_reason(&e) {
                    Some(reason) => self.connection.fail(reason).ok(),
                    None => self.connection.disconnect(),
                };
                if let Some(t) = t {
                    self.emit(SessionEvent::ConnectionChanged(t));
                }
                warn!("activation failed: {e}");
                self.emit_error(&e, false);
                Err(e)
            }
        }
    }

    /// Stop capture and lanes, discard queued frames and close the
    /// transport. A no-op unless active.
    pub async fn deactivate(&mut self) -> Result<(), RedirectError> {
        if !self.state.is_active() {
            return Ok(());
        }
        let t = self.state.begin_deactivate()?;
        self.emit(SessionEvent::LifecycleChanged(t));

        self.teardown_link().await;
        if let Some(t) = self.connection.disconnect() {
            self.emit(SessionEvent::ConnectionChanged(t));
        }

        let t = self.state.finish_deactivate()?;
        self.emit(SessionEvent::LifecycleChanged(t));
        info!("session deactivated");
        Ok(())
    }

    /// Deactivate and release every device. The session cannot be
    /// initialized again afterwards.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.deactivate().await {
            debug!("deactivate during shutdown: {e}");
        }
        self.teardown_link().await;
        if let Some(t) = self.connection.disconnect() {
            self.emit(SessionEvent::ConnectionChanged(t));
        }
        self.devices.close();
        info!("session shut down");
    }

    /// Handle transport events until the session stops being active or
    /// `shutdown` is cancelled.
    ///
    /// A transport failure deactivates the session and reconnects with
    /// backoff. The retry budget is only refilled by a link that proved
    /// healthy, so a peer that accepts and immediately drops still ends in
    /// `Faulted`. Returns the terminal error once retries are exhausted.
    pub async fn supervise(&mut self, shutdown: CancellationToken) -> Result<(), RedirectError> {
        loop {
            let Some(link) = self.link.as_mut() else {
                return Ok(());
            };
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                event = link.events.recv() => event,
            };

            match event {
                Some(TransportEvent::Failed(reason)) => self.recover(reason, &shutdown).await?,
                Some(TransportEvent::FrameSkipped { tag, payload_len }) => {
                    self.emit(SessionEvent::Warning(SessionWarning::FrameSkipped {
                        tag,
                        payload_len,
                    }));
                }
                Some(TransportEvent::PeerRejected(peer)) => {
                    self.emit(SessionEvent::Warning(SessionWarning::PeerRejected(peer)));
                }
                None => return Ok(()),
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────

    async fn recover(
        &mut self,
        reason: FailureReason,
        shutdown: &CancellationToken,
    ) -> Result<(), RedirectError> {
        warn!(%reason, "transport failed");
        if let Ok(t) = self.connection.fail(reason.clone()) {
            self.emit(SessionEvent::ConnectionChanged(t));
        }
        let cause = match reason {
            FailureReason::Timeout => RedirectError::NetworkTimeout(self.config.channel.write_timeout),
            other => RedirectError::ConnectionFailed(other.to_string()),
        };
        self.emit_error(&cause, false);

        let policy = self.config.reconnect;
        if self
            .link
            .as_ref()
            .is_some_and(|link| link.proved_healthy(policy.stable_after))
        {
            self.reconnect_attempts = 0;
        }
        self.deactivate().await?;

        loop {
            let attempt = self.reconnect_attempts + 1;
            let Some(delay) = policy.backoff(attempt) else {
                break;
            };
            self.reconnect_attempts = attempt;
            info!(attempt, ?delay, "scheduling reconnect");
            self.emit(SessionEvent::ReconnectScheduled { attempt, delay });
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.activate().await {
                Ok(()) => {
                    info!(attempt, "reconnected");
                    return Ok(());
                }
                Err(e) => warn!(attempt, "reconnect failed: {e}"),
            }
        }

        let e = RedirectError::ConnectionFailed(format!(
            "gave up after {} reconnect attempts",
            policy.max_retries
        ));
        error!("{e}");
        self.fault(&e);
        Err(e)
    }

    /// Build the channel, pipeline and capture for one activation.
    /// Cleans up after itself on failure.
    async fn open_link(&mut self) -> Result<(ActiveLink, SocketAddr), RedirectError> {
        let grace = self.config.channel.teardown_timeout;
        let (mut channel, events) = TransportChannel::new(self.config.channel.clone());
        let inbound = channel.open(self.config.endpoint).await?;

        let ChannelState::Open { peer } = channel.state() else {
            let state = channel.state();
            channel.close().await;
            return Err(RedirectError::ConnectionFailed(format!(
                "channel {state} right after open"
            )));
        };
        let sender = match channel.sender() {
            Ok(sender) => sender,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };

        let Some(devices) = self.devices.devices_mut() else {
            channel.close().await;
            return Err(RedirectError::invalid_state("activate", "devices released"));
        };

        let mut pipeline = Pipeline::new(&self.config.audio, &self.config.video);
        if let Err(e) = pipeline.start(
            sender,
            inbound,
            self.config.channel.max_payload,
            devices.audio.io(),
            devices.video.io(),
        ) {
            channel.close().await;
            return Err(e);
        }

        for kind in MediaKind::ALL {
            let sink = pipeline.capture_sink(kind);
            if let Err(source) = devices.lane_mut(kind).capture.start_capture(sink) {
                devices.stop_capture();
                pipeline.stop(grace).await;
                channel.close().await;
                return Err(RedirectError::DeviceNotFound { kind, source });
            }
        }

        Ok((
            ActiveLink {
                channel,
                events,
                pipeline,
                established: Instant::now(),
            },
            peer,
        ))
    }

    /// Stop capture, then lanes, then the socket.
    async fn teardown_link(&mut self) {
        if let Some(devices) = self.devices.devices_mut() {
            devices.stop_capture();
        }
        if let Some(mut link) = self.link.take() {
            link.pipeline.stop(self.config.channel.teardown_timeout).await;
            link.channel.close().await;
        }
    }

    fn fault(&mut self, error: &RedirectError) {
        let kind = error.kind().unwrap_or(ErrorKind::ConnectionFailed);
        if let Some(t) = self.state.fault(kind) {
            self.emit(SessionEvent::LifecycleChanged(t));
        }
        self.devices.close();
        self.emit_error(error, true);
    }

    fn emit_error(&self, error: &RedirectError, terminal: bool) {
        if let Some(event) = ErrorEvent::from_error(error, terminal) {
            self.emit(SessionEvent::Error(event));
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(observer) = self.observer.as_ref().and_then(Weak::upgrade) {
            observer.on_event(&event);
        }
    }
}

impl Drop for RedirectionSession {
    fn drop(&mut self) {
        self.devices.close();
    }
}

/// How a failed activation should be recorded on the connection.
fn failure_reason(error: &RedirectError) -> Option<FailureReason> {
    match error {
        RedirectError::NetworkTimeout(_) => Some(FailureReason::Timeout),
        RedirectError::ConnectionFailed(msg) => Some(FailureReason::Io(msg.clone())),
        RedirectError::Io(e) => Some(FailureReason::Io(e.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    use super::*;
    use crate::device::{CaptureDevice, FrameCodec, PassthroughCodec, RenderSink};
    use crate::error::{CodecError, DeviceError};
    use crate::network::Endpoint;
    use crate::pipeline::CaptureSink;

    #[derive(Default)]
    struct Events(Mutex<Vec<SessionEvent>>);

    impl SessionObserver for Events {
        fn on_event(&self, event: &SessionEvent) {
            self.0.lock().push(event.clone());
        }
    }

    impl Events {
        fn count(&self, f: impl Fn(&SessionEvent) -> bool) -> usize {
            self.0.lock().iter().filter(|e| f(e)).count()
        }
    }

    struct Idle;

    impl CaptureDevice for Idle {
        fn start_capture(&mut self, _sink: CaptureSink) -> Result<(), DeviceError> {
            Ok(())
        }
        fn stop_capture(&mut self) {}
    }

    struct Discard;

    impl RenderSink for Discard {
        fn submit(&self, _raw: Bytes, _timestamp: u64) {}
    }

    struct Backend {
        video_missing: bool,
    }

    impl MediaBackend for Backend {
        fn capture(&self, kind: MediaKind) -> Result<Box<dyn CaptureDevice>, DeviceError> {
            if kind == MediaKind::Video && self.video_missing {
                return Err(DeviceError::NotFound);
            }
            Ok(Box::new(Idle))
        }
        fn render(&self, _kind: MediaKind) -> Result<Arc<dyn RenderSink>, DeviceError> {
            Ok(Arc::new(Discard))
        }
        fn codec(&self, _kind: MediaKind) -> Result<Arc<dyn FrameCodec>, CodecError> {
            Ok(Arc::new(PassthroughCodec))
        }
    }

    fn session(endpoint: Endpoint, video_missing: bool) -> RedirectionSession {
        let mut config = SessionConfig::new(endpoint);
        config.channel.open_timeout = Duration::from_millis(500);
        RedirectionSession::new(config, Arc::new(Backend { video_missing }))
    }

    async fn unused_addr() -> SocketAddr {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    }

    #[test]
    fn missing_device_faults_with_specific_kind() {
        let events = Arc::new(Events::default());
        let mut s = session(Endpoint::Connect("127.0.0.1:1".parse().unwrap()), true);
        s.set_observer(&events);

        let err = s.initialize().unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::DeviceNotFound));
        assert_eq!(s.state(), &SessionState::Faulted(ErrorKind::DeviceNotFound));
        assert_eq!(events.count(|e| matches!(e, SessionEvent::Registered(_))), 0);
        assert_eq!(
            events.count(|e| matches!(
                e,
                SessionEvent::Error(ErrorEvent {
                    kind: ErrorKind::DeviceNotFound,
                    terminal: true,
                    ..
                })
            )),
            1
        );
    }

    #[test]
    fn registration_is_emitted_once() {
        let events = Arc::new(Events::default());
        let mut s = session(Endpoint::Connect("127.0.0.1:1".parse().unwrap()), false);
        s.set_observer(&events);

        s.initialize().unwrap();
        assert_eq!(s.state(), &SessionState::Initializing);
        assert!(s.initialize().is_err());
        assert_eq!(events.count(|e| matches!(e, SessionEvent::Registered(_))), 1);
    }

    #[tokio::test]
    async fn failed_activate_leaves_nothing_running() {
        let mut s = session(Endpoint::Connect(unused_addr().await), false);
        s.initialize().unwrap();

        let err = s.activate().await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ConnectionFailed));
        assert_eq!(s.state(), &SessionState::Initializing);
        assert!(matches!(s.connection_state(), ConnectionState::Failed(_)));
        assert!(s.lane_stats(MediaKind::Audio).is_none());
        assert_eq!(s.channel_state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn activate_before_initialize_is_rejected() {
        let mut s = session(Endpoint::Connect(unused_addr().await), false);
        let err = s.activate().await.unwrap_err();
        assert!(matches!(err, RedirectError::InvalidState { .. }));
        assert_eq!(s.connection_state(), &ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn activate_and_deactivate_are_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let events = Arc::new(Events::default());
        let mut s = session(Endpoint::Connect(addr), false);
        s.set_observer(&events);
        s.initialize().unwrap();

        s.activate().await.unwrap();
        let _peer = peer.await.unwrap();
        assert!(s.state().is_active());
        assert!(s.connection_state().is_connected());
        s.activate().await.unwrap();

        s.deactivate().await.unwrap();
        assert_eq!(s.state(), &SessionState::Idle);
        assert_eq!(s.connection_state(), &ConnectionState::Disconnected);
        s.deactivate().await.unwrap();

        let lifecycle: Vec<_> = events
            .0
            .lock()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::LifecycleChanged(t) => Some(t.current.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(
            lifecycle,
            vec!["Initializing", "Active", "Deactivating", "Idle"]
        );
    }

    #[tokio::test]
    async fn shutdown_releases_devices() {
        let mut s = session(Endpoint::Connect(unused_addr().await), false);
        s.initialize().unwrap();
        s.shutdown().await;
        assert!(matches!(
            s.activate().await,
            Err(RedirectError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_observer_is_not_called() {
        let mut s = session(Endpoint::Connect("127.0.0.1:1".parse().unwrap()), false);
        let events = Arc::new(Events::default());
        s.set_observer(&events);
        drop(events);
        s.initialize().unwrap();
    }
}
