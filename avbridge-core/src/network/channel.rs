use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{DEFAULT_MAX_PAYLOAD, Decoded, WireCodec};
use crate::error::{FrameError, RedirectError};
use crate::frame::MediaFrame;
use crate::state::FailureReason;
use crate::task::TaskSet;

const LISTEN_BACKLOG: u32 = 8;

// ── Endpoint ─────────────────────────────────────────────────────

/// Where the channel gets its single peer from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Bind here and accept one peer.
    Listen(SocketAddr),
    /// Dial this address.
    Connect(SocketAddr),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listen(addr) => write!(f, "listen:{addr}"),
            Self::Connect(addr) => write!(f, "connect:{addr}"),
        }
    }
}

// ── ChannelConfig ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Largest payload accepted in either direction.
    pub max_payload: usize,
    /// Initial read buffer size for the socket.
    pub read_buffer_size: usize,
    /// Encoded frames buffered ahead of the socket writer.
    pub write_queue_depth: usize,
    /// Decoded frames buffered ahead of the pipeline.
    pub inbound_queue_depth: usize,
    /// Bound on connect (or on waiting for a peer when listening).
    pub open_timeout: Duration,
    /// Bound on a single socket write.
    pub write_timeout: Duration,
    /// Grace period for I/O tasks on close before they are aborted.
    pub teardown_timeout: Duration,
    pub nodelay: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            read_buffer_size: 4096,
            write_queue_depth: 64,
            inbound_queue_depth: 64,
            open_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            teardown_timeout: Duration::from_millis(500),
            nodelay: true,
        }
    }
}

// ── ChannelState / TransportEvent ────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Closed,
    Listening(SocketAddr),
    Connecting(SocketAddr),
    Open {
        peer: SocketAddr,
    },
    Failed(FailureReason),
}

impl ChannelState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Listening(addr) => write!(f, "Listening({addr})"),
            Self::Connecting(addr) => write!(f, "Connecting({addr})"),
            Self::Open { peer } => write!(f, "Open({peer})"),
            Self::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// Asynchronous notifications from the channel's I/O tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link broke after it was open. Raised at most once per open.
    Failed(FailureReason),
    /// An inbound frame with an unknown kind tag was discarded.
    FrameSkipped { tag: u8, payload_len: usize },
    /// A second peer tried to connect while one was open.
    PeerRejected(SocketAddr),
}

// ── Inbound / ChannelSender ──────────────────────────────────────

/// Frames decoded from the peer, in arrival order. Ends when the
/// connection closes or fails.
#[derive(Debug)]
pub struct Inbound {
    rx: mpsc::Receiver<MediaFrame>,
}

impl Inbound {
    pub async fn recv(&mut self) -> Option<MediaFrame> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<MediaFrame> {
        ReceiverStream::new(self.rx)
    }
}

/// Cloneable handle for queueing bytes on the socket writer.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<Bytes>,
    state: watch::Receiver<ChannelState>,
}

impl ChannelSender {
    /// Queue `bytes` without waiting.
    ///
    /// Returns as soon as the bytes are queued; write failures show up
    /// later as [`TransportEvent::Failed`].
    pub fn send(&self, bytes: Bytes) -> Result<(), RedirectError> {
        if !self.is_open() {
            return Err(RedirectError::ChannelClosed);
        }
        match self.tx.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(RedirectError::BufferOverflow("transport write queue full"))
            }
            Err(TrySendError::Closed(_)) => Err(RedirectError::ChannelClosed),
        }
    }

    /// Wait for room in the write queue. Only the writer's own progress
    /// is awaited, never the network directly.
    pub async fn reserve(&self) -> Result<mpsc::Permit<'_, Bytes>, RedirectError> {
        self.tx.reserve().await.map_err(|_| RedirectError::ChannelClosed)
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().is_open()
    }
}

// ── TransportChannel ─────────────────────────────────────────────

/// Owns one TCP connection to the remote peer.
///
/// ```text
///  Closed ──► Listening | Connecting ──► Open ──► Closed
///                   │                     │
///                   └────► Failed ◄───────┘
/// ```
///
/// Only one peer is served. In listen mode the listener stays bound
/// while the channel is open and turns away any further peer.
pub struct TransportChannel {
    config: ChannelConfig,
    state: Arc<watch::Sender<ChannelState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    link: Option<Link>,
}

struct Link {
    sender: ChannelSender,
    tasks: TaskSet,
}

impl TransportChannel {
    /// Create a closed channel and the receiver for its events.
    pub fn new(config: ChannelConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Closed);
        let channel = Self {
            config,
            state: Arc::new(state),
            events,
            link: None,
        };
        (channel, events_rx)
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    /// Watch state changes, including the bound address while listening.
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Establish the connection and start the I/O tasks.
    ///
    /// Resolves once the channel is `Open`, returning the inbound
    /// frame sequence for this connection.
    pub async fn open(&mut self, endpoint: Endpoint) -> Result<Inbound, RedirectError> {
        if self.link.is_some() {
            return Err(RedirectError::invalid_state("open", self.state()));
        }

        let timeout = self.config.open_timeout;
        let (stream, listener) = match tokio::time::timeout(timeout, self.establish(endpoint)).await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.state
                    .send_replace(ChannelState::Failed(FailureReason::Io(e.to_string())));
                return Err(RedirectError::ConnectionFailed(format!("{endpoint}: {e}")));
            }
            Err(_) => {
                self.state
                    .send_replace(ChannelState::Failed(FailureReason::Timeout));
                return Err(RedirectError::NetworkTimeout(timeout));
            }
        };

        let peer = stream.peer_addr()?;
        stream.set_nodelay(self.config.nodelay)?;
        let (read_half, write_half) = stream.into_split();

        // Open before the I/O tasks run, so an immediate EOF is reported.
        self.state.send_replace(ChannelState::Open { peer });

        let mut tasks = TaskSet::new();
        let failure = FailureSignal {
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            token: tasks.token().clone(),
        };

        let (write_tx, write_rx) = mpsc::channel(self.config.write_queue_depth.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_queue_depth.max(1));

        let writer = FramedWrite::new(write_half, BytesCodec::new());
        tasks.spawn(
            "channel-writer",
            write_loop(
                write_rx,
                writer,
                self.config.write_timeout,
                failure.clone(),
            ),
        );

        let reader = FramedRead::with_capacity(
            read_half,
            WireCodec::new(self.config.max_payload),
            self.config.read_buffer_size,
        );
        tasks.spawn(
            "channel-reader",
            read_loop(reader, inbound_tx, self.events.clone(), failure),
        );

        if let Some(listener) = listener {
            tasks.spawn(
                "channel-rejector",
                reject_loop(listener, self.events.clone(), tasks.token().clone()),
            );
        }

        info!(%peer, %endpoint, "transport channel open");

        self.link = Some(Link {
            sender: ChannelSender {
                tx: write_tx,
                state: self.state.subscribe(),
            },
            tasks,
        });
        Ok(Inbound { rx: inbound_rx })
    }

    /// A handle for queueing bytes. Fails unless the channel is open.
    pub fn sender(&self) -> Result<ChannelSender, RedirectError> {
        match &self.link {
            Some(link) if link.sender.is_open() => Ok(link.sender.clone()),
            _ => Err(RedirectError::ChannelClosed),
        }
    }

    /// Queue bytes for the peer. See [`ChannelSender::send`].
    pub fn send(&self, bytes: Bytes) -> Result<(), RedirectError> {
        match &self.link {
            Some(link) => link.sender.send(bytes),
            None => Err(RedirectError::ChannelClosed),
        }
    }

    /// Tear the connection down.
    ///
    /// Unsent bytes are discarded and the inbound sequence ends. Safe
    /// to call in any state and while I/O is in flight.
    pub async fn close(&mut self) {
        let Some(mut link) = self.link.take() else {
            self.state.send_replace(ChannelState::Closed);
            return;
        };

        // Closed first, so I/O errors caused by the teardown itself are
        // not reported as failures.
        self.state.send_replace(ChannelState::Closed);
        let aborted = link.tasks.shutdown(self.config.teardown_timeout).await;
        debug!(aborted, "transport channel closed");
    }

    async fn establish(
        &self,
        endpoint: Endpoint,
    ) -> std::io::Result<(TcpStream, Option<TcpListener>)> {
        match endpoint {
            Endpoint::Listen(addr) => {
                let listener = bind_reusable(addr)?;
                let local = listener.local_addr()?;
                self.state.send_replace(ChannelState::Listening(local));
                info!(%local, "waiting for peer");
                let (stream, _) = listener.accept().await?;
                Ok((stream, Some(listener)))
            }
            Endpoint::Connect(addr) => {
                self.state.send_replace(ChannelState::Connecting(addr));
                let stream = TcpStream::connect(addr).await?;
                Ok((stream, None))
            }
        }
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if self.link.is_some() {
            self.state.send_replace(ChannelState::Closed);
        }
    }
}

fn bind_reusable(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

// ── I/O tasks ────────────────────────────────────────────────────

/// Shared by the I/O tasks of one connection to report the first
/// failure and stop the others.
#[derive(Clone)]
struct FailureSignal {
    state: Arc<watch::Sender<ChannelState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    token: CancellationToken,
}

impl FailureSignal {
    fn raise(&self, reason: FailureReason) {
        let raised = self.state.send_if_modified(|state| {
            if state.is_open() {
                *state = ChannelState::Failed(reason.clone());
                true
            } else {
                false
            }
        });
        if raised {
            warn!(%reason, "transport channel failed");
            let _ = self.events.send(TransportEvent::Failed(reason));
        }
        self.token.cancel();
    }
}

async fn write_loop(
    mut queue: mpsc::Receiver<Bytes>,
    mut writer: FramedWrite<OwnedWriteHalf, BytesCodec>,
    write_timeout: Duration,
    failure: FailureSignal,
) {
    let token = failure.token.clone();
    loop {
        let bytes = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = queue.recv() => match next {
                Some(bytes) => bytes,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            r = tokio::time::timeout(write_timeout, writer.send(bytes)) => r,
        };
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failure.raise(FailureReason::Io(e.to_string()));
                break;
            }
            Err(_) => {
                failure.raise(FailureReason::Timeout);
                break;
            }
        }
    }
}

async fn read_loop(
    mut reader: FramedRead<OwnedReadHalf, WireCodec>,
    inbound: mpsc::Sender<MediaFrame>,
    events: mpsc::UnboundedSender<TransportEvent>,
    failure: FailureSignal,
) {
    let token = failure.token.clone();
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = reader.next() => next,
        };

        match next {
            Some(Ok(Decoded::Frame(frame))) => {
                let delivered = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    r = inbound.send(frame) => r,
                };
                if delivered.is_err() {
                    // Nobody is consuming this connection any more.
                    break;
                }
            }
            Some(Ok(Decoded::Skipped { tag, payload_len })) => {
                warn!(tag, payload_len, "skipping frame with unknown kind");
                let _ = events.send(TransportEvent::FrameSkipped { tag, payload_len });
            }
            Some(Err(FrameError::Io(e))) => {
                failure.raise(FailureReason::Io(e.to_string()));
                break;
            }
            Some(Err(e)) => {
                failure.raise(FailureReason::Framing(e.to_string()));
                break;
            }
            None => {
                failure.raise(FailureReason::PeerClosed);
                break;
            }
        }
    }
}

async fn reject_loop(
    listener: TcpListener,
    events: mpsc::UnboundedSender<TransportEvent>,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((stream, peer)) => {
                drop(stream);
                warn!(%peer, "rejecting peer: a connection is already open");
                let _ = events.send(TransportEvent::PeerRejected(peer));
            }
            Err(e) => {
                debug!("accept error while open: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    async fn connect_pair() -> (
        TransportChannel,
        Inbound,
        mpsc::UnboundedReceiver<TransportEvent>,
        TcpStream,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (mut channel, events) = TransportChannel::new(ChannelConfig::default());
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let inbound = channel.open(Endpoint::Connect(addr)).await.unwrap();
        let peer = accept.await.unwrap();
        (channel, inbound, events, peer)
    }

    #[tokio::test]
    async fn send_before_open_is_rejected() {
        let (channel, _events) = TransportChannel::new(ChannelConfig::default());
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(matches!(
            channel.send(Bytes::from_static(b"x")),
            Err(RedirectError::ChannelClosed)
        ));
        assert!(channel.sender().is_err());
    }

    #[tokio::test]
    async fn send_reaches_peer() {
        let (channel, _inbound, _events, mut peer) = connect_pair().await;
        assert!(channel.state().is_open());

        let frame = MediaFrame::audio(1000, vec![0u8; 16]);
        channel.send(frame.encode().unwrap()).unwrap();

        let mut buf = vec![0u8; frame.wire_len()];
        tokio::time::timeout(WAIT, peer.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (decoded, _) = MediaFrame::decode(&buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn inbound_frames_and_skip_warning() {
        let (_channel, mut inbound, mut events, mut peer) = connect_pair().await;

        let mut bad = MediaFrame::video(2, vec![7u8; 9]).encode().unwrap().to_vec();
        bad[8] = 0x33;
        peer.write_all(&MediaFrame::audio(1, vec![1u8; 4]).encode().unwrap())
            .await
            .unwrap();
        peer.write_all(&bad).await.unwrap();
        peer.write_all(&MediaFrame::video(3, vec![3u8; 2]).encode().unwrap())
            .await
            .unwrap();

        let first = tokio::time::timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert_eq!(first.timestamp(), 1);
        let second = tokio::time::timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert_eq!(second.timestamp(), 3);

        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(
            event,
            TransportEvent::FrameSkipped {
                tag: 0x33,
                payload_len: 9
            }
        );
    }

    #[tokio::test]
    async fn peer_close_raises_failure_once() {
        let (channel, mut inbound, mut events, peer) = connect_pair().await;
        drop(peer);

        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(event, TransportEvent::Failed(FailureReason::PeerClosed));
        assert_eq!(
            channel.state(),
            ChannelState::Failed(FailureReason::PeerClosed)
        );

        // Inbound sequence ends with the connection.
        assert!(tokio::time::timeout(WAIT, inbound.recv()).await.unwrap().is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn immediate_peer_close_is_still_reported() {
        for _ in 0..20 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let accept = tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                drop(stream);
            });

            let (mut channel, mut events) = TransportChannel::new(ChannelConfig::default());
            let _inbound = channel.open(Endpoint::Connect(addr)).await.unwrap();
            accept.await.unwrap();

            let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
            assert!(matches!(event, TransportEvent::Failed(_)));
            assert!(matches!(channel.state(), ChannelState::Failed(_)));
            channel.close().await;
        }
    }

    #[tokio::test]
    async fn oversized_frame_fails_the_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ChannelConfig {
            max_payload: 8,
            ..Default::default()
        };
        let (mut channel, mut events) = TransportChannel::new(config);
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let _inbound = channel.open(Endpoint::Connect(addr)).await.unwrap();
        let mut peer = accept.await.unwrap();

        peer.write_all(&MediaFrame::audio(1, vec![0u8; 64]).encode().unwrap())
            .await
            .unwrap();

        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(
            event,
            TransportEvent::Failed(FailureReason::Framing(_))
        ));
    }

    #[tokio::test]
    async fn close_is_silent_and_ends_inbound() {
        let (mut channel, mut inbound, mut events, _peer) = connect_pair().await;
        channel.close().await;

        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(tokio::time::timeout(WAIT, inbound.recv()).await.unwrap().is_none());
        assert!(events.try_recv().is_err());
        assert!(matches!(
            channel.send(Bytes::from_static(b"late")),
            Err(RedirectError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn connect_refused_is_connection_failed() {
        // Grab a free port, then release it so nothing is listening.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let (mut channel, _events) = TransportChannel::new(ChannelConfig::default());
        let err = channel.open(Endpoint::Connect(addr)).await.unwrap_err();
        assert!(matches!(err, RedirectError::ConnectionFailed(_)));
        assert!(matches!(channel.state(), ChannelState::Failed(_)));
    }

    #[tokio::test]
    async fn listen_times_out_without_peer() {
        let config = ChannelConfig {
            open_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (mut channel, _events) = TransportChannel::new(config);
        let err = channel
            .open(Endpoint::Listen("127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, RedirectError::NetworkTimeout(_)));
        assert_eq!(channel.state(), ChannelState::Failed(FailureReason::Timeout));
    }

    #[tokio::test]
    async fn listen_accepts_one_peer_and_rejects_the_next() {
        let (mut channel, mut events) = TransportChannel::new(ChannelConfig::default());
        let mut state = channel.subscribe();

        let dialer = tokio::spawn(async move {
            let addr = loop {
                if let ChannelState::Listening(addr) = *state.borrow_and_update() {
                    break addr;
                }
                state.changed().await.unwrap();
            };
            let first = TcpStream::connect(addr).await.unwrap();
            (addr, first)
        });

        let _inbound = tokio::time::timeout(
            WAIT,
            channel.open(Endpoint::Listen("127.0.0.1:0".parse().unwrap())),
        )
        .await
        .unwrap()
        .unwrap();
        let (addr, _first) = dialer.await.unwrap();
        assert!(channel.state().is_open());

        let mut second = TcpStream::connect(addr).await.unwrap();
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, TransportEvent::PeerRejected(_)));

        // The rejected socket sees EOF.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(WAIT, second.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(channel.state().is_open());
    }

    #[tokio::test]
    async fn reopen_after_close() {
        let (mut channel, _inbound, _events, _peer) = connect_pair().await;
        assert!(channel.open(Endpoint::Connect("127.0.0.1:1".parse().unwrap())).await.is_err());
        channel.close().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        channel.open(Endpoint::Connect(addr)).await.unwrap();
        accept.await.unwrap();
        assert!(channel.state().is_open());
    }
}
