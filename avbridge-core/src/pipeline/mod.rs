//! Moves frames between devices and the transport.
//!
//! ```text
//!  capture ─► outgoing queue ─► encode ─► frame ─► ChannelSender
//!  Inbound ─► route by kind ─► incoming queue ─► decode ─► render
//! ```
//!
//! Each lane has its own sender and render task, so a slow video codec
//! never holds up audio. Within a lane, order is preserved end to end.
//! A [`Pipeline`] serves exactly one connection; a new activation gets a
//! new pipeline.

mod lane;
mod queue;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub use lane::{CaptureSink, LaneIo, LaneStats};
pub use queue::{DropPolicy, LaneQueue, PushOutcome};

use crate::codec::WireCodec;
use crate::config::LaneConfig;
use crate::error::RedirectError;
use crate::frame::{MediaFrame, MediaKind};
use crate::network::{ChannelSender, Inbound};
use crate::task::TaskSet;
use lane::Lane;

pub struct Pipeline {
    audio: Arc<Lane>,
    video: Arc<Lane>,
    tasks: TaskSet,
}

impl Pipeline {
    pub fn new(audio: &LaneConfig, video: &LaneConfig) -> Self {
        Self {
            audio: Arc::new(Lane::new(MediaKind::Audio, audio)),
            video: Arc::new(Lane::new(MediaKind::Video, video)),
            tasks: TaskSet::new(),
        }
    }

    fn lane(&self, kind: MediaKind) -> &Arc<Lane> {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    /// Producer handle for `kind`'s outgoing queue.
    pub fn capture_sink(&self, kind: MediaKind) -> CaptureSink {
        CaptureSink::new(Arc::clone(self.lane(kind)))
    }

    /// Spawn the sender, receive and render tasks.
    ///
    /// `max_payload` bounds outgoing encoded payloads; it should match
    /// the channel's limit.
    pub fn start(
        &mut self,
        sender: ChannelSender,
        inbound: Inbound,
        max_payload: usize,
        audio: LaneIo,
        video: LaneIo,
    ) -> Result<(), RedirectError> {
        if !self.tasks.is_empty() || self.tasks.is_cancelled() {
            return Err(RedirectError::invalid_state("start pipeline", "started"));
        }

        let wire = WireCodec::new(max_payload);
        for (lane, io, send_name, render_name) in [
            (&self.audio, audio, "audio-sender", "audio-render"),
            (&self.video, video, "video-sender", "video-render"),
        ] {
            let token = self.tasks.token().clone();
            self.tasks.spawn(
                send_name,
                lane::send_loop(
                    Arc::clone(lane),
                    Arc::clone(&io.codec),
                    sender.clone(),
                    wire.clone(),
                    token.clone(),
                ),
            );
            self.tasks
                .spawn(render_name, lane::render_loop(Arc::clone(lane), io, token));
        }

        self.tasks.spawn(
            "receive-router",
            route_inbound(
                inbound,
                Arc::clone(&self.audio),
                Arc::clone(&self.video),
                self.tasks.token().clone(),
            ),
        );
        debug!(tasks = self.tasks.len(), "pipeline started");
        Ok(())
    }

    /// Stop every task and discard queued frames.
    pub async fn stop(&mut self, grace: Duration) {
        // Close lanes first so late capture pushes are turned away.
        let discarded = self.audio.close() + self.video.close();
        let aborted = self.tasks.shutdown(grace).await;
        // A task aborted mid-step may have queued one more frame.
        let discarded = discarded + self.audio.close() + self.video.close();
        debug!(discarded, aborted, "pipeline stopped");
    }

    pub fn stats(&self, kind: MediaKind) -> LaneStats {
        self.lane(kind).stats()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.audio.close();
        self.video.close();
    }
}

async fn route_inbound(
    inbound: Inbound,
    audio: Arc<Lane>,
    video: Arc<Lane>,
    token: CancellationToken,
) {
    let mut frames = inbound.into_stream();
    loop {
        let frame: MediaFrame = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = frames.next() => match next {
                Some(frame) => frame,
                None => break,
            },
        };
        let lane = match frame.kind() {
            MediaKind::Audio => &audio,
            MediaKind::Video => &video,
        };
        lane.count_received();
        let outcome = lane.push_incoming(frame);
        if outcome.dropped() {
            trace!(kind = %lane.kind(), ?outcome, "render overflow");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    use super::*;
    use crate::device::{FrameCodec, PassthroughCodec, RenderSink};
    use crate::error::CodecError;
    use crate::network::{ChannelConfig, Endpoint, TransportChannel};

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(Bytes, u64)>>);

    impl RenderSink for Recorder {
        fn submit(&self, raw: Bytes, timestamp: u64) {
            self.0.lock().push((raw, timestamp));
        }
    }

    /// Fails every payload starting with 0xFF.
    struct Picky;

    impl FrameCodec for Picky {
        fn encode(&self, raw: Bytes) -> Result<Bytes, CodecError> {
            if raw.first() == Some(&0xFF) {
                return Err(CodecError("bad sample".into()));
            }
            Ok(raw)
        }
        fn decode(&self, encoded: Bytes) -> Result<Bytes, CodecError> {
            self.encode(encoded)
        }
    }

    fn io(codec: Arc<dyn FrameCodec>, render: Arc<dyn RenderSink>) -> LaneIo {
        LaneIo { codec, render }
    }

    /// Two channels connected to each other over localhost.
    async fn channel_pair() -> (
        (TransportChannel, Inbound),
        (TransportChannel, Inbound),
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mut server, _) = TransportChannel::new(ChannelConfig::default());
        let server_open = tokio::spawn(async move {
            let inbound = server.open(Endpoint::Listen(addr)).await.unwrap();
            (server, inbound)
        });

        let (mut client, _) = TransportChannel::new(ChannelConfig::default());
        let client_inbound = loop {
            match client.open(Endpoint::Connect(addr)).await {
                Ok(inbound) => break inbound,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        let server = server_open.await.unwrap();
        (server, (client, client_inbound))
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn video_overflow_rejects_new_frames() {
        let video = LaneConfig {
            capacity: 2,
            policy: DropPolicy::DropNewest,
        };
        let pipeline = Pipeline::new(&LaneConfig::for_kind(MediaKind::Audio), &video);
        let sink = pipeline.capture_sink(MediaKind::Video);

        assert_eq!(sink.push(vec![1u8], 1), PushOutcome::Queued);
        assert_eq!(sink.push(vec![2u8], 2), PushOutcome::Queued);
        assert_eq!(sink.push(vec![3u8], 3), PushOutcome::Rejected);

        let stats = pipeline.stats(MediaKind::Video);
        assert_eq!(stats.outgoing_len, 2);
        assert_eq!(stats.outgoing_dropped, 1);
        assert_eq!(pipeline.stats(MediaKind::Audio).dropped(), 0);
    }

    #[test]
    fn closed_sink_rejects_without_counting() {
        let config = LaneConfig::for_kind(MediaKind::Audio);
        let pipeline = Pipeline::new(&config, &config);
        let sink = pipeline.capture_sink(MediaKind::Audio);
        drop(pipeline);

        assert!(!sink.is_open());
        assert_eq!(sink.push(vec![0u8; 4], 1), PushOutcome::Rejected);
    }

    #[tokio::test]
    async fn frames_flow_end_to_end_and_codec_failures_are_counted() {
        let ((mut left, left_in), (mut right, right_in)) = channel_pair().await;
        let config = LaneConfig {
            capacity: 16,
            policy: DropPolicy::DropOldest,
        };

        let mut sending = Pipeline::new(&config, &config);
        let sink_render = Arc::new(Recorder::default());
        sending
            .start(
                left.sender().unwrap(),
                left_in,
                left.config().max_payload,
                io(Arc::new(Picky), sink_render.clone()),
                io(Arc::new(PassthroughCodec), sink_render.clone()),
            )
            .unwrap();

        let mut receiving = Pipeline::new(&config, &config);
        let audio_out = Arc::new(Recorder::default());
        let video_out = Arc::new(Recorder::default());
        receiving
            .start(
                right.sender().unwrap(),
                right_in,
                right.config().max_payload,
                io(Arc::new(PassthroughCodec), audio_out.clone()),
                io(Arc::new(PassthroughCodec), video_out.clone()),
            )
            .unwrap();

        let audio = sending.capture_sink(MediaKind::Audio);
        let video = sending.capture_sink(MediaKind::Video);
        audio.push(vec![0u8; 16], 1000);
        audio.push(vec![0xFF, 1], 1001);
        audio.push(vec![7u8; 3], 1002);
        video.push(vec![9u8; 32], 5);

        wait_for(|| audio_out.0.lock().len() == 2 && video_out.0.lock().len() == 1).await;

        let got: Vec<_> = audio_out.0.lock().iter().map(|(_, ts)| *ts).collect();
        assert_eq!(got, vec![1000, 1002]);
        assert_eq!(audio_out.0.lock()[0].0, Bytes::from(vec![0u8; 16]));
        assert_eq!(video_out.0.lock()[0], (Bytes::from(vec![9u8; 32]), 5));

        let stats = sending.stats(MediaKind::Audio);
        assert_eq!(stats.codec_failures, 1);
        assert_eq!(stats.sent, 2);
        assert_eq!(receiving.stats(MediaKind::Audio).rendered, 2);
        assert_eq!(receiving.stats(MediaKind::Audio).received, 2);
        assert_eq!(receiving.stats(MediaKind::Video).received, 1);
        assert_eq!(sending.stats(MediaKind::Audio).received, 0);
        assert!(sink_render.0.lock().is_empty());

        sending.stop(Duration::from_millis(200)).await;
        receiving.stop(Duration::from_millis(200)).await;
        assert!(!audio.is_open());
        left.close().await;
        right.close().await;
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let ((mut left, left_in), (_right, right_in)) = channel_pair().await;
        let config = LaneConfig::for_kind(MediaKind::Audio);
        let render: Arc<dyn RenderSink> = Arc::new(Recorder::default());
        let codec: Arc<dyn FrameCodec> = Arc::new(PassthroughCodec);

        let mut pipeline = Pipeline::new(&config, &config);
        pipeline
            .start(
                left.sender().unwrap(),
                left_in,
                1024,
                io(codec.clone(), render.clone()),
                io(codec.clone(), render.clone()),
            )
            .unwrap();
        let err = pipeline
            .start(
                left.sender().unwrap(),
                right_in,
                1024,
                io(codec.clone(), render.clone()),
                io(codec, render),
            )
            .unwrap_err();
        assert!(matches!(err, RedirectError::InvalidState { .. }));

        pipeline.stop(Duration::from_millis(200)).await;
        left.close().await;
    }
}
