//! Synthetic media devices.
//!
//! Stand-ins for platform capture and render APIs: a sine tone and a
//! moving test pattern, each produced on its own thread the way a
//! hardware callback would deliver buffers, and a render sink that only
//! logs what arrives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use avbridge_core::{
    CaptureDevice, CaptureSink, CodecError, DeviceError, FrameCodec, MediaBackend, MediaKind,
    PassthroughCodec, RenderSink,
};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info};

use crate::config::MediaConfig;

// ── Generators ───────────────────────────────────────────────────

/// Produces the `seq`-th buffer of a synthetic stream.
pub trait Generator: Send + 'static {
    fn interval(&self) -> Duration;
    fn generate(&mut self, seq: u64) -> Bytes;
}

/// 16-bit little-endian mono PCM sine wave.
pub struct Tone {
    sample_rate: u32,
    samples_per_packet: usize,
    step: f32,
    phase: f32,
}

impl Tone {
    pub fn new(config: &MediaConfig) -> Self {
        let sample_rate = config.sample_rate.max(8_000);
        let packet_ms = config.audio_packet_ms.clamp(1, 1000);
        Self {
            sample_rate,
            samples_per_packet: (sample_rate * packet_ms / 1000) as usize,
            step: std::f32::consts::TAU * config.tone_hz / sample_rate as f32,
            phase: 0.0,
        }
    }
}

impl Generator for Tone {
    fn interval(&self) -> Duration {
        Duration::from_micros(self.samples_per_packet as u64 * 1_000_000 / self.sample_rate as u64)
    }

    fn generate(&mut self, _seq: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.samples_per_packet * 2);
        for _ in 0..self.samples_per_packet {
            let sample = (self.phase.sin() * i16::MAX as f32 * 0.25) as i16;
            buf.put_i16_le(sample);
            self.phase = (self.phase + self.step) % std::f32::consts::TAU;
        }
        buf.freeze()
    }
}

/// 8-bit luma frames with a diagonal band that moves every frame.
pub struct TestPattern {
    width: usize,
    height: usize,
    fps: u32,
}

impl TestPattern {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            width: config.video_width.clamp(16, 3840) as usize,
            height: config.video_height.clamp(16, 2160) as usize,
            fps: config.video_fps.clamp(1, 60),
        }
    }
}

impl Generator for TestPattern {
    fn interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps
    }

    fn generate(&mut self, seq: u64) -> Bytes {
        let shift = seq as usize;
        let mut buf = BytesMut::with_capacity(self.width * self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                buf.put_u8(((x + y + shift) % 256) as u8);
            }
        }
        buf.freeze()
    }
}

// ── SyntheticCapture ─────────────────────────────────────────────

/// Runs a [`Generator`] on a dedicated thread while capturing.
pub struct SyntheticCapture {
    kind: MediaKind,
    generator: Option<Box<dyn Generator>>,
    worker: Option<Worker>,
}

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<Box<dyn Generator>>,
}

impl SyntheticCapture {
    pub fn new(kind: MediaKind, generator: Box<dyn Generator>) -> Self {
        Self {
            kind,
            generator: Some(generator),
            worker: None,
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }
}

impl CaptureDevice for SyntheticCapture {
    fn start_capture(&mut self, sink: CaptureSink) -> Result<(), DeviceError> {
        if self.worker.is_some() {
            return Err(DeviceError::Busy(format!("{} capture already running", self.kind)));
        }
        let mut generator = self
            .generator
            .take()
            .ok_or_else(|| DeviceError::Failed("generator lost".into()))?;

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name(format!("{}-capture", self.kind))
            .spawn(move || {
                let interval = generator.interval();
                let started = Instant::now();
                let mut seq = 0u64;
                while flag.load(Ordering::Acquire) && sink.is_open() {
                    let timestamp = started.elapsed().as_micros() as u64;
                    sink.push(generator.generate(seq), timestamp);
                    seq += 1;
                    // Pace against the start time so drift doesn't accumulate.
                    let next = started + interval * seq as u32;
                    while flag.load(Ordering::Acquire) {
                        let now = Instant::now();
                        if now >= next {
                            break;
                        }
                        std::thread::park_timeout(next - now);
                    }
                }
                generator
            })
            .map_err(|e| DeviceError::Failed(e.to_string()))?;

        debug!(kind = %self.kind, "synthetic capture started");
        self.worker = Some(Worker { running, handle });
        Ok(())
    }

    fn stop_capture(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.running.store(false, Ordering::Release);
        worker.handle.thread().unpark();
        match worker.handle.join() {
            Ok(generator) => self.generator = Some(generator),
            Err(_) => tracing::error!(kind = %self.kind, "capture thread panicked"),
        }
        debug!(kind = %self.kind, "synthetic capture stopped");
    }
}

impl Drop for SyntheticCapture {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

// ── LoggingRender ────────────────────────────────────────────────

/// Counts what the remote side sends and logs a summary every
/// `log_every` buffers.
pub struct LoggingRender {
    kind: MediaKind,
    log_every: u64,
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl LoggingRender {
    pub fn new(kind: MediaKind, log_every: u64) -> Self {
        Self {
            kind,
            log_every: log_every.max(1),
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl RenderSink for LoggingRender {
    fn submit(&self, raw: Bytes, timestamp: u64) {
        let frames = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        let bytes = self.bytes.fetch_add(raw.len() as u64, Ordering::Relaxed) + raw.len() as u64;
        if frames % self.log_every == 0 {
            info!(kind = %self.kind, frames, bytes, timestamp, "rendered");
        }
    }
}

// ── SyntheticBackend ─────────────────────────────────────────────

pub struct SyntheticBackend {
    media: MediaConfig,
}

impl SyntheticBackend {
    pub fn new(media: MediaConfig) -> Self {
        Self { media }
    }
}

impl MediaBackend for SyntheticBackend {
    fn capture(&self, kind: MediaKind) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        let generator: Box<dyn Generator> = match kind {
            MediaKind::Audio => Box::new(Tone::new(&self.media)),
            MediaKind::Video => Box::new(TestPattern::new(&self.media)),
        };
        Ok(Box::new(SyntheticCapture::new(kind, generator)))
    }

    fn render(&self, kind: MediaKind) -> Result<Arc<dyn RenderSink>, DeviceError> {
        // About one log line every five seconds at the default rates.
        let log_every = match kind {
            MediaKind::Audio => 250,
            MediaKind::Video => 75,
        };
        Ok(Arc::new(LoggingRender::new(kind, log_every)))
    }

    fn codec(&self, _kind: MediaKind) -> Result<Arc<dyn FrameCodec>, CodecError> {
        Ok(Arc::new(PassthroughCodec))
    }
}

// ── Tests ────────────────────────────────────────────────────────
