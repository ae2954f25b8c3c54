//! # Audio Capture
//!
//! A capture source owns the microphone side of a session. It pushes fixed
//! interval chunks (100 ms by default) into the session's send loop and
//! guarantees that once `stop()` returns nothing else is delivered.
//!
//! The server never sees a physical device: the client's microphone arrives
//! over the transport as arbitrarily sized PCM16 frames. [`RelayCaptureSource`]
//! accepts those frames through a [`CaptureFeed`] and re-frames them into
//! chunks of the declared rate, channel count and duration.

use crate::audio::codec::{self, CodecError};
use crate::audio::{AudioChunk, AudioFormat};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Depth of the queue between the transport and the re-framing task.
const FEED_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("capture source already started")]
    AlreadyStarted,

    #[error("capture source is stopped")]
    Stopped,

    #[error("unsupported capture input: {0}")]
    UnsupportedInput(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Format and cadence a capture source declares at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSpec {
    pub format: AudioFormat,
    pub chunk_ms: u32,
}

impl CaptureSpec {
    /// Interleaved samples in one emitted chunk.
    pub fn samples_per_chunk(&self) -> usize {
        let frames = (u64::from(self.format.sample_rate) * u64::from(self.chunk_ms) / 1000).max(1);
        frames as usize * usize::from(self.format.channels.max(1))
    }
}

/// A source of fixed-interval microphone chunks.
#[async_trait]
pub trait AudioCaptureSource: Send {
    fn spec(&self) -> CaptureSpec;

    /// Begin delivering chunks into `sink`.
    async fn start(&mut self, sink: mpsc::Sender<AudioChunk>) -> Result<(), CaptureError>;

    /// Release the device. No chunk is delivered after this completes.
    async fn stop(&mut self) -> Result<(), CaptureError>;
}

/// Creates one capture source per session together with the handle the
/// orchestrator uses to push client audio into it.
pub trait CaptureFactory: Send + Sync {
    fn create(&self, spec: CaptureSpec) -> (Box<dyn AudioCaptureSource>, CaptureFeed);
}

/// Default factory producing [`RelayCaptureSource`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayCaptureFactory;

impl CaptureFactory for RelayCaptureFactory {
    fn create(&self, spec: CaptureSpec) -> (Box<dyn AudioCaptureSource>, CaptureFeed) {
        let (source, feed) = RelayCaptureSource::new(spec);
        (Box::new(source), feed)
    }
}

/// Cloneable handle for pushing client audio into a relay capture source.
#[derive(Debug, Clone)]
pub struct CaptureFeed {
    tx: mpsc::Sender<AudioChunk>,
}

impl CaptureFeed {
    pub fn new(tx: mpsc::Sender<AudioChunk>) -> Self {
        Self { tx }
    }

    /// Queue one client chunk. Waits while the capture queue is full.
    pub async fn push(&self, chunk: AudioChunk) -> Result<(), CaptureError> {
        self.tx.send(chunk).await.map_err(|_| CaptureError::Stopped)
    }
}

/// Capture source fed by audio relayed from the client.
pub struct RelayCaptureSource {
    spec: CaptureSpec,
    inbound: Option<mpsc::Receiver<AudioChunk>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RelayCaptureSource {
    pub fn new(spec: CaptureSpec) -> (Self, CaptureFeed) {
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let source = Self {
            spec,
            inbound: Some(rx),
            cancel: CancellationToken::new(),
            task: None,
        };
        (source, CaptureFeed::new(tx))
    }
}

#[async_trait]
impl AudioCaptureSource for RelayCaptureSource {
    fn spec(&self) -> CaptureSpec {
        self.spec
    }

    async fn start(&mut self, sink: mpsc::Sender<AudioChunk>) -> Result<(), CaptureError> {
        if self.task.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }
        let inbound = self.inbound.take().ok_or(CaptureError::Stopped)?;
        let framer = Reframer::new(self.spec);
        self.task = Some(tokio::spawn(run_relay(inbound, sink, framer, self.cancel.clone())));
        debug!(
            sample_rate = self.spec.format.sample_rate,
            channels = self.spec.format.channels,
            chunk_ms = self.spec.chunk_ms,
            "Relay capture started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        self.cancel.cancel();
        self.inbound.take();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("Relay capture task panicked: {}", e);
                }
            }
        }
        Ok(())
    }
}

impl Drop for RelayCaptureSource {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_relay(
    mut inbound: mpsc::Receiver<AudioChunk>,
    sink: mpsc::Sender<AudioChunk>,
    mut framer: Reframer,
    cancel: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = inbound.recv() => match next {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let ready = match framer.push(&chunk) {
            Ok(ready) => ready,
            Err(e) => {
                warn!(sequence = chunk.sequence_number, "Dropping capture input: {}", e);
                continue;
            }
        };

        for out in ready {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                sent = sink.send(out) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Accumulates client samples and cuts them into fixed-size chunks.
///
/// Output chunks carry their own strictly increasing sequence numbers and the
/// capture timestamp of the input chunk that completed them.
struct Reframer {
    spec: CaptureSpec,
    pending: Vec<f32>,
    next_sequence: u64,
}

impl Reframer {
    fn new(spec: CaptureSpec) -> Self {
        Self {
            spec,
            pending: Vec::with_capacity(spec.samples_per_chunk() * 2),
            next_sequence: 1,
        }
    }

    fn push(&mut self, chunk: &AudioChunk) -> Result<Vec<AudioChunk>, CaptureError> {
        let samples = self.normalize(chunk)?;
        self.pending.extend_from_slice(&samples);

        let size = self.spec.samples_per_chunk();
        let mut ready = Vec::new();
        while self.pending.len() >= size {
            let block: Vec<f32> = self.pending.drain(..size).collect();
            ready.push(AudioChunk::new(
                codec::encode_pcm16(&block),
                self.spec.format.sample_rate,
                self.spec.format.channels,
                self.next_sequence,
                chunk.capture_timestamp,
            ));
            self.next_sequence += 1;
        }
        Ok(ready)
    }

    /// Convert an input chunk to the declared format.
    fn normalize(&self, chunk: &AudioChunk) -> Result<Vec<f32>, CaptureError> {
        let target = self.spec.format;
        let mut samples = codec::decode_pcm16(&chunk.payload)?;

        if chunk.channels != target.channels {
            if target.channels != 1 {
                return Err(CaptureError::UnsupportedInput(format!(
                    "{} channel input for a {} channel source",
                    chunk.channels, target.channels
                )));
            }
            samples = codec::downmix_to_mono(&samples, chunk.channels)?;
        }

        if chunk.sample_rate != target.sample_rate {
            if target.channels != 1 {
                return Err(CaptureError::UnsupportedInput(format!(
                    "cannot resample interleaved input from {} Hz",
                    chunk.sample_rate
                )));
            }
            samples = codec::resample(&samples, chunk.sample_rate, target.sample_rate)?;
        }

        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(rate: u32) -> CaptureSpec {
        CaptureSpec {
            format: AudioFormat::mono(rate),
            chunk_ms: 100,
        }
    }

    fn pcm(samples: usize, value: f32) -> Vec<u8> {
        codec::encode_pcm16(&vec![value; samples])
    }

    #[test]
    fn test_samples_per_chunk() {
        assert_eq!(spec(16000).samples_per_chunk(), 1600);
        let stereo = CaptureSpec {
            format: AudioFormat::new(48000, 2),
            chunk_ms: 100,
        };
        assert_eq!(stereo.samples_per_chunk(), 9600);
    }

    #[test]
    fn test_reframer_cuts_fixed_chunks() {
        let mut framer = Reframer::new(spec(16000));

        // 60 ms, then 90 ms: one full chunk after the second push.
        let first = framer.push(&AudioChunk::new(pcm(960, 0.1), 16000, 1, 10, 1000)).unwrap();
        assert!(first.is_empty());

        let second = framer.push(&AudioChunk::new(pcm(1440, 0.1), 16000, 1, 11, 1060)).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload.len(), 1600 * 2);
        assert_eq!(second[0].sequence_number, 1);
        assert_eq!(second[0].capture_timestamp, 1060);

        // 250 ms more: 800 + 4000 pending samples yield three chunks.
        let third = framer.push(&AudioChunk::new(pcm(4000, 0.1), 16000, 1, 12, 1150)).unwrap();
        let sequences: Vec<u64> = third.iter().map(|c| c.sequence_number).collect();
        assert_eq!(sequences, vec![2, 3, 4]);
    }

    #[test]
    fn test_reframer_converts_rate_and_channels() {
        let mut framer = Reframer::new(spec(16000));

        // 100 ms of 48 kHz stereo becomes exactly one 16 kHz mono chunk.
        let out = framer.push(&AudioChunk::new(pcm(9600, 0.5), 48000, 2, 1, 0)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sample_rate, 16000);
        assert_eq!(out[0].channels, 1);

        let odd = AudioChunk::new(vec![0u8; 3], 16000, 1, 2, 0);
        assert!(matches!(framer.push(&odd), Err(CaptureError::Codec(_))));
    }

    #[tokio::test]
    async fn test_relay_stops_delivering_after_stop() {
        let (mut source, feed) = RelayCaptureSource::new(spec(16000));
        let (tx, mut rx) = mpsc::channel(8);
        source.start(tx).await.unwrap();

        feed.push(AudioChunk::new(pcm(1600, 0.2), 16000, 1, 1, 5)).await.unwrap();
        let chunk = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.sequence_number, 1);

        source.stop().await.unwrap();
        assert!(feed.push(AudioChunk::new(pcm(1600, 0.2), 16000, 1, 2, 6)).await.is_err());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_relay_rejects_second_start() {
        let (mut source, _feed) = RelayCaptureSource::new(spec(16000));
        let (tx, _rx) = mpsc::channel(1);
        source.start(tx.clone()).await.unwrap();
        assert_eq!(source.start(tx).await, Err(CaptureError::AlreadyStarted));
        source.stop().await.unwrap();
    }
}
