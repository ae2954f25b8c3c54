//! # Audio Playback Sink
//!
//! A FIFO of decoded endpoint audio played back-to-back in real time. The
//! player task cuts each buffer into short frames and releases them on a
//! running deadline, so consecutive buffers neither overlap nor leave a gap.
//! Released frames go to an output channel (the client's speaker, through the
//! transport).
//!
//! `clear()` is the interruption path: queued buffers are dropped and the
//! buffer currently playing stops at the next frame boundary.

use crate::audio::EchoStamp;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    #[error("playback sink is stopped")]
    Stopped,
}

/// Decoded audio waiting to be played.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    pub echo: Option<EchoStamp>,
}

impl PlaybackBuffer {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
            echo: None,
        }
    }

    pub fn with_echo(mut self, echo: Option<EchoStamp>) -> Self {
        self.echo = echo;
        self
    }
}

/// A slice of a buffer released to the output at its play time.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    pub echo: Option<EchoStamp>,
}

struct PlaybackShared {
    queue: Mutex<VecDeque<PlaybackBuffer>>,
    /// Bumped by every clear; the player abandons a buffer whose generation is stale.
    generation: AtomicU64,
    playing: AtomicBool,
    wake: Notify,
    stop: CancellationToken,
}

/// Handle to a running playback sink. Cloning shares the same queue.
#[derive(Clone)]
pub struct AudioPlaybackSink {
    shared: Arc<PlaybackShared>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AudioPlaybackSink {
    /// Start a sink releasing frames of `frame_ms` into `output`.
    pub fn start(output: mpsc::Sender<PlaybackFrame>, frame_ms: u32) -> Self {
        let shared = Arc::new(PlaybackShared {
            queue: Mutex::new(VecDeque::new()),
            generation: AtomicU64::new(0),
            playing: AtomicBool::new(false),
            wake: Notify::new(),
            stop: CancellationToken::new(),
        });
        let task = tokio::spawn(run_player(shared.clone(), output, frame_ms.max(1)));
        Self {
            shared,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Append a buffer to the end of the queue.
    pub fn enqueue(&self, buffer: PlaybackBuffer) -> Result<(), PlaybackError> {
        if self.shared.stop.is_cancelled() {
            return Err(PlaybackError::Stopped);
        }
        if buffer.samples.is_empty() || buffer.sample_rate == 0 {
            return Ok(());
        }
        lock_queue(&self.shared).push_back(buffer);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Drop every queued buffer and halt the one playing. Returns how many
    /// queued (not yet started) buffers were dropped.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut queue = lock_queue(&self.shared);
            let dropped = queue.len();
            queue.clear();
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            dropped
        };
        self.shared.wake.notify_one();
        if dropped > 0 {
            debug!(dropped, "Playback queue cleared");
        }
        dropped
    }

    /// Clear and release the output. The output channel closes once this returns.
    pub async fn stop(&self) {
        self.clear();
        self.shared.stop.cancel();
        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("Playback task panicked: {}", e);
                }
            }
        }
    }

    pub fn queued_len(&self) -> usize {
        lock_queue(&self.shared).len()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_cancelled()
    }
}

fn lock_queue(shared: &PlaybackShared) -> std::sync::MutexGuard<'_, VecDeque<PlaybackBuffer>> {
    // A poisoned queue only means a panic mid-push; the data is still a valid deque.
    shared.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_player(shared: Arc<PlaybackShared>, output: mpsc::Sender<PlaybackFrame>, frame_ms: u32) {
    let mut deadline = Instant::now();

    loop {
        // The generation is read under the queue lock so a clear that lands
        // after the pop still abandons this buffer.
        let (buffer, generation) = loop {
            let next = {
                let mut queue = lock_queue(&shared);
                queue
                    .pop_front()
                    .map(|buffer| (buffer, shared.generation.load(Ordering::SeqCst)))
            };
            if let Some(next) = next {
                break next;
            }
            tokio::select! {
                _ = shared.stop.cancelled() => return,
                _ = shared.wake.notified() => {}
            }
        };

        let now = Instant::now();
        if deadline < now {
            deadline = now;
        }

        let channels = usize::from(buffer.channels.max(1));
        let frames_per_slice = (buffer.sample_rate as usize * frame_ms as usize / 1000).max(1);
        shared.playing.store(true, Ordering::SeqCst);

        for slice in buffer.samples.chunks(frames_per_slice * channels) {
            tokio::select! {
                _ = shared.stop.cancelled() => {
                    shared.playing.store(false, Ordering::SeqCst);
                    return;
                }
                _ = sleep_until(deadline) => {}
            }
            if shared.generation.load(Ordering::SeqCst) != generation {
                deadline = Instant::now();
                break;
            }

            let frame = PlaybackFrame {
                samples: slice.to_vec(),
                sample_rate: buffer.sample_rate,
                channels: buffer.channels,
                echo: buffer.echo,
            };
            tokio::select! {
                _ = shared.stop.cancelled() => {
                    shared.playing.store(false, Ordering::SeqCst);
                    return;
                }
                sent = output.send(frame) => {
                    if sent.is_err() {
                        shared.playing.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }

            let frames = slice.len() / channels;
            deadline += Duration::from_secs_f64(frames as f64 / f64::from(buffer.sample_rate));
        }

        shared.playing.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(len: usize, value: f32) -> PlaybackBuffer {
        PlaybackBuffer::mono(vec![value; len], 1000)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<PlaybackFrame>) -> Option<PlaybackFrame> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_buffers_play_in_enqueue_order() {
        let (tx, mut rx) = mpsc::channel(64);
        let sink = AudioPlaybackSink::start(tx, 20);

        // 40 ms each at 1 kHz: two frames per buffer.
        sink.enqueue(buffer(40, 0.1)).unwrap();
        sink.enqueue(buffer(40, 0.2)).unwrap();
        sink.enqueue(buffer(40, 0.3)).unwrap();

        let mut values = Vec::new();
        for _ in 0..6 {
            let frame = next_frame(&mut rx).await.expect("frame");
            assert_eq!(frame.samples.len(), 20);
            values.push(frame.samples[0]);
        }
        assert_eq!(values, vec![0.1, 0.1, 0.2, 0.2, 0.3, 0.3]);
        sink.stop().await;
    }

    #[tokio::test]
    async fn test_consecutive_buffers_are_paced_back_to_back() {
        let (tx, mut rx) = mpsc::channel(64);
        let sink = AudioPlaybackSink::start(tx, 20);
        let started = Instant::now();

        sink.enqueue(buffer(100, 0.1)).unwrap();
        sink.enqueue(buffer(100, 0.2)).unwrap();

        let mut last = None;
        for _ in 0..10 {
            last = next_frame(&mut rx).await;
        }
        assert!(last.is_some());
        // The tenth frame starts 180 ms in; it must not arrive before its slot.
        assert!(started.elapsed() >= Duration::from_millis(170));
        sink.stop().await;
    }

    #[tokio::test]
    async fn test_clear_drops_queued_buffers_and_silences_output() {
        let (tx, mut rx) = mpsc::channel(64);
        let sink = AudioPlaybackSink::start(tx, 20);

        // One buffer starts playing, three wait in the queue.
        for value in [0.1, 0.2, 0.3, 0.4] {
            sink.enqueue(buffer(1000, value)).unwrap();
        }
        let first = next_frame(&mut rx).await.expect("first frame");
        assert_eq!(first.samples[0], 0.1);
        assert_eq!(sink.queued_len(), 3);

        assert_eq!(sink.clear(), 3);
        assert_eq!(sink.queued_len(), 0);

        // Discard at most a frame already in flight, then expect silence.
        tokio::time::sleep(Duration::from_millis(60)).await;
        while rx.try_recv().is_ok() {}
        let silence = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(silence.is_err(), "audio kept playing after clear");
        assert!(!sink.is_playing());

        // A fresh buffer plays again.
        sink.enqueue(buffer(20, 0.9)).unwrap();
        let resumed = next_frame(&mut rx).await.expect("resumed frame");
        assert_eq!(resumed.samples[0], 0.9);
        sink.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_clear_right_after_enqueue_plays_nothing_more() {
        for _ in 0..20 {
            let (tx, mut rx) = mpsc::channel(64);
            let sink = AudioPlaybackSink::start(tx, 20);

            // 2 s of audio; left uncleared it would release ten frames in 200 ms.
            sink.enqueue(buffer(2000, 0.4)).unwrap();
            sink.clear();

            tokio::time::sleep(Duration::from_millis(200)).await;
            let mut released = 0;
            while rx.try_recv().is_ok() {
                released += 1;
            }
            // Only a frame already handed out before the clear may arrive.
            assert!(released <= 1, "{} frames played after clear", released);
            sink.stop().await;
        }
    }

    #[tokio::test]
    async fn test_stop_closes_output_and_rejects_enqueue() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = AudioPlaybackSink::start(tx, 20);
        sink.enqueue(buffer(1000, 0.5)).unwrap();

        sink.stop().await;
        assert!(sink.is_stopped());
        assert_eq!(sink.enqueue(buffer(10, 0.5)), Err(PlaybackError::Stopped));

        while rx.recv().await.is_some() {}
    }
}
