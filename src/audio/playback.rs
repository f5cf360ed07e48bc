//! # Playback Scheduler
//!
//! Turns received 24 kHz frames into audible output, strictly one at a time.
//!
//! ## Invariants:
//! - Frames render in arrival order; nothing is reordered or dropped while the
//!   output keeps working.
//! - **At most one render is in flight.** The `draining` flag is set under the
//!   queue lock before a drain starts and cleared under the same lock only when
//!   the queue is observed empty, so an `enqueue` racing with the end of a drain
//!   either lands in the running drain or starts the next one.
//! - If the renderer fails, the drain stops and the flag is cleared; the next
//!   `enqueue` starts a fresh drain. Frames already popped are not replayed.

use crate::audio::codec::{self, OUTPUT_SAMPLE_RATE};
use crate::error::RelayError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, warn};

/// A decoded frame ready for an output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / self.sample_rate as u64)
    }
}

/// Audio output. `render` returns once the buffer has finished playing.
#[async_trait]
pub trait Renderer: Send + 'static {
    async fn render(&mut self, buffer: PlaybackBuffer) -> Result<(), RelayError>;
}

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub drains_started: u64,
    pub frames_rendered: u64,
    pub frames_skipped: u64,
    pub render_failures: u64,
}

struct QueueState {
    pending: VecDeque<Bytes>,
    draining: bool,
}

struct Inner<R> {
    queue: Mutex<QueueState>,
    renderer: AsyncMutex<R>,
    idle_tx: watch::Sender<bool>,
    sample_rate: u32,
    drains_started: AtomicU64,
    frames_rendered: AtomicU64,
    frames_skipped: AtomicU64,
    render_failures: AtomicU64,
}

impl<R> Inner<R> {
    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        // The lock is never held across an await or a panic-prone call, so a
        // poisoned guard still holds a consistent queue.
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Sequential FIFO player. Cloning gives another handle to the same queue.
pub struct PlaybackScheduler<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for PlaybackScheduler<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Renderer> PlaybackScheduler<R> {
    /// Scheduler for upstream audio at the fixed 24 kHz output rate.
    pub fn new(renderer: R) -> Self {
        Self::with_sample_rate(renderer, OUTPUT_SAMPLE_RATE)
    }

    pub fn with_sample_rate(renderer: R, sample_rate: u32) -> Self {
        let (idle_tx, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    draining: false,
                }),
                renderer: AsyncMutex::new(renderer),
                idle_tx,
                sample_rate,
                drains_started: AtomicU64::new(0),
                frames_rendered: AtomicU64::new(0),
                frames_skipped: AtomicU64::new(0),
                render_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Append a frame; start draining if nothing is rendering.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, frame: Bytes) {
        let start = {
            let mut queue = self.inner.lock_queue();
            queue.pending.push_back(frame);
            if queue.draining {
                false
            } else {
                queue.draining = true;
                self.inner.idle_tx.send_replace(false);
                true
            }
        };

        if start {
            self.inner.drains_started.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(drain(self.inner.clone()));
        }
    }

    /// Frames waiting behind the one currently rendering.
    pub fn pending(&self) -> usize {
        self.inner.lock_queue().pending.len()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.lock_queue().draining
    }

    /// Resolve once the queue is empty and no render is in flight.
    pub async fn wait_idle(&self) {
        let mut idle = self.inner.idle_tx.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Drop every frame that has not started rendering yet.
    pub fn clear(&self) -> usize {
        let mut queue = self.inner.lock_queue();
        let dropped = queue.pending.len();
        queue.pending.clear();
        dropped
    }

    pub fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            drains_started: self.inner.drains_started.load(Ordering::Relaxed),
            frames_rendered: self.inner.frames_rendered.load(Ordering::Relaxed),
            frames_skipped: self.inner.frames_skipped.load(Ordering::Relaxed),
            render_failures: self.inner.render_failures.load(Ordering::Relaxed),
        }
    }
}

async fn drain<R: Renderer>(inner: Arc<Inner<R>>) {
    let mut renderer = inner.renderer.lock().await;

    loop {
        let frame = {
            let mut queue = inner.lock_queue();
            match queue.pending.pop_front() {
                Some(frame) => frame,
                None => {
                    queue.draining = false;
                    inner.idle_tx.send_replace(true);
                    return;
                }
            }
        };

        let samples = match codec::decode_to_f32(&frame) {
            Ok(samples) => samples,
            Err(err) => {
                warn!(error = %err, "Skipping unplayable frame");
                inner.frames_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        let buffer = PlaybackBuffer {
            samples,
            sample_rate: inner.sample_rate,
        };

        if let Err(err) = renderer.render(buffer).await {
            warn!(error = %err, "Playback render failed, halting drain");
            inner.render_failures.fetch_add(1, Ordering::Relaxed);
            let mut queue = inner.lock_queue();
            queue.draining = false;
            inner.idle_tx.send_replace(true);
            return;
        }

        inner.frames_rendered.fetch_add(1, Ordering::Relaxed);
        debug!(sample_rate = inner.sample_rate, "Frame rendered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::encode;
    use std::time::Instant;

    #[derive(Debug, Clone)]
    struct RenderRecord {
        first_sample: i16,
        started: Instant,
        finished: Instant,
    }

    /// Records the span of every render and optionally fails one of them.
    struct MockRenderer {
        log: Arc<Mutex<Vec<RenderRecord>>>,
        delay: Duration,
        fail_on: Option<i16>,
    }

    #[async_trait]
    impl Renderer for MockRenderer {
        async fn render(&mut self, buffer: PlaybackBuffer) -> Result<(), RelayError> {
            let first_sample = codec::f32_to_sample(buffer.samples[0]);
            let started = Instant::now();
            tokio::time::sleep(self.delay).await;
            if self.fail_on == Some(first_sample) {
                return Err(RelayError::Render("device unplugged".into()));
            }
            self.log.lock().unwrap().push(RenderRecord {
                first_sample,
                started,
                finished: Instant::now(),
            });
            Ok(())
        }
    }

    fn scheduler(delay_ms: u64, fail_on: Option<i16>) -> (PlaybackScheduler<MockRenderer>, Arc<Mutex<Vec<RenderRecord>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let renderer = MockRenderer {
            log: log.clone(),
            delay: Duration::from_millis(delay_ms),
            fail_on,
        };
        (PlaybackScheduler::new(renderer), log)
    }

    fn frame(marker: i16) -> Bytes {
        encode(&[marker; 240])
    }

    #[tokio::test]
    async fn test_renders_in_order_without_overlap() {
        let (player, log) = scheduler(20, None);

        player.enqueue(frame(1));
        player.enqueue(frame(2));
        player.enqueue(frame(3));
        player.wait_idle().await;

        let records = log.lock().unwrap().clone();
        let order: Vec<i16> = records.iter().map(|r| r.first_sample).collect();
        assert_eq!(order, vec![1, 2, 3]);
        for pair in records.windows(2) {
            assert!(pair[0].finished <= pair[1].started, "renders overlapped");
        }
        assert_eq!(player.stats().frames_rendered, 3);
    }

    #[tokio::test]
    async fn test_enqueue_during_drain_never_starts_second_drain() {
        let (player, log) = scheduler(15, None);

        player.enqueue(frame(1));
        for marker in 2..=6 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(player.is_draining());
            player.enqueue(frame(marker));
        }
        player.wait_idle().await;

        assert_eq!(player.stats().drains_started, 1);
        let order: Vec<i16> = log.lock().unwrap().iter().map(|r| r.first_sample).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_render_failure_halts_and_later_enqueue_restarts() {
        let (player, log) = scheduler(5, Some(2));

        player.enqueue(frame(1));
        player.enqueue(frame(2));
        player.enqueue(frame(3));
        player.wait_idle().await;

        // Frame 2 failed; frame 3 is still queued because the drain halted.
        assert!(!player.is_draining());
        assert_eq!(player.pending(), 1);
        assert_eq!(player.stats().render_failures, 1);

        player.enqueue(frame(4));
        player.wait_idle().await;

        let order: Vec<i16> = log.lock().unwrap().iter().map(|r| r.first_sample).collect();
        assert_eq!(order, vec![1, 3, 4]);
        assert_eq!(player.stats().drains_started, 2);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (player, log) = scheduler(1, None);

        player.enqueue(Bytes::from_static(&[1, 2, 3]));
        player.enqueue(frame(7));
        player.wait_idle().await;

        assert_eq!(player.stats().frames_skipped, 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_keeps_current_render() {
        let (player, log) = scheduler(30, None);

        player.enqueue(frame(1));
        player.enqueue(frame(2));
        player.enqueue(frame(3));
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Frame 1 is already rendering; only the queued ones go.
        assert_eq!(player.clear(), 2);
        player.wait_idle().await;

        let order: Vec<i16> = log.lock().unwrap().iter().map(|r| r.first_sample).collect();
        assert_eq!(order, vec![1]);
        assert!(!player.is_draining());
    }

    #[test]
    fn test_buffer_duration() {
        let buffer = PlaybackBuffer {
            samples: vec![0.0; 2400],
            sample_rate: OUTPUT_SAMPLE_RATE,
        };
        assert_eq!(buffer.duration(), Duration::from_millis(100));
    }
}
