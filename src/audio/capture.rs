//! # Capture Pipeline
//!
//! Turns a live microphone signal into fixed-size 16 kHz PCM16 frames and hands
//! each one to a callback as soon as it is complete.
//!
//! ## Flow:
//! ```text
//! AudioInput (device thread) --blocks--> pipeline task --Bytes--> on_frame
//!                                              |
//!                                              +--> level (watch, advisory)
//! ```
//!
//! At most one partial frame is held locally. The level meter is published
//! through a `watch` channel, so a slow UI never delays frame emission.

use crate::audio::codec;
use crate::error::RelayError;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sample blocks the device may queue ahead of the pipeline task.
const DEVICE_QUEUE_BLOCKS: usize = 8;

/// A source of mono 16 kHz samples.
///
/// Implementations push blocks of any size into `sink` from whatever thread
/// the device uses. Blocks that do not fit are dropped by the device side.
pub trait AudioInput: Send {
    /// Acquire the device and start delivering blocks.
    fn open(&mut self, sink: mpsc::Sender<Vec<i16>>) -> Result<(), RelayError>;

    /// Release the device. No blocks are delivered after this returns.
    fn close(&mut self);
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Frames microphone input at a fixed sample count.
pub struct CapturePipeline<I: AudioInput> {
    input: I,
    frame_samples: usize,
    level_tx: watch::Sender<f32>,
    running: Option<Running>,
}

impl<I: AudioInput> CapturePipeline<I> {
    /// `frame_samples` sets the cadence: 1600 = 100 ms, 4000 = 250 ms at 16 kHz.
    pub fn new(input: I, frame_samples: usize) -> Self {
        let (level_tx, _) = watch::channel(0.0);
        Self {
            input,
            frame_samples: frame_samples.max(1),
            level_tx,
            running: None,
        }
    }

    /// Coarse RMS level of the most recent frame, in `[0.0, 1.0]`.
    pub fn level(&self) -> watch::Receiver<f32> {
        self.level_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Open the device and emit frames to `on_frame` until [`stop`](Self::stop).
    ///
    /// Device failures surface as `CaptureUnavailable`; there is no retry.
    pub fn start<F>(&mut self, mut on_frame: F) -> Result<(), RelayError>
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        if self.running.is_some() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<Vec<i16>>(DEVICE_QUEUE_BLOCKS);
        self.input.open(tx)?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let frame_samples = self.frame_samples;
        let level_tx = self.level_tx.clone();

        let task = tokio::spawn(async move {
            let mut partial: Vec<i16> = Vec::with_capacity(frame_samples);
            let mut frames: u64 = 0;

            loop {
                let block = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    block = rx.recv() => match block {
                        Some(block) => block,
                        None => {
                            warn!("Capture device stopped delivering audio");
                            break;
                        }
                    },
                };

                let mut rest = block.as_slice();
                while !rest.is_empty() {
                    let take = (frame_samples - partial.len()).min(rest.len());
                    partial.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];

                    if partial.len() == frame_samples {
                        level_tx.send_replace(codec::rms_level(&partial));
                        on_frame(codec::encode(&partial));
                        partial.clear();
                        frames += 1;
                    }
                }
            }

            debug!(frames, "Capture task finished");
        });

        info!(frame_samples, "Capture started");
        self.running = Some(Running { cancel, task });
        Ok(())
    }

    /// Stop emitting and release the device.
    ///
    /// Once this returns, `on_frame` is never called again. A trailing partial
    /// frame is discarded.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(err) = running.task.await {
            warn!(error = %err, "Capture task ended abnormally");
        }
        self.input.close();
        self.level_tx.send_replace(0.0);
        info!("Capture stopped");
    }
}
