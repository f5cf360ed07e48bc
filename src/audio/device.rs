//! # Audio Devices
//!
//! cpal-backed implementations of [`AudioInput`] and [`Renderer`] for the
//! desktop client. Each device stream lives on its own thread, which owns the
//! cpal `Stream` for its whole life and drops it when asked to stop.

use crate::audio::capture::AudioInput;
use crate::audio::codec::{self, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::audio::playback::{PlaybackBuffer, Renderer};
use crate::error::RelayError;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig, SupportedStreamConfigRange};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

fn supports_rate(range: &SupportedStreamConfigRange, rate: u32) -> bool {
    range.min_sample_rate().0 <= rate
        && range.max_sample_rate().0 >= rate
        && matches!(range.sample_format(), SampleFormat::F32 | SampleFormat::I16)
}

/// Keeps a stream thread alive until `running` is cleared.
struct StreamThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Default microphone, captured at 16 kHz and downmixed to mono.
#[derive(Default)]
pub struct CpalInput {
    stream: Option<StreamThread>,
}

impl CpalInput {
    pub fn new() -> Self {
        Self::default()
    }
}

fn downmix<T: Copy>(data: &[T], channels: usize, to_i16: impl Fn(T) -> i16) -> Vec<i16> {
    data.chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| to_i16(s) as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

impl AudioInput for CpalInput {
    fn open(&mut self, sink: mpsc::Sender<Vec<i16>>) -> Result<(), RelayError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| RelayError::CaptureUnavailable("no input device".into()))?;
        let range = device
            .supported_input_configs()
            .map_err(|e| RelayError::CaptureUnavailable(e.to_string()))?
            .find(|range| supports_rate(range, INPUT_SAMPLE_RATE))
            .ok_or_else(|| {
                RelayError::CaptureUnavailable(format!(
                    "input device has no {} Hz configuration",
                    INPUT_SAMPLE_RATE
                ))
            })?;
        let supported = range.with_sample_rate(SampleRate(INPUT_SAMPLE_RATE));
        let format = supported.sample_format();
        let config: StreamConfig = supported.config();
        let channels = config.channels.max(1) as usize;

        let running = Arc::new(AtomicBool::new(true));
        let keep_running = running.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), RelayError>>();

        let handle = thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || {
                let on_error = |err: cpal::StreamError| error!(error = %err, "Capture stream error");
                let stream = match format {
                    SampleFormat::I16 => {
                        let sink = sink.clone();
                        device.build_input_stream(
                            &config,
                            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                                let _ = sink.try_send(downmix(data, channels, |s| s));
                            },
                            on_error,
                            None,
                        )
                    }
                    _ => device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            let _ = sink.try_send(downmix(data, channels, codec::f32_to_sample));
                        },
                        on_error,
                        None,
                    ),
                };

                let stream = match stream.map_err(|e| e.to_string()).and_then(|s| {
                    s.play().map_err(|e| e.to_string())?;
                    Ok(s)
                }) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(RelayError::CaptureUnavailable(err)));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                while keep_running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                drop(stream);
            })
            .map_err(|e| RelayError::CaptureUnavailable(e.to_string()))?;

        let mut stream = StreamThread {
            running,
            handle: Some(handle),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(channels, "Microphone opened at {} Hz", INPUT_SAMPLE_RATE);
                self.stream = Some(stream);
                Ok(())
            }
            Ok(Err(err)) => {
                stream.stop();
                Err(err)
            }
            Err(_) => {
                stream.stop();
                Err(RelayError::CaptureUnavailable("capture thread exited".into()))
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            info!("Microphone released");
        }
    }
}

struct OutputState {
    samples: VecDeque<f32>,
    done: Option<oneshot::Sender<()>>,
}

impl OutputState {
    fn next_sample(&mut self) -> f32 {
        match self.samples.pop_front() {
            Some(sample) => sample,
            None => {
                if let Some(done) = self.done.take() {
                    let _ = done.send(());
                }
                0.0
            }
        }
    }
}

/// Default speaker at the 24 kHz upstream rate.
pub struct CpalRenderer {
    state: Arc<Mutex<OutputState>>,
    _stream: StreamThread,
}

impl CpalRenderer {
    pub fn open() -> Result<Self, RelayError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| RelayError::Render("no output device".into()))?;
        let range = device
            .supported_output_configs()
            .map_err(|e| RelayError::Render(e.to_string()))?
            .find(|range| supports_rate(range, OUTPUT_SAMPLE_RATE))
            .ok_or_else(|| {
                RelayError::Render(format!(
                    "output device has no {} Hz configuration",
                    OUTPUT_SAMPLE_RATE
                ))
            })?;
        let supported = range.with_sample_rate(SampleRate(OUTPUT_SAMPLE_RATE));
        let format = supported.sample_format();
        let config: StreamConfig = supported.config();
        let channels = config.channels.max(1) as usize;

        let state = Arc::new(Mutex::new(OutputState {
            samples: VecDeque::new(),
            done: None,
        }));
        let running = Arc::new(AtomicBool::new(true));
        let keep_running = running.clone();
        let shared = state.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();

        let handle = thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || {
                let on_error = |err: cpal::StreamError| error!(error = %err, "Playback stream error");
                let stream = match format {
                    SampleFormat::I16 => device.build_output_stream(
                        &config,
                        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                            let mut state = shared.lock().unwrap_or_else(|p| p.into_inner());
                            for frame in data.chunks_mut(channels) {
                                frame.fill(codec::f32_to_sample(state.next_sample()));
                            }
                        },
                        on_error,
                        None,
                    ),
                    _ => device.build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            let mut state = shared.lock().unwrap_or_else(|p| p.into_inner());
                            for frame in data.chunks_mut(channels) {
                                frame.fill(state.next_sample());
                            }
                        },
                        on_error,
                        None,
                    ),
                };

                let stream = match stream.map_err(|e| e.to_string()).and_then(|s| {
                    s.play().map_err(|e| e.to_string())?;
                    Ok(s)
                }) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                while keep_running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                drop(stream);
            })
            .map_err(|e| RelayError::Render(e.to_string()))?;

        let mut stream = StreamThread {
            running,
            handle: Some(handle),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(channels, "Speaker opened at {} Hz", OUTPUT_SAMPLE_RATE);
                Ok(Self {
                    state,
                    _stream: stream,
                })
            }
            Ok(Err(err)) => {
                stream.stop();
                Err(RelayError::Render(err))
            }
            Err(_) => {
                stream.stop();
                Err(RelayError::Render("playback thread exited".into()))
            }
        }
    }
}

#[async_trait]
impl Renderer for CpalRenderer {
    async fn render(&mut self, buffer: PlaybackBuffer) -> Result<(), RelayError> {
        if buffer.sample_rate != OUTPUT_SAMPLE_RATE {
            warn!(rate = buffer.sample_rate, "Rendering buffer at unexpected rate");
        }

        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.samples.extend(buffer.samples);
            state.done = Some(done_tx);
        }

        done_rx
            .await
            .map_err(|_| RelayError::Render("output stream stopped".into()))
    }
}
