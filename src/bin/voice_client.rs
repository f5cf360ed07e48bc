//! # Voice Client
//!
//! Desktop reference client for the relay: streams the default microphone to
//! `/ws/audio/{client_id}` and plays whatever audio comes back.
//!
//! ```text
//! mic ─▶ CapturePipeline ─▶ WebSocket ─▶ relay ─▶ WebSocket ─▶ PlaybackScheduler ─▶ speaker
//! ```
//!
//! The client never reconnects on its own; when the relay closes the socket
//! the process logs the reason and exits.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use voice_relay::audio::device::{CpalInput, CpalRenderer};
use voice_relay::audio::{CapturePipeline, PlaybackScheduler};

/// Frames waiting for the socket; further frames are dropped while it is busy.
const SEND_QUEUE_FRAMES: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "voice-client", version, about = "Talk to the voice relay from a desktop")]
struct Args {
    /// Relay base URL
    #[arg(long, default_value = "ws://127.0.0.1:8000")]
    server: String,

    /// Client identifier; a random one is generated when omitted
    #[arg(long)]
    client_id: Option<String>,

    /// Samples per captured frame at 16 kHz
    #[arg(long, default_value_t = 2048)]
    frame_samples: usize,

    /// Hide the input level meter
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_client=info,voice_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let client_id = args.client_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let url = format!("{}/ws/audio/{}", args.server.trim_end_matches('/'), client_id);

    let (socket, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", url))?;
    info!(client_id = %client_id, "Connected to relay");
    let (mut sink, mut stream) = socket.split();

    let player = PlaybackScheduler::new(CpalRenderer::open()?);

    let (frame_tx, mut frame_rx) = mpsc::channel::<Bytes>(SEND_QUEUE_FRAMES);
    let mut capture = CapturePipeline::new(CpalInput::new(), args.frame_samples);
    capture.start(move |frame| {
        if frame_tx.try_send(frame).is_err() {
            warn!("Socket busy, dropping captured frame");
        }
    })?;
    let mut level = capture.level();

    let sender = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if let Err(e) = sink.send(Message::Binary(frame.to_vec())).await {
                warn!(error = %e, "Send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => player.enqueue(Bytes::from(data)),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| format!("{} ({})", f.reason, u16::from(f.code)));
                    info!(reason = reason.as_deref().unwrap_or("none"), "Relay closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "Connection error");
                    break;
                }
                None => break,
            },
            Ok(()) = level.changed(), if !args.quiet => {
                let bars = (*level.borrow_and_update() * 40.0).round() as usize;
                eprint!("\r[{:<40}]", "#".repeat(bars.min(40)));
                let _ = std::io::stderr().flush();
            }
            _ = &mut ctrl_c => {
                // Interrupting means the reply is not wanted anymore.
                let dropped = player.clear();
                info!(dropped, "Stopping");
                break;
            }
        }
    }

    // Stopping capture drops the frame sender, which closes the socket.
    capture.stop().await;
    if let Err(e) = sender.await {
        warn!(error = %e, "Sender task ended abnormally");
    }

    if tokio::time::timeout(Duration::from_secs(5), player.wait_idle()).await.is_err() {
        warn!(pending = player.pending(), "Playback still busy, exiting anyway");
    }
    eprintln!();
    Ok(())
}
