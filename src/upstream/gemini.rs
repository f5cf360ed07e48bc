//! # Gemini Live Connector
//!
//! Opens one live session per relay session over a WebSocket and exposes it
//! as a [`Link`]: the writer turns each frame into a realtime audio message,
//! the reader yields the PCM payloads of server content in emission order.
//!
//! ## Handshake:
//! 1. Connect to `<url>?key=<api_key>`
//! 2. Send `setup` (model, response modality, system instruction)
//! 3. Wait for `setupComplete`; anything else before it is ignored
//!
//! The relay loop bounds the whole handshake with its connect timeout.

use crate::config::UpstreamConfig;
use crate::error::RelayError;
use crate::relay::link::{FrameReader, FrameWriter, Link, UpstreamConnector};
use crate::relay::session::CloseReason;
use crate::upstream::protocol::{self, ServerMessage};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector for the Gemini Live `BidiGenerateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    url: String,
    api_key: String,
    model: String,
    response_modality: String,
    system_instruction: String,
}

impl GeminiConnector {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            response_modality: config.response_modality.clone(),
            system_instruction: config.system_instruction.clone(),
        }
    }

    fn endpoint(&self) -> String {
        if self.api_key.is_empty() {
            return self.url.clone();
        }
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.url, separator, self.api_key)
    }
}

fn unavailable(err: impl std::fmt::Display) -> RelayError {
    RelayError::UpstreamUnavailable(err.to_string())
}

/// JSON text of a data message. The service may send JSON in binary frames.
fn message_text(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text),
        Message::Binary(data) => String::from_utf8(data).ok(),
        _ => None,
    }
}

#[async_trait]
impl UpstreamConnector for GeminiConnector {
    async fn connect(&self, client_id: &str) -> Result<Link, RelayError> {
        let (socket, _response) = connect_async(self.endpoint()).await.map_err(unavailable)?;
        let (mut sink, mut stream) = socket.split();

        let setup = protocol::setup_message(&self.model, &self.response_modality, &self.system_instruction)?;
        sink.send(Message::Text(setup)).await.map_err(unavailable)?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    return Err(unavailable(format!("closed during setup: {}", reason)));
                }
                Some(Ok(message)) => {
                    let Some(text) = message_text(message) else {
                        continue;
                    };
                    if protocol::parse(&text).map_err(unavailable)?.is_setup_complete() {
                        break;
                    }
                    debug!(client_id = %client_id, "Ignoring message before setup completed");
                }
                Some(Err(err)) => return Err(unavailable(err)),
                None => return Err(unavailable("connection ended during setup")),
            }
        }

        info!(client_id = %client_id, model = %self.model, "Upstream session established");
        Ok(Link::new(
            GeminiReader {
                client_id: client_id.to_string(),
                stream,
                pending: VecDeque::new(),
            },
            GeminiWriter {
                sink: Mutex::new(sink),
                closed: AtomicBool::new(false),
            },
        ))
    }
}

struct GeminiReader {
    client_id: String,
    stream: SplitStream<Socket>,
    /// Audio parts of the last message not yet handed out.
    pending: VecDeque<Bytes>,
}

impl GeminiReader {
    fn absorb(&mut self, message: ServerMessage) {
        match message.audio_chunks() {
            Ok(chunks) => self.pending.extend(chunks),
            Err(err) => warn!(client_id = %self.client_id, error = %err, "Dropping undecodable audio"),
        }

        if let Some(content) = &message.server_content {
            if content.interrupted {
                debug!(client_id = %self.client_id, "Model turn interrupted");
            }
            if content.turn_complete {
                debug!(client_id = %self.client_id, "Model turn complete");
            }
        }
        if let Some(go_away) = &message.go_away {
            warn!(
                client_id = %self.client_id,
                time_left = go_away.time_left.as_deref().unwrap_or("unknown"),
                "Upstream is going away"
            );
        }
    }
}

#[async_trait]
impl FrameReader for GeminiReader {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, RelayError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }

            let message = match self.stream.next().await {
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    info!(client_id = %self.client_id, reason = %reason, "Upstream closed the session");
                    return Ok(None);
                }
                Some(Ok(message)) => message,
                Some(Err(err)) => return Err(RelayError::TransportClosed(err.to_string())),
                None => return Ok(None),
            };

            let Some(text) = message_text(message) else {
                continue;
            };
            match protocol::parse(&text) {
                Ok(parsed) => self.absorb(parsed),
                Err(err) => warn!(client_id = %self.client_id, error = %err, "Ignoring unparseable message"),
            }
        }
    }
}

struct GeminiWriter {
    sink: Mutex<SplitSink<Socket, Message>>,
    closed: AtomicBool,
}

#[async_trait]
impl FrameWriter for GeminiWriter {
    async fn send_frame(&self, frame: Bytes) -> Result<(), RelayError> {
        let text = protocol::audio_input(&frame)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| RelayError::TransportClosed(e.to_string()))?;
        trace!(bytes = frame.len(), "Audio sent upstream");
        Ok(())
    }

    async fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.as_str().into(),
        };
        let mut sink = self.sink.lock().await;
        if let Err(err) = sink.send(Message::Close(Some(frame))).await {
            debug!(error = %err, "Upstream close frame not delivered");
        }
    }
}
