//! # Client Audio WebSocket
//!
//! `GET /ws/audio/{client_id}` upgrades to a binary WebSocket and becomes one
//! relay session.
//!
//! ## Connection Lifecycle:
//! 1. **Registration**: the session is created in the registry *before* the
//!    upgrade. A live session for the same id answers 409, a full registry 503.
//! 2. **Upgrade**: an actor takes over the socket.
//! 3. **Relay**: `run_session` is spawned with a [`Link`] over the actor:
//!    inbound frames flow through a bounded channel, outbound frames and the
//!    final close go through actor messages. When the channel is full the
//!    actor stops reading the socket until the relay catches up; only a stall
//!    longer than the write timeout ends the session with `Backpressure`.
//! 4. **Close**: the relay closes the socket with a code matching the reason.
//!
//! ## Message Format:
//! - **Client → Server**: binary PCM16 LE mono 16 kHz, one frame per message
//! - **Server → Client**: binary PCM16 LE mono 24 kHz, one frame per message
//! - Text messages are not part of the protocol and are ignored

use crate::config::RelayConfig;
use crate::error::{AppError, RelayError};
use crate::relay::{run_session, CloseReason, FrameReader, FrameWriter, Link, RelaySettings, Session};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

/// WebSocket close code for each way a session can end.
pub fn close_code(reason: CloseReason) -> ws::CloseCode {
    match reason {
        CloseReason::ClientClosed | CloseReason::StopRequested => ws::CloseCode::Normal,
        CloseReason::UpstreamUnavailable => ws::CloseCode::Error,
        CloseReason::Backpressure => ws::CloseCode::Again,
        CloseReason::UnstableStream => ws::CloseCode::Invalid,
        CloseReason::Idle => ws::CloseCode::Away,
    }
}

fn close_frame(reason: CloseReason) -> ws::CloseReason {
    ws::CloseReason {
        code: close_code(reason),
        description: Some(reason.as_str().to_string()),
    }
}

/// Actor owning one client socket.
///
/// ## Rust Concepts:
/// - **Option<mpsc::Sender>**: dropping the sender is how the relay learns the
///   client went away; `None` means the inbound side is already finished
/// - **Arc<Session>**: lets the actor report a stalled queue as the close reason
/// - **ctx.wait**: pauses the socket stream while a frame waits for queue room
pub struct ClientSocket {
    client_id: String,
    session: Arc<Session>,
    inbound: Option<mpsc::Sender<Bytes>>,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    mailbox_capacity: usize,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl ClientSocket {
    fn new(
        session: Arc<Session>,
        inbound: mpsc::Sender<Bytes>,
        relay: &RelayConfig,
        settings: &RelaySettings,
    ) -> Self {
        Self {
            client_id: session.client_id().to_string(),
            session,
            inbound: Some(inbound),
            last_heartbeat: Instant::now(),
            heartbeat_interval: Duration::from_secs(relay.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(relay.client_timeout_secs),
            mailbox_capacity: relay.frame_queue_depth.max(1),
            connect_timeout: settings.connect_timeout,
            write_timeout: settings.write_timeout,
        }
    }

    /// How long a full queue may hold the socket. The relay only starts
    /// reading once upstream is connected, so connecting counts too.
    fn queue_wait(&self) -> Duration {
        if self.session.was_activated() {
            self.write_timeout
        } else {
            self.connect_timeout + self.write_timeout
        }
    }

    fn handle_audio(&mut self, data: Bytes, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(inbound) = &self.inbound else {
            return;
        };

        let frame = match inbound.try_send(data) {
            Ok(()) => return,
            Err(TrySendError::Closed(_)) => {
                self.inbound = None;
                return;
            }
            Err(TrySendError::Full(frame)) => frame,
        };

        let inbound = inbound.clone();
        let bound = self.queue_wait();
        debug!(client_id = %self.client_id, bytes = frame.len(), "Inbound queue full, pausing reads");

        // No further socket messages are handled until this resolves.
        ctx.wait(
            async move { tokio::time::timeout(bound, inbound.send(frame)).await }
                .into_actor(self)
                .map(move |queued, act, _ctx| match queued {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => act.inbound = None,
                    Err(_) => {
                        warn!(
                            client_id = %act.client_id,
                            waited_ms = bound.as_millis() as u64,
                            "Client is sending faster than upstream accepts"
                        );
                        act.session.begin_closing(CloseReason::Backpressure);
                        act.inbound = None;
                    }
                }),
        );
    }
}

/// Outbound audio frame for the client.
#[derive(Message)]
#[rtype(result = "()")]
struct OutboundAudio(Bytes);

/// Close the socket with the session's close reason.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseClient(CloseReason);

impl Actor for ClientSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, "Client connected");

        // Bounded outbound mailbox: a client that stops reading stalls the
        // relay's writes until the write timeout fires.
        ctx.set_mailbox_capacity(self.mailbox_capacity);

        let client_timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                warn!(client_id = %act.client_id, "Client heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Ends the client→upstream direction if the relay is still running.
        self.inbound = None;
        info!(client_id = %self.client_id, "Client connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_audio(data, ctx);
            }
            Ok(ws::Message::Text(text)) => {
                debug!(client_id = %self.client_id, len = text.len(), "Ignoring text message");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(client_id = %self.client_id, reason = ?reason, "Client closed connection");
                self.inbound = None;
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(client_id = %self.client_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(client_id = %self.client_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<OutboundAudio> for ClientSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundAudio, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
    }
}

impl Handler<CloseClient> for ClientSocket {
    type Result = ();

    fn handle(&mut self, msg: CloseClient, ctx: &mut Self::Context) {
        debug!(client_id = %self.client_id, reason = %msg.0, "Closing client socket");
        self.inbound = None;
        ctx.close(Some(close_frame(msg.0)));
        ctx.stop();
    }
}

/// Inbound side: frames the actor queued.
struct ActorReader {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl FrameReader for ActorReader {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, RelayError> {
        Ok(self.rx.recv().await)
    }
}

/// Outbound side: messages to the actor. `send` waits for mailbox room.
struct ActorWriter {
    addr: Addr<ClientSocket>,
}

#[async_trait]
impl FrameWriter for ActorWriter {
    async fn send_frame(&self, frame: Bytes) -> Result<(), RelayError> {
        self.addr
            .send(OutboundAudio(frame))
            .await
            .map_err(|e| RelayError::TransportClosed(e.to_string()))
    }

    async fn close(&self, reason: CloseReason) {
        // The actor may already be gone; nothing left to close then.
        if self.addr.connected() {
            self.addr.do_send(CloseClient(reason));
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Registration happens first so a rejected client gets a plain HTTP error
/// instead of an upgraded socket that is immediately closed.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let client_id = path.into_inner();
    info!(
        client_id = %client_id,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );

    let config = app_state.get_config();
    let session = app_state
        .registry
        .create(&client_id)
        .await
        .map_err(AppError::from)?;

    let settings = config.relay_settings();
    let (tx, rx) = mpsc::channel(config.relay.frame_queue_depth.max(1));
    let actor = ClientSocket::new(session.clone(), tx, &config.relay, &settings);

    let (addr, response) = match ws::WsResponseBuilder::new(actor, &req, stream).start_with_addr() {
        Ok(started) => started,
        Err(err) => {
            warn!(client_id = %client_id, error = %err, "WebSocket upgrade failed");
            session.begin_closing(CloseReason::ClientClosed);
            app_state.registry.release(&session).await;
            return Err(err);
        }
    };

    let client = Link::new(ActorReader { rx }, ActorWriter { addr });
    tokio::spawn(run_session(
        session,
        client,
        app_state.connector.clone(),
        app_state.registry.clone(),
        settings,
    ));

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec;
    use crate::config::AppConfig;
    use crate::relay::link::testing::{channel_link, Peer, ScriptedConnector};
    use crate::relay::SessionState;
    use actix_web::{dev::ServerHandle, http::StatusCode, test, App, HttpServer};
    use futures_util::{SinkExt, Stream, StreamExt};
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};

    const WAIT: Duration = Duration::from_secs(3);

    fn app_state(max_sessions: usize) -> web::Data<AppState> {
        let mut config = AppConfig::default();
        config.relay.max_concurrent_sessions = max_sessions;
        web::Data::new(AppState::new(config, Arc::new(ScriptedConnector::failing())))
    }

    /// Serve the audio endpoint on an ephemeral port; returns the ws base URL.
    fn serve(state: web::Data<AppState>) -> (String, ServerHandle) {
        let server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .route("/ws/audio/{client_id}", web::get().to(audio_websocket))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);
        (format!("ws://{}/ws/audio", addr), handle)
    }

    fn relay_state(upstream: Link, config: AppConfig) -> web::Data<AppState> {
        web::Data::new(AppState::new(config, Arc::new(ScriptedConnector::with_link(upstream))))
    }

    /// 4096 samples of a 440 Hz tone at 16 kHz, starting at sample `offset`.
    fn sine_frame(offset: usize) -> Bytes {
        let samples: Vec<i16> = (offset..offset + 4096)
            .map(|n| {
                let t = n as f32 / 16_000.0;
                ((2.0 * std::f32::consts::PI * 440.0 * t).sin() * 12_000.0) as i16
            })
            .collect();
        codec::encode(&samples)
    }

    async fn active_session(state: &AppState, client_id: &str) -> Arc<Session> {
        timeout(WAIT, async {
            loop {
                if let Some(session) = state.registry.lookup(client_id).await {
                    if session.state() == SessionState::Active {
                        return session;
                    }
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session never became active")
    }

    async fn upstream_frames(peer: &Peer, count: usize) -> Vec<Bytes> {
        timeout(WAIT, async {
            loop {
                let frames = peer.outbound.frames();
                if frames.len() >= count {
                    return frames;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("frames never reached upstream")
    }

    async fn next_binary<S>(socket: &mut S) -> Vec<u8>
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            match socket.next().await {
                Some(Ok(Message::Binary(data))) => return data,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("expected audio, got {:?}", other),
            }
        }
    }

    async fn next_close<S>(socket: &mut S) -> Option<CloseFrame<'static>>
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        while let Some(message) = socket.next().await {
            if let Ok(Message::Close(frame)) = message {
                return frame;
            }
        }
        None
    }

    #[actix_web::test]
    async fn test_close_codes() {
        assert_eq!(u16::from(close_code(CloseReason::ClientClosed)), 1000);
        assert_eq!(u16::from(close_code(CloseReason::StopRequested)), 1000);
        assert_eq!(u16::from(close_code(CloseReason::Idle)), 1001);
        assert_eq!(u16::from(close_code(CloseReason::UnstableStream)), 1007);
        assert_eq!(u16::from(close_code(CloseReason::UpstreamUnavailable)), 1011);
        assert_eq!(u16::from(close_code(CloseReason::Backpressure)), 1013);
        assert_eq!(
            close_frame(CloseReason::Idle).description.as_deref(),
            Some("idle")
        );
    }

    #[actix_web::test]
    async fn test_duplicate_client_gets_conflict() {
        let state = app_state(8);
        let existing = state.registry.create("alice").await.unwrap();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/ws/audio/{client_id}", web::get().to(audio_websocket)),
        )
        .await;

        let req = test::TestRequest::get().uri("/ws/audio/alice").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(existing.close_reason().is_none());
        assert_eq!(state.registry.active_count().await, 1);
    }

    #[actix_web::test]
    async fn test_full_registry_gets_unavailable() {
        let state = app_state(1);
        state.registry.create("alice").await.unwrap();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/ws/audio/{client_id}", web::get().to(audio_websocket)),
        )
        .await;

        let req = test::TestRequest::get().uri("/ws/audio/bob").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn test_failed_upgrade_releases_session() {
        let state = app_state(8);
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/ws/audio/{client_id}", web::get().to(audio_websocket)),
        )
        .await;

        // Plain GET without upgrade headers.
        let req = test::TestRequest::get().uri("/ws/audio/carol").to_request();
        let resp = test::call_service(&app, req).await;

        assert!(resp.status().is_client_error());
        assert_eq!(state.registry.active_count().await, 0);
        assert_eq!(state.registry.stats().await.closed, 1);
    }
    #[actix_web::test]
    async fn test_socket_burst_reaches_upstream_and_replies_reach_client() {
        let (upstream, peer) = channel_link(None);
        let state = relay_state(upstream, AppConfig::default());
        let (base, server) = serve(state.clone());

        let (mut socket, _) = connect_async(format!("{}/alice", base)).await.unwrap();
        let session = active_session(&state, "alice").await;

        // Three frames in one write, more than the inbound queue holds.
        let frames: Vec<Bytes> = (0..3).map(|i| sine_frame(i * 4096)).collect();
        for frame in &frames {
            socket.feed(Message::Binary(frame.to_vec())).await.unwrap();
        }
        socket.flush().await.unwrap();

        assert_eq!(upstream_frames(&peer, 3).await, frames);
        assert!(session.close_reason().is_none());

        let replies = [Bytes::from(vec![1u8; 4800]), Bytes::from(vec![2u8; 4800])];
        for reply in &replies {
            peer.send(reply.clone()).await;
        }
        for reply in &replies {
            let received = timeout(WAIT, next_binary(&mut socket)).await.unwrap();
            assert_eq!(received, reply.to_vec());
        }

        socket.close(None).await.unwrap();
        timeout(WAIT, session.closed()).await.unwrap();
        assert_eq!(session.close_reason(), Some(CloseReason::ClientClosed));
        assert_eq!(peer.outbound.closes(), vec![CloseReason::ClientClosed]);
        assert_eq!(state.registry.active_count().await, 0);

        server.stop(false).await;
    }

    #[actix_web::test]
    async fn test_burst_beyond_single_slot_queue_is_held_not_dropped() {
        let (upstream, peer) = channel_link(Some(Duration::from_millis(20)));
        let mut config = AppConfig::default();
        config.relay.frame_queue_depth = 1;
        let state = relay_state(upstream, config);
        let (base, server) = serve(state.clone());

        let (mut socket, _) = connect_async(format!("{}/bob", base)).await.unwrap();
        let session = active_session(&state, "bob").await;

        let frames: Vec<Bytes> = (0..6).map(|i| sine_frame(i * 4096)).collect();
        for frame in &frames {
            socket.feed(Message::Binary(frame.to_vec())).await.unwrap();
        }
        socket.flush().await.unwrap();

        assert_eq!(upstream_frames(&peer, 6).await, frames);
        assert!(session.close_reason().is_none());

        server.stop(false).await;
    }

    #[actix_web::test]
    async fn test_sustained_backpressure_closes_with_1013() {
        let (upstream, _peer) = channel_link(Some(Duration::from_secs(2)));
        let mut config = AppConfig::default();
        config.relay.write_timeout_ms = 100;
        let state = relay_state(upstream, config);
        let (base, server) = serve(state.clone());

        let (mut socket, _) = connect_async(format!("{}/carol", base)).await.unwrap();
        let session = active_session(&state, "carol").await;

        for i in 0..6 {
            socket.feed(Message::Binary(sine_frame(i * 4096).to_vec())).await.unwrap();
        }
        socket.flush().await.unwrap();

        let frame = timeout(WAIT, next_close(&mut socket))
            .await
            .unwrap()
            .expect("close frame");
        assert_eq!(u16::from(frame.code), 1013);
        assert_eq!(frame.reason, "backpressure");
        assert_eq!(session.close_reason(), Some(CloseReason::Backpressure));

        timeout(WAIT, session.closed()).await.unwrap();
        assert_eq!(state.registry.active_count().await, 0);

        server.stop(false).await;
    }
}
