//! # Relay Loop
//!
//! Drives one session from `Connecting` to `Closed`: opens the upstream
//! connection, forwards frames in both directions, and tears both connections
//! down together.
//!
//! ## Flow:
//! ```text
//!            ┌──────── client→upstream task ────────┐
//! client ───▶│ read ─▶ guard ─▶ write (timeout)      │───▶ upstream
//!            └──────────────────────────────────────┘
//!            ┌──────── upstream→client task ────────┐
//! client ◀───│ write (timeout) ◀─ guard ◀─ read      │◀─── upstream
//!            └──────────────────────────────────────┘
//!                 both select on the session's cancellation token
//! ```
//!
//! ## Key Rules:
//! - Each direction has exactly one reader, so frames leave in the order they
//!   arrived. Payloads are forwarded byte-for-byte; the guard only inspects.
//! - The directions never wait on each other. The first one to end records its
//!   reason and cancels the token; the other stops at its next suspension point.
//! - A write that does not complete within `write_timeout` is sustained
//!   backpressure and ends the session.
//! - Every failure stays inside this session: it is logged with the client id
//!   and turned into a close reason, never propagated.

use crate::audio::codec;
use crate::error::RelayError;
use crate::relay::link::{FrameReader, FrameWriter, Link, UpstreamConnector};
use crate::relay::registry::SessionRegistry;
use crate::relay::session::{CloseReason, Session};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Timing and tolerance knobs for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// Upper bound for each teardown step (joining tasks, closing connections).
    pub teardown_grace: Duration,
    /// `None` disables the client idle timeout.
    pub idle_timeout: Option<Duration>,
    /// Consecutive malformed frames tolerated before the stream is declared
    /// unstable. 0 never tears down.
    pub malformed_frame_threshold: u32,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            teardown_grace: Duration::from_secs(2),
            idle_timeout: Some(Duration::from_secs(120)),
            malformed_frame_threshold: 5,
        }
    }
}

/// One of the two forwarding directions of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client_to_upstream",
            Direction::UpstreamToClient => "upstream_to_client",
        }
    }

    /// Reason used when the side this direction reads from goes away.
    fn source_closed(&self) -> CloseReason {
        match self {
            Direction::ClientToUpstream => CloseReason::ClientClosed,
            Direction::UpstreamToClient => CloseReason::UpstreamUnavailable,
        }
    }

    /// Reason used when the side this direction writes to fails.
    fn destination_failed(&self) -> CloseReason {
        match self {
            Direction::ClientToUpstream => CloseReason::UpstreamUnavailable,
            Direction::UpstreamToClient => CloseReason::ClientClosed,
        }
    }
}

/// What to do with an incoming payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVerdict {
    Forward,
    /// Zero-length payload; dropped without counting against the stream.
    Empty,
    /// Not a whole number of samples; dropped.
    Malformed,
    /// Malformed threshold reached.
    Unstable(u32),
}

/// Tracks consecutive malformed frames in one direction.
#[derive(Debug, Clone)]
pub struct FrameGuard {
    threshold: u32,
    consecutive: u32,
}

impl FrameGuard {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive: 0,
        }
    }

    pub fn check(&mut self, frame: &[u8]) -> FrameVerdict {
        if frame.is_empty() {
            return FrameVerdict::Empty;
        }
        match codec::sample_count(frame) {
            Ok(_) => {
                self.consecutive = 0;
                FrameVerdict::Forward
            }
            Err(_) => {
                self.consecutive += 1;
                if self.threshold > 0 && self.consecutive >= self.threshold {
                    FrameVerdict::Unstable(self.consecutive)
                } else {
                    FrameVerdict::Malformed
                }
            }
        }
    }
}

/// Run `session` to completion and return why it closed.
///
/// `client` is the already-accepted client connection. The upstream
/// connection is opened here, after the client. On return the session is
/// `Closed`, both connections are closed and the registry entry is gone.
pub async fn run_session(
    session: Arc<Session>,
    client: Link,
    connector: Arc<dyn UpstreamConnector>,
    registry: SessionRegistry,
    settings: RelaySettings,
) -> CloseReason {
    let span = info_span!("session", client_id = %session.client_id(), session = %session.id());
    drive(session, client, connector, registry, settings)
        .instrument(span)
        .await
}

async fn drive(
    session: Arc<Session>,
    client: Link,
    connector: Arc<dyn UpstreamConnector>,
    registry: SessionRegistry,
    settings: RelaySettings,
) -> CloseReason {
    let cancel = session.cancel_token();

    let connected = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = timeout(settings.connect_timeout, connector.connect(session.client_id())) => {
            Some(result.unwrap_or_else(|_| {
                Err(RelayError::UpstreamUnavailable(format!(
                    "no session within {} ms",
                    settings.connect_timeout.as_millis()
                )))
            }))
        }
    };

    let upstream = match connected {
        Some(Ok(link)) => link,
        Some(Err(err)) => {
            // Connecting → Closed, never Active.
            warn!(error = %err, "Upstream unavailable, closing client");
            session.begin_closing(CloseReason::UpstreamUnavailable);
            close_bounded(&client.writer, CloseReason::UpstreamUnavailable, settings.teardown_grace).await;
            registry.release(&session).await;
            return CloseReason::UpstreamUnavailable;
        }
        None => {
            let reason = session.close_reason().unwrap_or(CloseReason::StopRequested);
            info!(reason = %reason, "Session stopped while connecting");
            session.mark_closing();
            close_bounded(&client.writer, reason, settings.teardown_grace).await;
            registry.release(&session).await;
            return reason;
        }
    };

    session.activate();
    info!("Session active");

    let client_writer = client.writer.clone();
    let upstream_writer = upstream.writer.clone();

    let mut tasks = [
        spawn_direction(
            Direction::ClientToUpstream,
            client.reader,
            upstream.writer,
            session.clone(),
            settings,
        ),
        spawn_direction(
            Direction::UpstreamToClient,
            upstream.reader,
            client.writer,
            session.clone(),
            settings,
        ),
    ];

    cancel.cancelled().await;
    session.mark_closing();
    let reason = session.close_reason().unwrap_or(CloseReason::StopRequested);
    info!(reason = %reason, "Session closing");

    let joined = timeout(settings.teardown_grace, async {
        for task in tasks.iter_mut() {
            if let Err(err) = task.await {
                warn!(error = %err, "Forwarding task ended abnormally");
            }
        }
    })
    .await;
    if joined.is_err() {
        warn!("Forwarding tasks did not stop within the grace period, aborting");
        for task in &tasks {
            task.abort();
        }
    }

    tokio::join!(
        close_bounded(&upstream_writer, reason, settings.teardown_grace),
        close_bounded(&client_writer, reason, settings.teardown_grace),
    );
    registry.release(&session).await;
    reason
}

async fn close_bounded(writer: &Arc<dyn FrameWriter>, reason: CloseReason, grace: Duration) {
    if timeout(grace, writer.close(reason)).await.is_err() {
        warn!(reason = %reason, "Connection close did not finish within the grace period");
    }
}

fn spawn_direction(
    direction: Direction,
    reader: Box<dyn FrameReader>,
    writer: Arc<dyn FrameWriter>,
    session: Arc<Session>,
    settings: RelaySettings,
) -> tokio::task::JoinHandle<()> {
    let span = tracing::Span::current();
    tokio::spawn(
        async move {
            if let Some(reason) = forward(direction, reader, writer, &session, settings).await {
                if session.begin_closing(reason) {
                    info!(direction = direction.as_str(), reason = %reason, "Direction ended the session");
                }
            }
        }
        .instrument(span),
    )
}

/// Forward frames until one side ends. `None` means cancelled from outside.
async fn forward(
    direction: Direction,
    mut reader: Box<dyn FrameReader>,
    writer: Arc<dyn FrameWriter>,
    session: &Session,
    settings: RelaySettings,
) -> Option<CloseReason> {
    let cancel = session.cancel_token();
    let idle = match direction {
        Direction::ClientToUpstream => settings.idle_timeout,
        Direction::UpstreamToClient => None,
    };
    let mut guard = FrameGuard::new(settings.malformed_frame_threshold);

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            read = next_frame(reader.as_mut(), idle) => read,
        };

        let frame = match read {
            Some(Ok(Some(frame))) => frame,
            Some(Ok(None)) => {
                debug!(direction = direction.as_str(), "Source closed");
                return Some(direction.source_closed());
            }
            Some(Err(RelayError::Backpressure(detail))) => {
                warn!(direction = direction.as_str(), detail = %detail, "Inbound queue overflowed");
                return Some(CloseReason::Backpressure);
            }
            Some(Err(err)) => {
                warn!(direction = direction.as_str(), error = %err, "Read failed");
                return Some(direction.source_closed());
            }
            None => {
                info!("No client audio within the idle timeout");
                return Some(CloseReason::Idle);
            }
        };

        match guard.check(&frame) {
            FrameVerdict::Forward => {}
            FrameVerdict::Empty => continue,
            FrameVerdict::Malformed => {
                session.record_malformed();
                let err = RelayError::MalformedFrame { len: frame.len() };
                debug!(direction = direction.as_str(), error = %err, "Dropped frame");
                continue;
            }
            FrameVerdict::Unstable(count) => {
                session.record_malformed();
                let err = RelayError::UnstableStream(count);
                warn!(direction = direction.as_str(), error = %err, "Tearing down unstable stream");
                return Some(CloseReason::UnstableStream);
            }
        }

        let len = frame.len();
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            written = timeout(settings.write_timeout, writer.send_frame(frame)) => written,
        };

        match written {
            Ok(Ok(())) => {
                session.record_forwarded(direction, len);
                trace!(direction = direction.as_str(), bytes = len, "Frame forwarded");
            }
            Ok(Err(RelayError::Backpressure(detail))) => {
                warn!(direction = direction.as_str(), detail = %detail, "Destination refused frame");
                return Some(CloseReason::Backpressure);
            }
            Ok(Err(err)) => {
                warn!(direction = direction.as_str(), error = %err, "Write failed");
                return Some(direction.destination_failed());
            }
            Err(_) => {
                warn!(
                    direction = direction.as_str(),
                    timeout_ms = settings.write_timeout.as_millis() as u64,
                    "Write did not complete, destination is not keeping up"
                );
                return Some(CloseReason::Backpressure);
            }
        }
    }
}

/// `None` when the idle timeout elapsed first.
async fn next_frame(
    reader: &mut dyn FrameReader,
    idle: Option<Duration>,
) -> Option<Result<Option<Bytes>, RelayError>> {
    match idle {
        Some(limit) => timeout(limit, reader.next_frame()).await.ok(),
        None => Some(reader.next_frame().await),
    }
}
