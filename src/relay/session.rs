//! # Relay Session
//!
//! One session binds one client connection to one upstream connection and
//! owns the lifecycle of both.
//!
//! ## State Machine:
//! ```text
//! Connecting ──upstream ok──▶ Active ──either side ends / stop──▶ Closing ──▶ Closed
//!      │                                                                   ▲
//!      └─────────────────upstream failed (UpstreamUnavailable)──────────────┘
//! ```
//!
//! The first reason to close wins; later triggers are no-ops. The cancellation
//! token is the signal both forwarding tasks listen to.

use crate::relay::forward::Direction;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle position of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Client accepted, upstream not yet established
    Connecting,
    /// Both connections open, both directions forwarding
    Active,
    /// Teardown started
    Closing,
    /// Terminal: resources released, registry entry gone
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Why a session ended. Sent to the client as the close reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client closed its connection or it failed.
    ClientClosed,
    /// Upstream could not be established, or dropped mid-conversation.
    UpstreamUnavailable,
    /// A destination stopped accepting frames.
    Backpressure,
    /// Too many consecutive malformed frames.
    UnstableStream,
    /// No client audio within the idle timeout.
    Idle,
    /// Explicit stop (admin request or server shutdown).
    StopRequested,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::UpstreamUnavailable => "upstream_unavailable",
            CloseReason::Backpressure => "backpressure",
            CloseReason::UnstableStream => "unstable_stream",
            CloseReason::Idle => "idle",
            CloseReason::StopRequested => "stop_requested",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct Traffic {
    frames_in: AtomicU64,
    bytes_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_out: AtomicU64,
    malformed_dropped: AtomicU64,
}

/// Point-in-time view of a session for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub client_id: String,
    pub session_id: Uuid,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub frames_from_client: u64,
    pub bytes_from_client: u64,
    pub frames_to_client: u64,
    pub bytes_to_client: u64,
    pub malformed_dropped: u64,
}

/// Shared handle to one relay session.
///
/// The connections themselves are not stored here; they are owned by the
/// session's forwarding tasks. This struct carries what the registry, the
/// teardown path and diagnostics need.
pub struct Session {
    client_id: String,
    id: Uuid,
    created_at: DateTime<Utc>,
    activated_at: OnceLock<DateTime<Utc>>,
    state: watch::Sender<SessionState>,
    close_reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
    released: AtomicBool,
    traffic: Traffic,
}

impl Session {
    pub(crate) fn new(client_id: String) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            client_id,
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            activated_at: OnceLock::new(),
            state,
            close_reason: OnceLock::new(),
            cancel: CancellationToken::new(),
            released: AtomicBool::new(false),
            traffic: Traffic::default(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Unique per session, distinguishes reconnects under the same client id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Whether the session ever reached `Active`.
    pub fn was_activated(&self) -> bool {
        self.activated_at.get().is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Ask the session to close. Returns `false` if it was already closing.
    pub fn stop(&self) -> bool {
        self.begin_closing(CloseReason::StopRequested)
    }

    /// Resolves once the session reached `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close first.
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record the first reason to close and signal both directions.
    pub(crate) fn begin_closing(&self, reason: CloseReason) -> bool {
        let first = self.close_reason.set(reason).is_ok();
        self.cancel.cancel();
        first
    }

    /// Move to `Active`. Only valid from `Connecting`.
    pub(crate) fn activate(&self) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        });
        if moved {
            let _ = self.activated_at.set(Utc::now());
        }
        moved
    }

    /// Move to `Closing`. Valid from `Connecting` (stop during connect) or `Active`.
    pub(crate) fn mark_closing(&self) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(*state, SessionState::Connecting | SessionState::Active) {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn mark_closed(&self) {
        self.state.send_replace(SessionState::Closed);
    }

    /// Claim the right to release this session. Only the first caller gets `true`.
    pub(crate) fn claim_release(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn record_forwarded(&self, direction: Direction, bytes: usize) {
        let (frames, total) = match direction {
            Direction::ClientToUpstream => (&self.traffic.frames_in, &self.traffic.bytes_in),
            Direction::UpstreamToClient => (&self.traffic.frames_out, &self.traffic.bytes_out),
        };
        frames.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.traffic.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            client_id: self.client_id.clone(),
            session_id: self.id,
            state: self.state(),
            created_at: self.created_at,
            activated_at: self.activated_at.get().copied(),
            close_reason: self.close_reason(),
            frames_from_client: self.traffic.frames_in.load(Ordering::Relaxed),
            bytes_from_client: self.traffic.bytes_in.load(Ordering::Relaxed),
            frames_to_client: self.traffic.frames_out.load(Ordering::Relaxed),
            bytes_to_client: self.traffic.bytes_out.load(Ordering::Relaxed),
            malformed_dropped: self.traffic.malformed_dropped.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
