//! Transport seam between the relay loop and the two connections it bridges.
//!
//! The client socket and the upstream session are both seen as a [`Link`]:
//! one reader owned by exactly one forwarding task, and one writer shared by
//! the opposite forwarding task and the teardown path.

use crate::error::RelayError;
use crate::relay::session::CloseReason;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Receiving half of a connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Next binary payload, in the order the peer sent it.
    ///
    /// `Ok(None)` means the peer closed the connection.
    async fn next_frame(&mut self) -> Result<Option<Bytes>, RelayError>;
}

/// Sending half of a connection.
#[async_trait]
pub trait FrameWriter: Send + Sync {
    /// Send one payload as one message. Resolves once the destination took it.
    async fn send_frame(&self, frame: Bytes) -> Result<(), RelayError>;

    /// Close the connection. Calling it more than once is harmless.
    async fn close(&self, reason: CloseReason);
}

/// Both halves of one connection.
pub struct Link {
    pub reader: Box<dyn FrameReader>,
    pub writer: Arc<dyn FrameWriter>,
}

impl Link {
    pub fn new(reader: impl FrameReader + 'static, writer: impl FrameWriter + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Arc::new(writer),
        }
    }
}

/// Opens one upstream streaming session per relay session.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Establish the upstream session for `client_id`. Failures are reported
    /// as `UpstreamUnavailable`.
    async fn connect(&self, client_id: &str) -> Result<Link, RelayError>;
}
