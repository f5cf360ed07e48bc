//! # Relay Module
//!
//! Server-side core: binds each client connection to one upstream
//! conversational-audio session and moves frames between them.
//!
//! ## Module Structure:
//! - **session**: per-connection state machine and close reasons
//! - **registry**: process-wide table of live sessions
//! - **link**: reader/writer traits both connections are seen through
//! - **forward**: the relay loop (two forwarding tasks plus teardown)

pub mod forward;
pub mod link;
pub mod registry;
pub mod session;

pub use forward::{run_session, RelaySettings};
pub use link::{FrameReader, FrameWriter, Link, UpstreamConnector};
pub use registry::{RegistryStats, SessionRegistry};
pub use session::{CloseReason, Session, SessionSnapshot, SessionState};
