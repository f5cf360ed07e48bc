//! # Upstream Module
//!
//! Client side of the live conversational-audio service.
//!
//! - **protocol**: JSON messages (setup, realtime input, server content)
//! - **gemini**: WebSocket connector producing one relay [`Link`](crate::relay::Link) per session

pub mod gemini;
pub mod protocol;

pub use gemini::GeminiConnector;
