//! # Voice Relay
//!
//! Relays real-time voice audio between browser clients and a streaming
//! conversational-audio service. Each client WebSocket becomes one session
//! bound to one upstream session; frames move in both directions unchanged.
//!
//! ## Module Layout:
//! - **audio**: PCM codec, playback scheduler, capture pipeline, devices
//! - **relay**: sessions, registry and the relay loop
//! - **upstream**: live-audio service client
//! - **websocket**: client transport endpoint
//! - **health**, **handlers**, **middleware**: HTTP surface
//! - **config**, **error**, **state**: ambient plumbing

pub mod audio;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod relay;
pub mod state;
pub mod upstream;
pub mod websocket;
