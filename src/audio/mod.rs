//! # Audio Module
//!
//! Everything that touches PCM samples. The relay itself never decodes audio;
//! these pieces sit at the edges (capture before the transport, playback after).
//!
//! ## Audio Format:
//! - **Encoding**: signed 16-bit little-endian PCM, mono, no header
//! - **Client → server**: 16 kHz
//! - **Server → client**: 24 kHz
//!
//! ## Module Structure:
//! - **codec**: bytes ↔ samples ↔ floats
//! - **playback**: strictly sequential output queue
//! - **capture**: fixed-cadence microphone framing
//! - **device** (feature `device`): cpal microphone and speaker

pub mod capture;
pub mod codec;
#[cfg(feature = "device")]
pub mod device;
pub mod playback;

pub use capture::{AudioInput, CapturePipeline};
pub use playback::{PlaybackBuffer, PlaybackScheduler, Renderer};
