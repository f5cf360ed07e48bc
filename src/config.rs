//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between section and key)
//! - Deployment variables `HOST`, `PORT` and `GEMINI_API_KEY`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT`, `GEMINI_API_KEY`
//! 2. Environment variables (APP_SERVER__PORT, APP_RELAY__WRITE_TIMEOUT_MS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::audio::codec::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::relay::forward::RelaySettings;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one concern (HTTP server, upstream service, relay
/// tuning, audio format) so the relay can be handed only the part it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub relay: RelayConfig,
    pub audio: AudioConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Upstream streaming service configuration.
///
/// Every session opens its own upstream connection with this fixed setup:
/// audio output modality plus one system-level instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// WebSocket endpoint of the live conversational-audio service
    pub url: String,
    /// Model name, without the `models/` prefix
    pub model: String,
    /// Credential appended as the `key` query parameter
    pub api_key: String,
    /// Requested response modality (the relay only forwards audio)
    pub response_modality: String,
    /// System-level behavior instruction sent in the setup message
    pub system_instruction: String,
    /// Bound on connect + setup handshake
    pub connect_timeout_ms: u64,
}

/// Relay tuning.
///
/// ## Tuning guidelines:
/// - `frame_queue_depth` smooths jitter; it is capped at 2 so a stalled
///   consumer turns into a teardown instead of growing memory
/// - `write_timeout_ms` is how long a direction may block on a slow destination
/// - `malformed_frame_threshold` of 0 keeps sessions alive regardless of bad frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub max_concurrent_sessions: usize,
    pub frame_queue_depth: usize,
    pub write_timeout_ms: u64,
    pub teardown_grace_ms: u64,
    /// Seconds without a client frame before the session is closed (0 disables)
    pub idle_timeout_secs: u64,
    pub malformed_frame_threshold: u32,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Audio wire format. The rates are fixed per direction; they are
/// configurable only so a mismatching deployment fails validation loudly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    /// Samples per captured frame (2048 = 128 ms at 16 kHz)
    pub capture_frame_samples: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            upstream: UpstreamConfig {
                url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model: "gemini-2.5-flash-preview-native-audio-dialog".to_string(),
                api_key: String::new(),
                response_modality: "AUDIO".to_string(),
                system_instruction: "You are a helpful assistant and answer in a friendly tone.".to_string(),
                connect_timeout_ms: 10_000,
            },
            relay: RelayConfig {
                max_concurrent_sessions: 64,
                frame_queue_depth: 2,
                write_timeout_ms: 2_000,
                teardown_grace_ms: 2_000,
                idle_timeout_secs: 120,
                malformed_frame_threshold: 5,
                heartbeat_interval_secs: 10,
                client_timeout_secs: 30,
            },
            audio: AudioConfig {
                input_sample_rate: INPUT_SAMPLE_RATE,
                output_sample_rate: OUTPUT_SAMPLE_RATE,
                capture_frame_samples: 2048,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_RELAY__MAX_CONCURRENT_SESSIONS=200`: Raise the session limit
    /// - `APP_UPSTREAM__MODEL=...`: Use another live model
    /// - `GEMINI_API_KEY=...`: Upstream credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("upstream.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// The API key is not checked here; `main` refuses to start without one,
    /// while tests and tooling can work with the defaults.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("Server port cannot be 0");
        }

        if self.upstream.url.is_empty() {
            bail!("Upstream url must be set");
        }

        if self.upstream.connect_timeout_ms == 0 {
            bail!("Upstream connect timeout must be greater than 0");
        }

        if self.relay.max_concurrent_sessions == 0 {
            bail!("Max concurrent sessions must be greater than 0");
        }

        if !(1..=2).contains(&self.relay.frame_queue_depth) {
            bail!(
                "Frame queue depth must be 1 or 2, got {}",
                self.relay.frame_queue_depth
            );
        }

        if self.relay.write_timeout_ms == 0 || self.relay.teardown_grace_ms == 0 {
            bail!("Relay write timeout and teardown grace must be greater than 0");
        }

        if self.relay.heartbeat_interval_secs == 0
            || self.relay.client_timeout_secs <= self.relay.heartbeat_interval_secs
        {
            bail!("Client timeout must be longer than a non-zero heartbeat interval");
        }

        if self.audio.input_sample_rate != INPUT_SAMPLE_RATE {
            bail!(
                "Client audio must be {} Hz, got {}",
                INPUT_SAMPLE_RATE,
                self.audio.input_sample_rate
            );
        }

        if self.audio.output_sample_rate != OUTPUT_SAMPLE_RATE {
            bail!(
                "Upstream audio must be {} Hz, got {}",
                OUTPUT_SAMPLE_RATE,
                self.audio.output_sample_rate
            );
        }

        if self.audio.capture_frame_samples == 0 {
            bail!("Capture frame size must be greater than 0");
        }

        Ok(())
    }

    /// Refuse to start without an upstream credential.
    pub fn require_api_key(&self) -> Result<()> {
        if self.upstream.api_key.trim().is_empty() {
            bail!("GEMINI_API_KEY not found in environment variables");
        }
        Ok(())
    }

    /// Relay loop parameters derived from the `relay` and `upstream` sections.
    pub fn relay_settings(&self) -> RelaySettings {
        let idle_timeout = match self.relay.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        RelaySettings {
            connect_timeout: Duration::from_millis(self.upstream.connect_timeout_ms),
            write_timeout: Duration::from_millis(self.relay.write_timeout_ms),
            teardown_grace: Duration::from_millis(self.relay.teardown_grace_ms),
            idle_timeout,
            malformed_frame_threshold: self.relay.malformed_frame_threshold,
        }
    }

    /// Copy safe to show over HTTP.
    pub fn redacted(&self) -> AppConfig {
        let mut copy = self.clone();
        if !copy.upstream.api_key.is_empty() {
            copy.upstream.api_key = "***".to_string();
        }
        copy
    }
}
