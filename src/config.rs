//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (APP_SERVER__PORT, APP_ENDPOINT__API_KEY, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Live WebSocket endpoint of the Gemini API.
pub const DEFAULT_ENDPOINT_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one concern (HTTP server, session lifecycle, audio
/// formats, the conversational endpoint, capacity and transcript storage),
/// which also keeps the environment variable names readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub endpoint: EndpointSettings,
    pub performance: PerformanceConfig,
    pub persistence: PersistenceConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host` / `port`: where the HTTP server binds
/// - `heartbeat_interval_secs`: how often WebSocket clients are pinged
/// - `client_timeout_secs`: silence after which a WebSocket client is dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Session lifecycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Handshake budget for `connect`
    pub connect_timeout_ms: u64,
    /// Budget for a clean release before resources are forced closed
    pub teardown_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    /// Hard lifetime of a session
    pub ttl_secs: u64,
    pub reaper_interval_secs: u64,
    /// How many ended sessions still answer status queries
    pub retired_capacity: usize,
    /// Depth of each session's event queue
    pub event_buffer: usize,
}

/// Audio formats on both sides of the server.
///
/// ## Fields:
/// - `client_sample_rate` / `client_channels`: default format of client microphone audio
/// - `capture_chunk_ms`: size of the chunks forwarded to the endpoint
/// - `endpoint_input_rate` / `endpoint_output_rate`: PCM rates the endpoint accepts and produces
/// - `playback_sample_rate` / `playback_frame_ms`: what the client receives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub client_sample_rate: u32,
    pub client_channels: u16,
    pub capture_chunk_ms: u32,
    pub endpoint_input_rate: u32,
    pub endpoint_output_rate: u32,
    pub playback_sample_rate: u32,
    pub playback_frame_ms: u32,
}

/// Conversational endpoint connection settings.
///
/// `generation_config` is a JSON object passed through to the endpoint
/// untouched; `voice` may be empty to use the endpoint's default voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSettings {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub system_instruction: String,
    pub generation_config: String,
    pub voice: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

/// Where finished transcripts go. An empty path logs them instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub transcript_path: String,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start even if no configuration file exists.
/// Only `endpoint.api_key` has no usable default.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                heartbeat_interval_secs: 10,
                client_timeout_secs: 30,
            },
            session: SessionConfig {
                connect_timeout_ms: 15_000,
                teardown_timeout_ms: 5_000,
                idle_timeout_secs: 300,
                ttl_secs: 3600,
                reaper_interval_secs: 30,
                retired_capacity: 256,
                event_buffer: 256,
            },
            audio: AudioConfig {
                client_sample_rate: 16_000,
                client_channels: 1,
                capture_chunk_ms: 100,
                endpoint_input_rate: 16_000,
                endpoint_output_rate: 24_000,
                playback_sample_rate: 24_000,
                playback_frame_ms: 20,
            },
            endpoint: EndpointSettings {
                url: DEFAULT_ENDPOINT_URL.to_string(),
                api_key: String::new(),
                model: "gemini-2.0-flash-live-001".to_string(),
                system_instruction: "You are a friendly interviewer. Ask one question at a time and keep answers short."
                    .to_string(),
                generation_config: r#"{"responseModalities": ["AUDIO"]}"#.to_string(),
                voice: String::new(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
            },
            persistence: PersistenceConfig {
                transcript_path: String::new(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// Field names contain underscores, so sections are separated by a double underscore:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_ENDPOINT__API_KEY=...`
    /// - `APP_SESSION__CONNECT_TIMEOUT_MS=20000`
    /// - `HOST=0.0.0.0` / `PORT=3000`: special case for deployment platforms
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

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Port, timeouts and capacities are non-zero
    /// - Every audio rate and frame size is non-zero
    /// - The endpoint has a URL and a model, and `generation_config` is a JSON object
    ///
    /// A missing API key is not an error here: the endpoint rejects the
    /// handshake and the client gets a non-retryable error.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.heartbeat_interval_secs == 0 || self.server.client_timeout_secs <= self.server.heartbeat_interval_secs {
            return Err(anyhow::anyhow!("Client timeout must be longer than a non-zero heartbeat interval"));
        }

        if self.session.connect_timeout_ms == 0 || self.session.teardown_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Session timeouts must be greater than 0"));
        }

        if self.session.idle_timeout_secs == 0 || self.session.ttl_secs == 0 || self.session.reaper_interval_secs == 0 {
            return Err(anyhow::anyhow!("Idle timeout, TTL and reaper interval must be greater than 0"));
        }

        if self.session.event_buffer == 0 || self.session.retired_capacity == 0 {
            return Err(anyhow::anyhow!("Event buffer and retired capacity must be greater than 0"));
        }

        let audio = &self.audio;
        let rates = [
            audio.client_sample_rate,
            audio.endpoint_input_rate,
            audio.endpoint_output_rate,
            audio.playback_sample_rate,
        ];
        if rates.contains(&0) {
            return Err(anyhow::anyhow!("Audio sample rates must be greater than 0"));
        }

        if audio.client_channels == 0 || audio.capture_chunk_ms == 0 || audio.playback_frame_ms == 0 {
            return Err(anyhow::anyhow!("Audio channels and frame sizes must be greater than 0"));
        }

        if self.endpoint.url.trim().is_empty() {
            return Err(anyhow::anyhow!("Endpoint URL cannot be empty"));
        }

        if self.endpoint.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Endpoint model cannot be empty"));
        }

        if !self.endpoint.generation_config.trim().is_empty() {
            let parsed: serde_json::Value = serde_json::from_str(&self.endpoint.generation_config)
                .map_err(|e| anyhow::anyhow!("Endpoint generation_config is not valid JSON: {}", e))?;
            if !parsed.is_object() {
                return Err(anyhow::anyhow!("Endpoint generation_config must be a JSON object"));
            }
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Copy safe to show over the API: the API key is masked.
    pub fn redacted(&self) -> AppConfig {
        let mut config = self.clone();
        if !config.endpoint.api_key.is_empty() {
            config.endpoint.api_key = "***".to_string();
        }
        config
    }
}

impl EndpointSettings {
    /// `generation_config` as JSON; an empty or invalid string yields an empty object.
    pub fn generation_config_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.generation_config)
            .ok()
            .filter(serde_json::Value::is_object)
            .unwrap_or_else(|| serde_json::json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.session.connect_timeout_ms, 15_000);
        assert_eq!(config.session.teardown_timeout_ms, 5_000);
        assert_eq!(config.audio.capture_chunk_ms, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.endpoint_output_rate = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.endpoint.generation_config = "[1, 2]".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.client_timeout_secs = config.server.heartbeat_interval_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generation_config_value() {
        let mut config = AppConfig::default();
        assert_eq!(config.endpoint.generation_config_value()["responseModalities"][0], "AUDIO");

        config.endpoint.generation_config = String::new();
        assert_eq!(config.endpoint.generation_config_value(), serde_json::json!({}));
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let mut config = AppConfig::default();
        config.endpoint.api_key = "secret-key".to_string();
        let shown = config.redacted();
        assert_eq!(shown.endpoint.api_key, "***");
        assert_eq!(config.endpoint.api_key, "secret-key");
    }
}
