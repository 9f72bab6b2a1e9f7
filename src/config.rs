//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT` and `OPENAI_API_KEY` (deployment platform conventions)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_SESSION__VOICE`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys use a double underscore in environment variables because the
//! field names themselves contain single underscores
//! (`APP_SESSION__TURN_DETECTION__SILENCE_DURATION_MS=1000`).

use crate::audio::codec::DEFAULT_ENCODE_CHUNK_BYTES;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Placeholder replaced with the active language name in the instructions.
pub const LANGUAGE_PLACEHOLDER: &str = "{language}";

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - **server**: where the HTTP/WebSocket listener binds
/// - **upstream**: the realtime speech service
/// - **session**: what goes into every session configuration sent upstream
/// - **audio**: capture and framing parameters
/// - **performance**: limits
/// - **persistence**: where finished conversation turns are appended
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub mode: RunMode,
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub session: SessionSettings,
    pub audio: AudioSettings,
    pub performance: PerformanceConfig,
    pub persistence: PersistenceConfig,
}

/// How the binary runs.
///
/// - `server`: relay browsers connecting over WebSocket to the upstream service
/// - `local`: capture from this machine's microphone and play through its
///   speakers (needs the `native-audio` feature)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Server,
    Local,
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

/// Upstream realtime speech service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// WebSocket endpoint; the model is appended as `?model=`
    pub url: String,
    pub model: String,
    /// Never serialized back out through the config endpoint (see `redacted()`)
    pub api_key: Option<String>,
    /// Bound on connect + `session.created` + `session.updated`
    pub connect_timeout_secs: u64,
}

/// Defaults for the session configuration sent upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub voice: String,
    /// Must contain `{language}`
    pub instructions_template: String,
    pub transcription_model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Language code used when the client does not ask for one
    pub default_language: String,
    pub turn_detection: TurnDetectionSettings,
}

/// Server-side voice activity detection.
///
/// ## Fields:
/// - `threshold`: activation level in [0, 1]; higher needs louder speech
/// - `prefix_padding_ms`: audio kept from before speech was detected
/// - `silence_duration_ms`: silence that ends the user's turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetectionSettings {
    pub mode: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

/// Capture and framing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub sample_rate: u32,
    /// Samples per capture frame
    pub frame_size: usize,
    /// Frames whose peak stays below this are not forwarded (0 disables)
    pub silence_threshold: f32,
    /// Raw bytes per base64 piece; must be a multiple of 3
    pub encode_chunk_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Relay WebSockets allowed at the same time; more get a 503
    pub max_concurrent_sessions: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// JSON-lines file for finished turns; unset disables persistence
    pub path: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Server,
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            upstream: UpstreamConfig {
                url: "wss://api.openai.com/v1/realtime".to_string(),
                model: "gpt-4o-realtime-preview-2024-10-01".to_string(),
                api_key: None,
                connect_timeout_secs: 10,
            },
            session: SessionSettings {
                voice: "alloy".to_string(),
                instructions_template: "You are a helpful healthcare assistant. Always respond in {language}. \
                    Provide brief, practical home remedies and health advice. \
                    Include appropriate medical disclaimers. \
                    Keep responses concise and under 30 seconds when speaking."
                    .to_string(),
                transcription_model: "whisper-1".to_string(),
                temperature: 0.8,
                max_output_tokens: 1000,
                default_language: "en".to_string(),
                turn_detection: TurnDetectionSettings {
                    mode: "server_vad".to_string(),
                    threshold: 0.5,
                    prefix_padding_ms: 300,
                    silence_duration_ms: 1500,
                },
            },
            audio: AudioSettings {
                sample_rate: 24_000,
                frame_size: 4096,
                silence_threshold: 0.0,
                encode_chunk_bytes: DEFAULT_ENCODE_CHUNK_BYTES,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
            persistence: PersistenceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_MODE=local`: Run against the local microphone
    /// - `APP_SESSION__VOICE=shimmer`: Change the synthesized voice
    /// - `HOST`/`PORT`: Special case for deployment platforms
    /// - `OPENAI_API_KEY`: Upstream credential
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

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            if !key.trim().is_empty() {
                settings = settings.set_override("upstream.api_key", key)?;
            }
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - At least one concurrent session is allowed
    /// - Frame size and sample rate are non-zero
    /// - Encode chunk size is non-zero and a multiple of 3
    /// - Turn-detection threshold and silence threshold lie in [0, 1]
    /// - Handshake timeout is positive
    /// - The instructions template mentions `{language}`
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Audio frame size must be greater than 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate must be greater than 0"));
        }

        if self.audio.encode_chunk_bytes == 0 || self.audio.encode_chunk_bytes % 3 != 0 {
            return Err(anyhow::anyhow!(
                "Encode chunk size must be a positive multiple of 3, got {}",
                self.audio.encode_chunk_bytes
            ));
        }

        if !(0.0..=1.0).contains(&self.audio.silence_threshold) {
            return Err(anyhow::anyhow!("Silence threshold must be within [0, 1]"));
        }

        if !(0.0..=1.0).contains(&self.session.turn_detection.threshold) {
            return Err(anyhow::anyhow!("Turn detection threshold must be within [0, 1]"));
        }

        if self.upstream.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Upstream connect timeout must be greater than 0"));
        }

        if !self.session.instructions_template.contains(LANGUAGE_PLACEHOLDER) {
            return Err(anyhow::anyhow!(
                "Instructions template must contain the {} placeholder",
                LANGUAGE_PLACEHOLDER
            ));
        }

        Ok(())
    }

    /// Copy safe to hand out over HTTP: the API key is masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.upstream.api_key.is_some() {
            config.upstream.api_key = Some("***".to_string());
        }
        config
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present are changed, e.g. `{"session": {"voice": "verse"}}`.
    /// Server address, run mode, upstream endpoint and credentials are
    /// startup-only and ignored here.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(session) = partial_config.get("session") {
            if let Some(voice) = session.get("voice").and_then(|v| v.as_str()) {
                self.session.voice = voice.to_string();
            }
            if let Some(template) = session.get("instructions_template").and_then(|v| v.as_str()) {
                self.session.instructions_template = template.to_string();
            }
            if let Some(model) = session.get("transcription_model").and_then(|v| v.as_str()) {
                self.session.transcription_model = model.to_string();
            }
            if let Some(temperature) = session.get("temperature").and_then(|v| v.as_f64()) {
                self.session.temperature = temperature as f32;
            }
            if let Some(tokens) = session.get("max_output_tokens").and_then(|v| v.as_u64()) {
                self.session.max_output_tokens = tokens as u32;
            }
            if let Some(language) = session.get("default_language").and_then(|v| v.as_str()) {
                self.session.default_language = language.to_string();
            }

            if let Some(turn) = session.get("turn_detection") {
                let td = &mut self.session.turn_detection;
                if let Some(mode) = turn.get("mode").and_then(|v| v.as_str()) {
                    td.mode = mode.to_string();
                }
                if let Some(threshold) = turn.get("threshold").and_then(|v| v.as_f64()) {
                    td.threshold = threshold as f32;
                }
                if let Some(padding) = turn.get("prefix_padding_ms").and_then(|v| v.as_u64()) {
                    td.prefix_padding_ms = padding as u32;
                }
                if let Some(silence) = turn.get("silence_duration_ms").and_then(|v| v.as_u64()) {
                    td.silence_duration_ms = silence as u32;
                }
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(frame_size) = audio.get("frame_size").and_then(|v| v.as_u64()) {
                self.audio.frame_size = frame_size as usize;
            }
            if let Some(threshold) = audio.get("silence_threshold").and_then(|v| v.as_f64()) {
                self.audio.silence_threshold = threshold as f32;
            }
            if let Some(chunk) = audio.get("encode_chunk_bytes").and_then(|v| v.as_u64()) {
                self.audio.encode_chunk_bytes = chunk as usize;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as u32;
            }
        }

        if let Some(timeout) = partial_config
            .get("upstream")
            .and_then(|u| u.get("connect_timeout_secs"))
            .and_then(|v| v.as_u64())
        {
            self.upstream.connect_timeout_secs = timeout;
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.mode, RunMode::Server);
        assert_eq!(config.session.turn_detection.threshold, 0.5);
        assert_eq!(config.session.turn_detection.prefix_padding_ms, 300);
        assert_eq!(config.session.turn_detection.silence_duration_ms, 1500);
        assert_eq!(config.audio.encode_chunk_bytes % 3, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.encode_chunk_bytes = 0x8000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.turn_detection.threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upstream.connect_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.instructions_template = "Be helpful.".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"session": {"voice": "verse", "turn_detection": {"silence_duration_ms": 1000}}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.session.voice, "verse");
        assert_eq!(config.session.turn_detection.silence_duration_ms, 1000);
        assert_eq!(config.session.turn_detection.prefix_padding_ms, 300);
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        let json = r#"{"performance": {"max_concurrent_sessions": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }

    #[test]
    fn test_config_update_ignores_credentials() {
        let mut config = AppConfig::default();
        let json = r#"{"upstream": {"api_key": "sk-evil", "connect_timeout_secs": 5}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.upstream.api_key, None);
        assert_eq!(config.upstream.connect_timeout_secs, 5);
    }

    #[test]
    fn test_redacted_masks_api_key() {
        let mut config = AppConfig::default();
        config.upstream.api_key = Some("sk-secret".to_string());
        assert_eq!(config.redacted().upstream.api_key.as_deref(), Some("***"));
        assert_eq!(config.upstream.api_key.as_deref(), Some("sk-secret"));
    }
}
