//! # Configuration Management
//!
//! Configuration is layered from three sources, highest priority first:
//! 1. Environment variables (`APP_SESSION__TIMEOUT_SECS`, `HOST`, `PORT`, ...)
//! 2. Configuration file (`config.toml`, optional)
//! 3. Defaults (the [`Default`] impl below)
//!
//! Nested keys use a double underscore separator so that snake_case field
//! names survive: `APP_ENGINES__CHAT__API_KEY` maps to `engines.chat.api_key`.
//!
//! ## Sections
//! - `server`: bind address and websocket frame limits
//! - `session`: lifecycle timers and inbound frame limits for voice sessions
//! - `audio`: PCM format announced to the transcription engine
//! - `engines`: chat completion endpoint and local synthesis settings

use crate::audio::chunks::MissingFragmentPolicy;
use crate::engines::AudioFormat;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub engines: EnginesConfig,
}

/// Server-specific configuration settings.
///
/// `max_frame_bytes` caps a single websocket frame (continuations included),
/// so it must leave room for the largest base64 `audio_chunk` a client sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_frame_bytes: usize,
}

/// Voice session tuning.
///
/// All timers are expressed in whole seconds except the keep-alive tick,
/// which is the resolution of the shared scheduler loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inactivity window after which the reaper ends a session.
    pub timeout_secs: u64,
    /// How often the reaper scans for expired sessions.
    pub reap_interval_secs: u64,
    /// Interval between silence frames sent to an idle transcriber.
    pub keep_alive_interval_secs: u64,
    pub keep_alive_tick_ms: u64,
    /// Text frames longer than this are rejected before parsing.
    pub max_text_message_chars: usize,
    /// Audio frames shorter than this are dropped silently.
    pub min_audio_frame_bytes: usize,
    pub keep_alive_frame_bytes: usize,
    pub max_concurrent_sessions: usize,
    pub default_persona: String,
    pub missing_fragment_policy: MissingFragmentPolicy,
}

/// PCM format of the audio stream clients send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginesConfig {
    pub chat: ChatConfig,
    pub synthesis: SynthesisConfig,
}

/// OpenAI-compatible chat completion endpoint.
///
/// When `api_key` is unset the server answers with the local echo model, so
/// the voice loop can be exercised without any external service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub sample_rate: u32,
    /// Pacing between streamed audio chunks of the local synthesizer.
    pub chunk_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                max_frame_bytes: 1024 * 1024,
            },
            session: SessionConfig {
                timeout_secs: 300,
                reap_interval_secs: 60,
                keep_alive_interval_secs: 10,
                keep_alive_tick_ms: 1000,
                max_text_message_chars: 100_000,
                min_audio_frame_bytes: 100,
                keep_alive_frame_bytes: 320,
                max_concurrent_sessions: 100,
                default_persona: "default".to_string(),
                missing_fragment_policy: MissingFragmentPolicy::BestEffort,
            },
            audio: AudioConfig {
                sample_rate: 16_000,
                channels: 1,
                bit_depth: 16,
            },
            engines: EnginesConfig {
                chat: ChatConfig {
                    base_url: "https://api.openai.com/v1".to_string(),
                    api_key: None,
                    model: "gpt-4o-mini".to_string(),
                    timeout_secs: 30,
                },
                synthesis: SynthesisConfig {
                    sample_rate: 16_000,
                    chunk_interval_ms: 20,
                },
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// `HOST` and `PORT` are honoured without the `APP_` prefix because
    /// deployment platforms set them directly.
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

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.max_frame_bytes < self.session.max_text_message_chars {
            return Err(anyhow::anyhow!(
                "Websocket frame limit must fit the largest accepted text message"
            ));
        }

        let session = &self.session;
        if session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }
        if session.timeout_secs == 0 || session.reap_interval_secs == 0 {
            return Err(anyhow::anyhow!("Session timeout and reap interval must be greater than 0"));
        }
        if session.keep_alive_interval_secs == 0 || session.keep_alive_tick_ms == 0 {
            return Err(anyhow::anyhow!("Keep-alive interval and tick must be greater than 0"));
        }
        if session.keep_alive_tick_ms > session.keep_alive_interval_secs * 1000 {
            return Err(anyhow::anyhow!("Keep-alive tick cannot be longer than the keep-alive interval"));
        }
        if session.keep_alive_frame_bytes == 0 || session.keep_alive_frame_bytes % 2 != 0 {
            return Err(anyhow::anyhow!("Keep-alive frame must hold whole 16-bit samples"));
        }
        if session.reap_interval_secs > session.timeout_secs {
            return Err(anyhow::anyhow!("Reap interval cannot be longer than the session timeout"));
        }
        if session.max_text_message_chars == 0 {
            return Err(anyhow::anyhow!("Max text message size must be greater than 0"));
        }
        if session.default_persona.trim().is_empty() {
            return Err(anyhow::anyhow!("Default persona id cannot be empty"));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Audio sample rate and channel count must be greater than 0"));
        }
        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!("Only 16-bit PCM audio is supported"));
        }

        if self.engines.synthesis.sample_rate == 0 {
            return Err(anyhow::anyhow!("Synthesis sample rate must be greater than 0"));
        }
        if self.engines.chat.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Chat timeout must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON document on top of the current configuration.
    ///
    /// Only the keys present in `json_str` change; e.g. `{"session": {"timeout_secs": 120}}`
    /// leaves everything else alone. The merged result must still validate.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let patch: serde_json::Value = serde_json::from_str(json_str)?;
        if !patch.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, patch);
        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;

        *self = updated;
        Ok(())
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.audio.sample_rate,
            channels: self.audio.channels,
            bit_depth: self.audio.bit_depth,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn keep_alive_tick(&self) -> Duration {
        Duration::from_millis(self.keep_alive_tick_ms)
    }
}

fn merge_json(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
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
        assert_eq!(config.session.timeout(), Duration::from_secs(300));
        assert_eq!(config.session.keep_alive_interval(), Duration::from_secs(10));
        assert_eq!(config.session.max_text_message_chars, 100_000);
        assert_eq!(config.session.min_audio_frame_bytes, 100);
        assert_eq!(config.session.keep_alive_frame_bytes, 320);
        assert!(config.engines.chat.api_key.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.keep_alive_tick_ms = 20_000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.bit_depth = 24;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.default_persona = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.keep_alive_frame_bytes = 321;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.reap_interval_secs = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "session": {"timeout_secs": 120}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.session.timeout_secs, 120);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.session.reap_interval_secs, 60);
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"session": {"max_concurrent_sessions": 0}}"#).is_err());
        assert_eq!(config.session.max_concurrent_sessions, 100);

        assert!(config.update_from_json(r#"{"session": {"missing_fragment_policy": "maybe"}}"#).is_err());
        assert!(config.update_from_json("[1, 2]").is_err());
    }

    #[test]
    fn test_fragment_policy_update() {
        let mut config = AppConfig::default();
        config
            .update_from_json(r#"{"session": {"missing_fragment_policy": "strict"}}"#)
            .unwrap();
        assert_eq!(config.session.missing_fragment_policy, MissingFragmentPolicy::Strict);
    }
}
