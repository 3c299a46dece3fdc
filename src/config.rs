//! TOML configuration for a participant session.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. CLI flags are layered on top by `cli::JoinArgs::apply`.

use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::gateway::Provider;

/// Top-level session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Base WebSocket URL of the hub, without the `/ws/<room>` suffix.
    pub hub_url: String,
    pub room: String,
    pub username: String,
    pub presence: PresenceConfig,
    pub assistant: AssistantConfig,
    pub timestamps: TimestampConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://127.0.0.1:8787".to_string(),
            room: "lobby".to_string(),
            username: "guest".to_string(),
            presence: PresenceConfig::default(),
            assistant: AssistantConfig::default(),
            timestamps: TimestampConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresenceConfig {
    pub quiet_period_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { quiet_period_ms: 1000 }
    }
}

impl PresenceConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }
}

/// Settings for the external completion service and the `@ai` command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssistantConfig {
    pub provider: Provider,
    /// Model name; empty means the provider default.
    pub model: String,
    /// Environment variable holding the API key; empty means the provider default.
    pub api_key_env: String,
    /// Override for the provider endpoint (useful for proxies and tests).
    pub base_url: Option<String>,
    pub temperature: f32,
    /// Token cap; `None` means the provider default.
    pub max_output_tokens: Option<u32>,
    /// Author label on synthesized assistant entries.
    pub display_name: String,
    pub trigger: String,
    pub request_timeout_secs: u64,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Gemini,
            model: String::new(),
            api_key_env: String::new(),
            base_url: None,
            temperature: 0.7,
            max_output_tokens: None,
            display_name: "Gemini".to_string(),
            trigger: "@ai".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl AssistantConfig {
    pub fn resolved_model(&self) -> String {
        if self.model.is_empty() {
            self.provider.default_model().to_string()
        } else {
            self.model.clone()
        }
    }

    pub fn resolved_api_key_env(&self) -> String {
        if self.api_key_env.is_empty() {
            self.provider.default_api_key_env().to_string()
        } else {
            self.api_key_env.clone()
        }
    }

    pub fn resolved_max_output_tokens(&self) -> u32 {
        self.max_output_tokens
            .unwrap_or_else(|| self.provider.default_max_output_tokens())
    }

    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<String> {
        let var = self.resolved_api_key_env();
        std::env::var(&var)
            .map_err(|_| SyncError::Config(format!("{var} not set. Export it or pass via environment.")))
    }
}

/// Chat timestamp rendering. Fixed offset keeps output deterministic for a
/// given instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimestampConfig {
    /// chrono strftime pattern.
    pub format: String,
    pub utc_offset_minutes: i32,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            format: "%d/%m/%Y, %H:%M:%S".to_string(),
            utc_offset_minutes: 0,
        }
    }
}

impl TimestampConfig {
    /// Reject patterns chrono cannot render; formatting one would fail on
    /// every chat entry.
    pub fn validate(&self) -> Result<()> {
        if StrftimeItems::new(&self.format).any(|item| matches!(item, Item::Error)) {
            return Err(SyncError::Config(format!(
                "invalid timestamps.format pattern: {:?}",
                self.format
            )));
        }
        Ok(())
    }
}

impl SyncConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        cfg.timestamps.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Full WebSocket URL for joining the configured room.
    pub fn room_url(&self) -> String {
        format!(
            "{}/ws/{}?name={}",
            self.hub_url.trim_end_matches('/'),
            self.room,
            encode_query_value(&self.username)
        )
    }
}

fn encode_query_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
