//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Default backend base URL.
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Chat consumer configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Base URL of the deliberation backend (no trailing slash).
    pub api_url: String,
    /// User whose conversation is addressed (`/chat/{username}`).
    pub username: String,
    /// Time allowed to establish the connection.
    pub connect_timeout: Duration,
    /// Maximum silence between chunks before the exchange is abandoned.
    pub stream_idle_timeout: Duration,
    /// Upper bound on a single undelimited frame held in the framer buffer.
    pub max_frame_bytes: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            username: String::new(),
            connect_timeout: Duration::from_secs(10),
            stream_idle_timeout: Duration::from_secs(120), // agents can think for a while
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl ChatConfig {
    /// Load configuration from `REFLOG_*` environment variables.
    ///
    /// Unset variables fall back to [`ChatConfig::default`]; set but
    /// unparsable ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_url = std::env::var("REFLOG_API_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_url);

        let username = std::env::var("REFLOG_USERNAME").unwrap_or_default();

        let connect_timeout = env_secs("REFLOG_CONNECT_TIMEOUT_SECS")?
            .unwrap_or(defaults.connect_timeout);

        let stream_idle_timeout = env_secs("REFLOG_STREAM_IDLE_TIMEOUT_SECS")?
            .unwrap_or(defaults.stream_idle_timeout);

        let max_frame_bytes = match std::env::var("REFLOG_MAX_FRAME_BYTES") {
            Ok(s) => s.parse::<usize>().map_err(|e| ConfigError::InvalidValue {
                key: "REFLOG_MAX_FRAME_BYTES".into(),
                message: e.to_string(),
            })?,
            Err(_) => defaults.max_frame_bytes,
        };

        Ok(Self {
            api_url,
            username,
            connect_timeout,
            stream_idle_timeout,
            max_frame_bytes,
        })
    }

    /// Check that the values can actually drive an exchange.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "username".into(),
                hint: "Set REFLOG_USERNAME or ChatConfig::username".into(),
            });
        }
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "api_url".into(),
                message: format!("expected an http(s) URL, got {:?}", self.api_url),
            });
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_frame_bytes".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Endpoint that accepts a query and streams back the deliberation.
    pub fn chat_url(&self) -> String {
        format!("{}/chat/{}", self.api_url, self.username)
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(key) {
        Ok(s) => s
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
