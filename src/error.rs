//! Error types for the chat consumer.

use crate::chat::model::ExchangeHandle;

/// Top-level error type for the chat consumer.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("An exchange is already open: {open}")]
    Busy { open: ExchangeHandle },

    #[error("Query is empty")]
    EmptyQuery,

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Stream interrupted: {0}")]
    Stream(String),
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_body() || e.is_decode() {
            Self::Stream(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Result type alias for the chat consumer.
pub type Result<T> = std::result::Result<T, ChatError>;
