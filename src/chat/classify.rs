//! Maps raw failures to the stable text shown in place of the answer.

/// Substrings (lowercase) the backend uses for a rejected or expired credential.
const CREDENTIAL_MARKERS: &[&str] = &[
    "invalid api key",
    "invalid_api_key",
    "expired api key",
    "api key expired",
];

/// Shown when the backend rejects the user's credential.
pub const CREDENTIAL_MESSAGE: &str =
    "Error: Invalid Groq API Key. Please update your API key in Settings.";

/// Why an exchange ended without a final answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The backend sent an `error` event.
    Backend(String),
    /// The caller aborted the exchange.
    Cancelled,
    /// The connection dropped mid-stream.
    ConnectionInterrupted,
    /// The stream ended cleanly but never sent `final` or `error`.
    IncompleteResponse,
    /// The request could not be sent or was refused.
    RequestFailed,
    /// No data arrived within the idle timeout.
    TimedOut,
    /// A single frame outgrew the framer's buffer limit.
    FrameTooLarge,
}

impl ErrorKind {
    /// Text that replaces the assistant placeholder.
    pub fn user_message(&self) -> String {
        match self {
            Self::Backend(raw) => classify_backend_error(raw),
            Self::Cancelled => "Error: Request cancelled.".to_string(),
            Self::ConnectionInterrupted => {
                "Error: Connection interrupted before the response completed. Please try again."
                    .to_string()
            }
            Self::IncompleteResponse => {
                "Error: The response ended before it was complete. Please try again.".to_string()
            }
            Self::RequestFailed => "Failed to get response. Please try again.".to_string(),
            Self::TimedOut => "Error: The server stopped responding. Please try again.".to_string(),
            Self::FrameTooLarge => "Error: The response was too large to display.".to_string(),
        }
    }

    /// Whether the user has to fix their credential before retrying.
    pub fn is_credential_error(&self) -> bool {
        matches!(self, Self::Backend(raw) if is_credential_error(raw))
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend(_) => write!(f, "backend"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::ConnectionInterrupted => write!(f, "connection_interrupted"),
            Self::IncompleteResponse => write!(f, "incomplete_response"),
            Self::RequestFailed => write!(f, "request_failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::FrameTooLarge => write!(f, "frame_too_large"),
        }
    }
}

/// Map a raw backend error string to user-facing text. Never fails.
pub fn classify_backend_error(raw: &str) -> String {
    if is_credential_error(raw) {
        CREDENTIAL_MESSAGE.to_string()
    } else {
        format!("Error: {}", raw)
    }
}

fn is_credential_error(raw: &str) -> bool {
    let lower = raw.to_lowercase();
    CREDENTIAL_MARKERS.iter().any(|m| lower.contains(m))
}
