use shared::domain::ConversationId;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Recovered by reconnect/backoff or the next poll tick.
    Transport,
    /// Surfaced as an "unavailable" state; nothing else changes.
    NotFound,
    /// Rejected locally before any network call.
    Validation,
    /// Non-2xx or `success: false`; shown as a status message.
    Server,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("conversation {0} not found")]
    NotFound(ConversationId),
    #[error("access to conversation {0} denied")]
    Forbidden(ConversationId),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("server rejected request ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_) => ErrorCategory::Transport,
            Self::NotFound(_) | Self::Forbidden(_) => ErrorCategory::NotFound,
            Self::Validation(_) | Self::Config(_) => ErrorCategory::Validation,
            Self::Server { .. } | Self::Decode(_) => ErrorCategory::Server,
        }
    }

    pub fn is_transport(&self) -> bool {
        self.category() == ErrorCategory::Transport
    }

    pub fn is_unavailable(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
