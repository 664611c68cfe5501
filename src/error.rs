use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Transport-level failure. Reconnection is handled by the transport itself.
    #[error("connection error: {0}")]
    Connection(String),
    /// Missing or blank required fields, rejected before any network call.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("server rejected `{event}`: {reason}")]
    AckFailure { event: String, reason: String },
    #[error("store error: {0}")]
    Store(String),
    #[error("handler already registered for `{0}`")]
    HandlerRegistered(String),
    #[error("session is not active")]
    Inactive,
}

impl ChatError {
    pub fn ack_failure(event: &str, reason: impl Into<String>) -> Self {
        ChatError::AckFailure {
            event: event.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for ChatError {
    fn from(e: std::io::Error) -> Self {
        ChatError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Store(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Connection(e.to_string())
    }
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;
