//! Error taxonomy for cluster processes

use shared::CorrelationId;
use thiserror::Error;

/// Main error type for server operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("coordination store unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("reserved message name: {0}")]
    ReservedName(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("already authenticated")]
    AlreadyAuthenticated,

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("too many pending replies (limit {0})")]
    TooManyPendingReplies(usize),

    #[error("duplicate correlation id {0}")]
    DuplicateCorrelation(CorrelationId),

    #[error("request timed out")]
    ReplyTimeout,

    #[error("server is at capacity")]
    CapacityExceeded,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure raised by a message handler.
///
/// The message is sent verbatim as `{"err": message}` when the request
/// carried a correlation id.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}
