//! Error types for the relay.

use thiserror::Error;

/// Errors that can occur while handling a client action.
///
/// Storage methods return raw `rusqlite::Error`; conversion happens at
/// the dispatcher seam.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("moderation service unavailable: {0}")]
    ModerationUnavailable(String),

    #[error("message content was flagged")]
    ContentFlagged,

    #[error("invalid upload request: {0}")]
    InvalidUpload(String),

    #[error("unknown conversation: {0}")]
    UnknownConversation(String),
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
