use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure categories shared by the store, the REST layer, the gateway and
/// the client controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Caller is not authenticated or not a participant of the conversation.
    Unauthorized,
    /// Conversation, message or user id does not resolve.
    NotFound,
    /// Empty body, self-pairing or a malformed identifier.
    InvalidArgument,
    /// Storage or transport failure that the caller cannot act on.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not found",
            Self::InvalidArgument => "invalid argument",
            Self::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// A kind plus a human readable message, as carried over the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ChatError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ChatError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
