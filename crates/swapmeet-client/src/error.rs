use swapmeet_types::error::{ChatError, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server understood the request and refused it.
    #[error(transparent)]
    Rejected(#[from] ChatError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("gateway connection is closed")]
    ChannelClosed,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected(e) => e.kind,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Http(_) | Self::WebSocket(_) | Self::Json(_) | Self::ChannelClosed => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<&ClientError> for ChatError {
    fn from(e: &ClientError) -> Self {
        match e {
            ClientError::Rejected(inner) => inner.clone(),
            other => ChatError::new(other.kind(), other.to_string()),
        }
    }
}
