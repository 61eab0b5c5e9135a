//! Live channel error types.

use auditdesk_client_core::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("not authenticated; refusing to connect")]
    MissingToken,

    #[error("connection closed by server")]
    Closed,

    /// The broker answered with a STOMP `ERROR` frame.
    #[error("broker error: {0}")]
    Broker(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session error: {0}")]
    Session(#[from] ApiError),
}

impl From<tokio_tungstenite::tungstenite::Error> for LiveError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;
