//! Error types shared by the session, transport and data controllers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::StoreError;

pub const GENERIC_FAILURE_MESSAGE: &str = "Request failed. Please try again.";

/// Normalized authentication failure. Raised on login, refresh and logout
/// failures; the session is always cleared when one of these escapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct AuthenticationError {
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl AuthenticationError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn session_expired() -> Self {
        Self::new("SESSION_EXPIRED", "Your session has expired. Please log in again.")
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthenticationError),

    #[error("access forbidden; session cleared")]
    Forbidden,

    #[error("request failed with HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The server answered 2xx but the envelope reported `success: false`.
    #[error("request rejected: {message}")]
    Rejected { message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("response decode failed: {0}")]
    Decode(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("token store error: {0}")]
    Store(#[from] StoreError),
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        Self::Decode(error.to_string())
    }
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Forbidden => Some(403),
            _ => None,
        }
    }

    /// Optimistic-version mismatch reported by the server.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Http { status: 409, .. })
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::Forbidden)
    }

    /// Human-readable message for transient notifications. Prefers the
    /// server-supplied message and falls back to a generic string.
    pub fn user_message(&self) -> String {
        match self {
            Self::Authentication(error) => error.message.clone(),
            Self::Forbidden => "You no longer have access. Please log in again.".to_string(),
            Self::Http { message, .. } | Self::Rejected { message } if !message.trim().is_empty() => {
                message.clone()
            }
            Self::Cancelled => "Request cancelled.".to_string(),
            _ => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }
}

/// Pulls a message out of the error bodies the backend is known to send:
/// `{message}`, `{error: "..."}`, `{error: {message}}` and the
/// `{success: false, error: {...}}` envelope.
pub fn extract_server_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let candidate = value
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| value.get("error").and_then(Value::as_str))
        .or_else(|| {
            value
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
        })
        .or_else(|| value.get("detail").and_then(Value::as_str))?;
    let trimmed = candidate.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Error code from an envelope, when present.
pub(crate) fn extract_error_code(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|error| error.get("code"))
        .and_then(Value::as_str)
        .or_else(|| value.get("code").and_then(Value::as_str))
        .map(str::to_string)
}
