//! Unverified decoding of access-token claims.
//!
//! The client never checks signatures; it only reads `sub`, `exp` and
//! `authorities` to drive UI state and proactive refresh. The server remains
//! the authority on whether a token is valid.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

const ADMIN_AUTHORITIES: &[&str] = &["ROLE_ADMIN", "ADMIN"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimsError {
    #[error("token must have three dot-separated segments")]
    Malformed,
    #[error("token payload is not valid base64url")]
    Encoding,
    #[error("token payload is not valid JSON: {0}")]
    Json(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AccessClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_authorities")]
    pub authorities: Vec<String>,
}

impl AccessClaims {
    pub fn is_admin(&self) -> bool {
        self.authorities
            .iter()
            .any(|authority| ADMIN_AUTHORITIES.contains(&authority.as_str()))
    }

    /// Seconds left before `exp`; negative once expired, `None` without `exp`.
    pub fn seconds_until_expiry(&self, now: DateTime<Utc>) -> Option<i64> {
        self.exp.map(|exp| exp - now.timestamp())
    }
}

pub fn decode_claims(token: &str) -> Result<AccessClaims, ClaimsError> {
    let mut segments = token.trim().split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(ClaimsError::Malformed);
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| ClaimsError::Encoding)?;
    serde_json::from_slice(&bytes).map_err(|error| ClaimsError::Json(error.to_string()))
}

/// Accepts `["ROLE_ADMIN"]`, `[{"authority":"ROLE_ADMIN"}]` or
/// `"ROLE_ADMIN,ROLE_USER"`.
fn deserialize_authorities<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let authorities = match value {
        Value::Array(entries) => entries
            .into_iter()
            .filter_map(|entry| match entry {
                Value::String(authority) => Some(authority),
                Value::Object(map) => map
                    .get("authority")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect(),
        Value::String(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|authority| !authority.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    Ok(authorities)
}
