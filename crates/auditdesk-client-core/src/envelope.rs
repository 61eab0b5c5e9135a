//! Decoding of the backend's `{success, data, error?, timestamp}` envelope.
//!
//! Endpoints answer either with a bare payload or with the envelope; callers
//! get the payload either way.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ApiError, extract_server_message};

/// Strips the envelope when present. `success: false` becomes
/// [`ApiError::Rejected`].
pub fn unwrap_data(value: Value) -> Result<Value, ApiError> {
    let Value::Object(mut map) = value else {
        return Ok(value);
    };
    let Some(success) = map.get("success").and_then(Value::as_bool) else {
        return Ok(Value::Object(map));
    };
    if !success {
        let body = Value::Object(map).to_string();
        return Err(ApiError::Rejected {
            message: extract_server_message(&body).unwrap_or_default(),
        });
    }
    Ok(map.remove("data").unwrap_or(Value::Null))
}

pub fn decode_payload<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    let value: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(body)?
    };
    let data = unwrap_data(value)?;
    serde_json::from_value(data).map_err(|error| ApiError::Decode(error.to_string()))
}
