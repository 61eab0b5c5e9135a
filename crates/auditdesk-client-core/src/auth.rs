use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Value, json};

use crate::config::ClientConfig;
use crate::error::{ApiError, AuthenticationError, extract_error_code, extract_server_message};
use crate::store::TokenPair;

#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into().trim().to_string(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Calls under the authentication sub-path. These never carry the bearer
/// interceptor and never trigger refresh-and-retry.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<TokenPair, ApiError>;
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError>;
    /// `Ok(false)` means the server looked at the token and rejected it.
    async fn validate(&self, access_token: &str) -> Result<bool, ApiError>;
    async fn logout(&self, access_token: Option<&str>) -> Result<(), ApiError>;
}

pub struct HttpAuthApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAuthApi {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: format!("{}{}", config.api_base_url, config.auth_path),
        })
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    async fn post(
        &self,
        path: &str,
        body: &Value,
        bearer: Option<&str>,
    ) -> Result<(StatusCode, Value), ApiError> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        tracing::debug!(path, status = status.as_u16(), "auth endpoint responded");
        Ok((status, value))
    }
}

fn token_pair_from(
    status: StatusCode,
    value: Value,
    failure_code: &str,
) -> Result<TokenPair, ApiError> {
    let success = value
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or_else(|| status.is_success());
    if status.is_success() && success {
        let data = match value {
            Value::Object(mut map) if map.contains_key("data") => {
                map.remove("data").unwrap_or(Value::Null)
            }
            other => other,
        };
        return serde_json::from_value(data).map_err(|error| {
            AuthenticationError::new(
                "INVALID_TOKEN_RESPONSE",
                format!("token response could not be read: {error}"),
            )
            .into()
        });
    }

    let code = extract_error_code(&value).unwrap_or_else(|| failure_code.to_string());
    let message = extract_server_message(&value.to_string()).unwrap_or_else(|| {
        format!(
            "authentication request failed with HTTP {}",
            status.as_u16()
        )
    });
    Err(AuthenticationError::new(code, message).into())
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, credentials: &Credentials) -> Result<TokenPair, ApiError> {
        let body = json!({
            "username": credentials.username,
            "password": credentials.password,
        });
        let (status, value) = self.post("/login", &body, None).await?;
        token_pair_from(status, value, "LOGIN_FAILED")
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        let body = json!({ "refreshToken": refresh_token });
        let (status, value) = self.post("/refresh", &body, None).await?;
        token_pair_from(status, value, "REFRESH_FAILED")
    }

    async fn validate(&self, access_token: &str) -> Result<bool, ApiError> {
        let body = json!({ "token": access_token });
        let (status, value) = self.post("/validate-token-body", &body, None).await?;
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(ApiError::Http {
                status: status.as_u16(),
                message: extract_server_message(&value.to_string()).unwrap_or_default(),
            });
        }
        Ok(value
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn logout(&self, access_token: Option<&str>) -> Result<(), ApiError> {
        let (status, value) = self.post("/logout", &json!({}), access_token).await?;
        if status.is_success() {
            return Ok(());
        }
        let message = extract_server_message(&value.to_string())
            .unwrap_or_else(|| format!("logout failed with HTTP {}", status.as_u16()));
        Err(AuthenticationError::new("LOGOUT_FAILED", message).into())
    }
}
