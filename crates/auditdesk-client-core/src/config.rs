use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8080/api";
pub const DEFAULT_WS_BASE_URL: &str = "ws://127.0.0.1:8080/ws";
pub const ENV_API_BASE_URL: &str = "AUDITDESK_API_BASE_URL";
pub const ENV_WS_BASE_URL: &str = "AUDITDESK_WS_BASE_URL";
pub const DEFAULT_AUTH_PATH: &str = "/auth";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Values baked in at build time take precedence over the runtime environment.
const BUILD_API_BASE_URL: Option<&str> = option_env!("AUDITDESK_API_BASE_URL");
const BUILD_WS_BASE_URL: Option<&str> = option_env!("AUDITDESK_WS_BASE_URL");

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("base url must not be empty")]
    EmptyBaseUrl,
    #[error("base url must use one of {expected} and include a host")]
    InvalidBaseUrl { expected: &'static str },
}

/// Where a resolved setting came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    BuildTime,
    Environment,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub auth_path: String,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(api_base_url: &str, ws_base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            api_base_url: normalize_http_base_url(api_base_url)?,
            ws_base_url: normalize_ws_base_url(ws_base_url)?,
            auth_path: DEFAULT_AUTH_PATH.to_string(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let (api, api_source) = resolve_setting(
            BUILD_API_BASE_URL,
            ENV_API_BASE_URL,
            DEFAULT_API_BASE_URL,
        );
        let (ws, ws_source) =
            resolve_setting(BUILD_WS_BASE_URL, ENV_WS_BASE_URL, DEFAULT_WS_BASE_URL);
        tracing::debug!(?api_source, ?ws_source, "resolved client endpoints");
        Self::new(&api, &ws)
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_auth_path(mut self, auth_path: impl Into<String>) -> Self {
        let raw = auth_path.into();
        let trimmed = raw.trim().trim_end_matches('/');
        self.auth_path = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        };
        self
    }
}

fn resolve_setting(
    build_time: Option<&'static str>,
    env_key: &str,
    default: &'static str,
) -> (String, ConfigSource) {
    if let Some(value) = build_time.map(str::trim).filter(|value| !value.is_empty()) {
        return (value.to_string(), ConfigSource::BuildTime);
    }
    if let Some(value) = env_non_empty(env_key) {
        return (value, ConfigSource::Environment);
    }
    (default.to_string(), ConfigSource::Default)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn normalize_http_base_url(raw: &str) -> Result<String, ConfigError> {
    normalize_base_url(raw, &["http://", "https://"], "http:// or https://")
}

pub fn normalize_ws_base_url(raw: &str) -> Result<String, ConfigError> {
    normalize_base_url(
        raw,
        &["ws://", "wss://", "http://", "https://"],
        "ws://, wss://, http:// or https://",
    )
}

fn normalize_base_url(
    raw: &str,
    schemes: &[&str],
    expected: &'static str,
) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyBaseUrl);
    }
    if !schemes.iter().any(|scheme| trimmed.starts_with(scheme)) {
        return Err(ConfigError::InvalidBaseUrl { expected });
    }
    let Some((_, remainder)) = trimmed.split_once("://") else {
        return Err(ConfigError::InvalidBaseUrl { expected });
    };
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(ConfigError::InvalidBaseUrl { expected });
    }
    Ok(trimmed.to_string())
}
