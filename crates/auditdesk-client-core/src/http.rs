//! Outbound request wrapper: base URL, bearer attachment, 401 recovery and
//! 403 forced re-login. This is the only place that retries a request with a
//! fresh token.

use std::sync::Arc;

use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cancel::{CancelToken, run_cancellable};
use crate::config::ClientConfig;
use crate::envelope::decode_payload;
use crate::error::{ApiError, AuthenticationError, extract_server_message};
use crate::session::Session;

pub const TOTAL_COUNT_HEADER: &str = "x-total-count";

#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    #[must_use]
    pub fn query_pairs(mut self, pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.query.extend(pairs);
        self
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, ApiError> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// `X-Total-Count`, when the server sent a parseable one.
    pub fn total_count(&self) -> Option<u64> {
        self.header(TOTAL_COUNT_HEADER)
            .and_then(|value| value.trim().parse().ok())
    }

    /// Payload with the response envelope removed.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        decode_payload(&self.body)
    }

    pub fn raw_json(&self) -> Result<Value, ApiError> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    auth_path: String,
    session: Arc<Session>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig, session: Arc<Session>) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.api_base_url.clone(),
            auth_path: config.auth_path.clone(),
            session,
        })
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn is_auth_path(&self, path: &str) -> bool {
        let normalized = path.trim_start_matches('/');
        let auth = self.auth_path.trim_start_matches('/');
        normalized == auth || normalized.starts_with(&format!("{auth}/"))
    }

    fn url_for(&self, path: &str) -> String {
        if path.is_empty() {
            return self.base_url.clone();
        }
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Sends `request`, recovering once from a 401 through the session's
    /// single-flight refresh. Non-2xx answers become errors.
    pub async fn send(
        &self,
        request: &ApiRequest,
        cancel: Option<&CancelToken>,
    ) -> Result<ApiResponse, ApiError> {
        run_cancellable(cancel, self.send_with_recovery(request)).await
    }

    async fn send_with_recovery(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let response = self.dispatch(request, None).await?;
        if response.status != StatusCode::UNAUTHORIZED || self.is_auth_path(&request.path) {
            return self.finish(response);
        }

        debug!(path = %request.path, "401 received; waiting on token refresh");
        let token = self.session.refresh().await?;
        // Second and last attempt: a 401 here is not recovered again.
        let retried = self.dispatch(request, Some(&token)).await?;
        if retried.status == StatusCode::UNAUTHORIZED {
            warn!(path = %request.path, "request still unauthorized after refresh");
            self.session.force_relogin();
            return Err(AuthenticationError::session_expired().into());
        }
        self.finish(retried)
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        token_override: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let mut builder = self
            .http
            .request(request.method.clone(), self.url_for(&request.path));
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if !self.is_auth_path(&request.path) {
            let token = match token_override {
                Some(token) => Some(token.to_string()),
                None => self.session.access_token()?,
            };
            if let Some(token) = token {
                builder = builder.bearer_auth(token);
            }
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        debug!(
            method = %request.method,
            path = %request.path,
            status = status.as_u16(),
            "api response"
        );
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    fn finish(&self, response: ApiResponse) -> Result<ApiResponse, ApiError> {
        if response.status == StatusCode::FORBIDDEN {
            warn!("403 received; clearing session and requiring login");
            self.session.force_relogin();
            return Err(ApiError::Forbidden);
        }
        if !response.status.is_success() {
            let body = String::from_utf8_lossy(&response.body);
            return Err(ApiError::Http {
                status: response.status.as_u16(),
                message: extract_server_message(&body).unwrap_or_default(),
            });
        }
        Ok(response)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(&ApiRequest::get(path), None).await?.data()
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(&ApiRequest::post(path).json(body)?, None)
            .await?
            .data()
    }

    pub async fn put_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(&ApiRequest::put(path).json(body)?, None)
            .await?
            .data()
    }

    pub async fn patch_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(&ApiRequest::patch(path).json(body)?, None)
            .await?
            .data()
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(&ApiRequest::delete(path), None).await?;
        Ok(())
    }
}
