//! In-process backend stub shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use auditdesk_client_core::{
    ApiClient, ClientConfig, HttpAuthApi, KeyValueStore, MemoryStore, Session, TokenPair,
    TokenVault,
};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub async fn spawn_http_server(app: Router) -> Result<(SocketAddr, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let _ = server.await;
    });
    Ok((addr, shutdown_tx))
}

/// Unsigned JWT-shaped token; the client only ever decodes the payload.
pub fn jwt(sub: &str, expires_in_secs: i64, authorities: &[&str], nonce: usize) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = json!({
        "sub": sub,
        "exp": chrono::Utc::now().timestamp() + expires_in_secs,
        "authorities": authorities,
        "jti": nonce,
    });
    let payload = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{payload}.sig")
}

pub fn envelope(data: Value) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": data,
        "timestamp": "2024-05-01T10:00:00Z",
    }))
}

pub fn failure(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "error": {"code": code, "message": message},
            "timestamp": "2024-05-01T10:00:00Z",
        })),
    )
        .into_response()
}

pub fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Authentication surface with counters. Protected routes accept only the
/// most recently minted access token.
#[derive(Default)]
pub struct AuthStub {
    pub current_access: Mutex<String>,
    pub minted: AtomicUsize,
    pub login_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub validate_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub refresh_fails: AtomicBool,
    pub logout_fails: AtomicBool,
    pub refresh_delay_ms: AtomicUsize,
    pub authorities: Mutex<Vec<String>>,
}

impl AuthStub {
    pub fn new() -> Arc<Self> {
        let stub = Self::default();
        *stub.authorities.lock().expect("authorities") = vec!["ROLE_ADMIN".to_string()];
        Arc::new(stub)
    }

    pub fn mint(&self, expires_in_secs: i64) -> TokenPair {
        let nonce = self.minted.fetch_add(1, Ordering::SeqCst);
        let authorities = self.authorities.lock().expect("authorities").clone();
        let authorities = authorities.iter().map(String::as_str).collect::<Vec<_>>();
        let access = jwt("auditor", expires_in_secs, &authorities, nonce);
        *self.current_access.lock().expect("access") = access.clone();
        TokenPair {
            access_token: access,
            refresh_token: format!("refresh-{nonce}"),
        }
    }

    pub fn accepts(&self, headers: &HeaderMap) -> bool {
        let current = self.current_access.lock().expect("access").clone();
        !current.is_empty() && bearer(headers).as_deref() == Some(current.as_str())
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub fn auth_routes(stub: Arc<AuthStub>) -> Router {
    async fn login(State(stub): State<Arc<AuthStub>>, Json(body): Json<Value>) -> Response {
        stub.login_calls.fetch_add(1, Ordering::SeqCst);
        if body.get("password").and_then(Value::as_str) != Some("secret") {
            return failure(
                StatusCode::UNAUTHORIZED,
                "BAD_CREDENTIALS",
                "Invalid username or password",
            );
        }
        let pair = stub.mint(3600);
        envelope(json!({"accessToken": pair.access_token, "refreshToken": pair.refresh_token}))
            .into_response()
    }

    async fn refresh(State(stub): State<Arc<AuthStub>>) -> Response {
        stub.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = stub.refresh_delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if stub.refresh_fails.load(Ordering::SeqCst) {
            return failure(
                StatusCode::UNAUTHORIZED,
                "REFRESH_TOKEN_EXPIRED",
                "Refresh token expired",
            );
        }
        let pair = stub.mint(3600);
        envelope(json!({"accessToken": pair.access_token, "refreshToken": pair.refresh_token}))
            .into_response()
    }

    async fn validate(State(stub): State<Arc<AuthStub>>, Json(body): Json<Value>) -> Response {
        stub.validate_calls.fetch_add(1, Ordering::SeqCst);
        let current = stub.current_access.lock().expect("access").clone();
        let token = body.get("token").and_then(Value::as_str).unwrap_or_default();
        if !current.is_empty() && token == current {
            Json(json!({"success": true})).into_response()
        } else {
            failure(StatusCode::UNAUTHORIZED, "INVALID_TOKEN", "Token is not valid")
        }
    }

    async fn logout(State(stub): State<Arc<AuthStub>>) -> StatusCode {
        stub.logout_calls.fetch_add(1, Ordering::SeqCst);
        if stub.logout_fails.load(Ordering::SeqCst) {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        stub.current_access.lock().expect("access").clear();
        StatusCode::OK
    }

    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/validate-token-body", post(validate))
        .route("/auth/logout", post(logout))
        .route("/auth/ping", get(|| async { StatusCode::UNAUTHORIZED }))
        .with_state(stub)
}

pub struct Harness {
    pub base_url: String,
    pub store: Arc<MemoryStore>,
    pub session: Arc<Session>,
    pub api: ApiClient,
    pub config: ClientConfig,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Harness {
    pub async fn start(app: Router) -> Result<Self> {
        Self::start_with_store(app, Arc::new(MemoryStore::new())).await
    }

    pub async fn start_with_store(app: Router, store: Arc<MemoryStore>) -> Result<Self> {
        let (addr, shutdown) = spawn_http_server(app).await?;
        let base_url = format!("http://{addr}");
        let config = ClientConfig::new(&base_url, &format!("ws://{addr}/ws"))?
            .with_request_timeout(Duration::from_secs(5));
        let session = session_on(&config, store.clone())?;
        let api = ApiClient::new(&config, session.clone())?;
        Ok(Self {
            base_url,
            store,
            session,
            api,
            config,
            shutdown: Some(shutdown),
        })
    }

    pub fn persist(&self, pair: &TokenPair) {
        self.session.vault().persist(pair).expect("persist tokens");
    }

    pub fn stored(&self, key: &str) -> Option<String> {
        self.store.get(key).expect("store read")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub fn session_on(config: &ClientConfig, store: Arc<MemoryStore>) -> Result<Arc<Session>> {
    let auth = HttpAuthApi::new(config)?;
    let store: Arc<dyn KeyValueStore> = store;
    Ok(Session::new(TokenVault::new(store), Arc::new(auth)))
}
