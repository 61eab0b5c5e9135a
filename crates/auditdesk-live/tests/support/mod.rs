//! In-process STOMP broker and session fixtures for the live channel tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use auditdesk_client_core::{
    ApiError, AuthApi, Credentials, MemoryStore, Session, TokenPair, TokenVault,
};
use auditdesk_live::stomp::decode_all;
use auditdesk_live::{Command, Frame};
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};

pub fn jwt(sub: &str, nonce: usize) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = json!({
        "sub": sub,
        "exp": chrono::Utc::now().timestamp() + 3600,
        "authorities": ["ROLE_ADMIN"],
        "jti": nonce,
    });
    let payload = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{payload}.sig")
}

/// Auth backend that mints a fresh token pair on every login or refresh.
#[derive(Default)]
pub struct MintingAuth {
    minted: AtomicUsize,
}

impl MintingAuth {
    fn mint(&self, username: &str) -> TokenPair {
        let nonce = self.minted.fetch_add(1, Ordering::SeqCst);
        TokenPair {
            access_token: jwt(username, nonce),
            refresh_token: format!("refresh-{nonce}"),
        }
    }
}

#[async_trait]
impl AuthApi for MintingAuth {
    async fn login(&self, credentials: &Credentials) -> Result<TokenPair, ApiError> {
        Ok(self.mint(&credentials.username))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenPair, ApiError> {
        Ok(self.mint("ana"))
    }

    async fn validate(&self, _access_token: &str) -> Result<bool, ApiError> {
        Ok(true)
    }

    async fn logout(&self, _access_token: Option<&str>) -> Result<(), ApiError> {
        Ok(())
    }
}

pub fn anonymous_session() -> Arc<Session> {
    let vault = TokenVault::new(Arc::new(MemoryStore::new()));
    Session::new(vault, Arc::new(MintingAuth::default()))
}

pub async fn logged_in_session() -> Result<Arc<Session>> {
    let session = anonymous_session();
    session.authenticate(&Credentials::new("ana", "secret")).await?;
    Ok(session)
}

#[derive(Default)]
pub struct Broker {
    pub connections: AtomicUsize,
    /// `?token=` of every upgrade request, in order.
    pub query_tokens: Mutex<Vec<String>>,
    /// `Authorization` header of every upgrade request, in order.
    pub upgrade_auth: Mutex<Vec<String>>,
    /// Every frame received from clients, across connections.
    pub received: Mutex<Vec<Frame>>,
    /// Answer CONNECT with an ERROR frame and hang up.
    pub reject: AtomicBool,
    pushes: Mutex<Option<broadcast::Sender<String>>>,
}

impl Broker {
    pub fn received(&self) -> Vec<Frame> {
        self.received.lock().expect("received lock").clone()
    }

    pub fn sent_to(&self, destination: &str) -> Vec<Frame> {
        self.received()
            .into_iter()
            .filter(|frame| frame.get("destination") == Some(destination))
            .filter(|frame| frame.command == Command::Send)
            .collect()
    }

    pub fn query_tokens(&self) -> Vec<String> {
        self.query_tokens.lock().expect("tokens lock").clone()
    }

    /// Delivers a MESSAGE frame to every connected client.
    pub fn push(&self, destination: &str, body: &serde_json::Value) {
        let frame = Frame::new(Command::Message)
            .header("destination", destination)
            .header("subscription", "sub")
            .header("message-id", "1")
            .body(body.to_string());
        if let Some(sender) = self.pushes.lock().expect("push lock").as_ref() {
            let _ = sender.send(frame.encode());
        }
    }

    fn push_receiver(&self) -> broadcast::Receiver<String> {
        let mut pushes = self.pushes.lock().expect("push lock");
        pushes
            .get_or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    }
}

pub struct BrokerHandle {
    pub url: String,
    pub broker: Arc<Broker>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub async fn spawn_broker() -> Result<BrokerHandle> {
    let broker = Arc::new(Broker::default());
    let app = Router::new()
        .route("/ws", get(upgrade))
        .with_state(Arc::clone(&broker));
    let (addr, shutdown) = spawn_server(app).await?;
    Ok(BrokerHandle {
        url: format!("ws://{addr}/ws"),
        broker,
        shutdown: Some(shutdown),
    })
}

async fn spawn_server(app: Router) -> Result<(SocketAddr, oneshot::Sender<()>)> {
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

async fn upgrade(
    State(broker): State<Arc<Broker>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    broker.connections.fetch_add(1, Ordering::SeqCst);
    if let Some(token) = query.get("token") {
        broker
            .query_tokens
            .lock()
            .expect("tokens lock")
            .push(token.clone());
    }
    if let Some(auth) = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
    {
        broker
            .upgrade_auth
            .lock()
            .expect("auth lock")
            .push(auth.to_string());
    }
    ws.on_upgrade(move |socket| serve_socket(broker, socket))
}

async fn serve_socket(broker: Arc<Broker>, mut socket: WebSocket) {
    let mut pushes = broker.push_receiver();
    loop {
        tokio::select! {
            message = socket.recv() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                };
                let Ok(frames) = decode_all(&text) else { return };
                for frame in frames {
                    let command = frame.command;
                    broker.received.lock().expect("received lock").push(frame);
                    if command != Command::Connect {
                        continue;
                    }
                    if broker.reject.load(Ordering::SeqCst) {
                        let error = Frame::new(Command::Error)
                            .header("message", "Access denied")
                            .encode();
                        let _ = socket.send(Message::Text(error)).await;
                        return;
                    }
                    let connected = Frame::new(Command::Connected)
                        .header("version", "1.2")
                        .header("heart-beat", "0,0")
                        .encode();
                    if socket.send(Message::Text(connected)).await.is_err() {
                        return;
                    }
                }
            }
            Ok(text) = pushes.recv() => {
                if socket.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Polls `check` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + limit;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {limit:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
