//! Live event channel: STOMP over WebSocket with token-driven reconnects and
//! a bounded error budget.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use auditdesk_client_core::{ClientConfig, Session, SessionEvent};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{LiveError, Result};
use crate::feed::{AuditLogEntry, DEFAULT_LOG_CAPACITY, LiveFeed, OnlineUser};
use crate::stomp::{Command, Frame, decode_all};

pub const TOPIC_ONLINE_USERS: &str = "/topic/online-users";
pub const TOPIC_LOGS: &str = "/topic/logs";
pub const DEST_UPDATE_PAGE: &str = "/app/update-page";
pub const DEST_GET_ONLINE_USERS: &str = "/app/get-online-users";

pub const CONNECTION_LOST_MESSAGE: &str = "Connection lost. Please refresh the page.";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_ERROR_BUDGET: u32 = 5;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_PAGE: &str = "/";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Live channel configuration.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub url: String,
    pub reconnect_delay: Duration,
    /// Failed connections tolerated before the channel gives up.
    pub error_budget: u32,
    pub log_capacity: usize,
    pub connect_timeout: Duration,
}

impl LiveConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            error_budget: DEFAULT_ERROR_BUDGET,
            log_capacity: DEFAULT_LOG_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self::new(config.ws_base_url.clone())
    }

    /// WebSocket URL with the access token as `?token=`.
    pub fn endpoint(&self, token: &str) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            "http" => url
                .set_scheme("ws")
                .map_err(|()| LiveError::InvalidUrl(self.url.clone()))?,
            "https" => url
                .set_scheme("wss")
                .map_err(|()| LiveError::InvalidUrl(self.url.clone()))?,
            other => {
                return Err(LiveError::InvalidUrl(format!(
                    "URL must use ws:// or wss:// scheme, got: {other}"
                )));
            }
        }
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the reconnect delay after the `attempt`-th failure.
    Reconnecting { attempt: u32 },
    /// Terminal; the channel no longer retries.
    Failed { message: String },
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone)]
pub enum LiveEvent {
    OnlineUsers(Vec<OnlineUser>),
    Log(AuditLogEntry),
}

enum TokenSignal {
    Changed,
    LoggedOut,
}

enum Ended {
    Token(TokenSignal),
    Failed(LiveError),
}

struct Shared {
    config: LiveConfig,
    session: Arc<Session>,
    state: watch::Sender<ChannelState>,
    events: broadcast::Sender<LiveEvent>,
    feed: Mutex<LiveFeed>,
    page: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
}

pub struct LiveChannel {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveChannel {
    pub fn new(session: Arc<Session>, config: LiveConfig) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let feed = LiveFeed::new(config.log_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                session,
                state,
                events,
                feed: Mutex::new(feed),
                page: Mutex::new(None),
                outbound: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Starts the connection supervisor. Fails without an access token.
    pub fn start(&self) -> Result<()> {
        if self.shared.session.access_token()?.is_none() {
            return Err(LiveError::MissingToken);
        }
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        *task = Some(tokio::spawn(supervise(Arc::clone(&self.shared))));
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
        self.shared.detach_outbound();
        self.shared.set_state(ChannelState::Disconnected);
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.shared.events.subscribe()
    }

    pub fn online_users(&self) -> Vec<OnlineUser> {
        lock(&self.shared.feed).online().to_vec()
    }

    /// Newest first.
    pub fn logs(&self) -> Vec<AuditLogEntry> {
        lock(&self.shared.feed).logs().cloned().collect()
    }

    pub fn current_page(&self) -> Option<String> {
        lock(&self.shared.page).clone()
    }

    /// Records the current page and republishes it when connected. Returns
    /// whether a frame was sent; nothing is queued while disconnected.
    pub fn navigate(&self, page: impl Into<String>) -> bool {
        *lock(&self.shared.page) = Some(page.into());
        let frame = self.shared.page_frame();
        self.shared.publish(frame)
    }

    pub fn request_online_users(&self) -> bool {
        self.shared
            .publish(Frame::send_json(DEST_GET_ONLINE_USERS, &json!({})))
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    fn detach_outbound(&self) {
        lock(&self.outbound).take();
    }

    fn publish(&self, frame: Frame) -> bool {
        match lock(&self.outbound).as_ref() {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }

    fn page_frame(&self) -> Frame {
        let username = self.session.state().username.unwrap_or_default();
        let page = lock(&self.page)
            .clone()
            .unwrap_or_else(|| DEFAULT_PAGE.to_string());
        Frame::send_json(DEST_UPDATE_PAGE, &json!({"username": username, "page": page}))
    }

    async fn run_connection(&self, token: &str) -> LiveError {
        match self.connect_and_pump(token).await {
            Ok(()) => LiveError::Closed,
            Err(error) => error,
        }
    }

    async fn connect_and_pump(&self, token: &str) -> Result<()> {
        let url = self.config.endpoint(token)?;
        let host = url.host_str().unwrap_or("localhost").to_string();
        let mut request = url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|error| LiveError::Protocol(error.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = timeout(self.config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                LiveError::Timeout(format!(
                    "connection timeout after {:?}",
                    self.config.connect_timeout
                ))
            })??;
        let (mut writer, mut reader) = stream.split();
        writer
            .send(Message::Text(Frame::connect(&host, token).encode()))
            .await?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let mut connected = false;
        loop {
            tokio::select! {
                Some(frame) = outbound_rx.recv() => {
                    writer.send(Message::Text(frame.encode())).await?;
                }
                message = reader.next() => {
                    let Some(message) = message else {
                        return Err(LiveError::Closed);
                    };
                    match message? {
                        Message::Text(text) => {
                            for frame in decode_all(&text)? {
                                match frame.command {
                                    Command::Connected if !connected => {
                                        connected = true;
                                        self.on_connected(&mut writer, outbound_tx.clone()).await?;
                                    }
                                    Command::Message => self.dispatch(&frame),
                                    Command::Error => {
                                        let message = frame
                                            .get("message")
                                            .map_or_else(|| frame.body.clone(), str::to_string);
                                        return Err(LiveError::Broker(message));
                                    }
                                    other => debug!(command = %other, "ignoring frame"),
                                }
                            }
                        }
                        Message::Close(_) => return Err(LiveError::Closed),
                        Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    async fn on_connected(
        &self,
        writer: &mut WsWriter,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Result<()> {
        writer
            .send(Message::Text(
                Frame::subscribe("sub-0", TOPIC_ONLINE_USERS).encode(),
            ))
            .await?;
        writer
            .send(Message::Text(Frame::subscribe("sub-1", TOPIC_LOGS).encode()))
            .await?;
        *lock(&self.outbound) = Some(outbound);
        writer
            .send(Message::Text(self.page_frame().encode()))
            .await?;
        self.set_state(ChannelState::Connected);
        info!(url = %self.config.url, "live channel connected");
        Ok(())
    }

    fn dispatch(&self, frame: &Frame) {
        match frame.get("destination") {
            Some(TOPIC_ONLINE_USERS) => match serde_json::from_str::<Vec<OnlineUser>>(&frame.body) {
                Ok(users) => {
                    lock(&self.feed).replace_online(users.clone());
                    let _ = self.events.send(LiveEvent::OnlineUsers(users));
                }
                Err(error) => warn!(%error, "unreadable online-users payload"),
            },
            Some(TOPIC_LOGS) => match serde_json::from_str::<AuditLogEntry>(&frame.body) {
                Ok(entry) => {
                    lock(&self.feed).push_log(entry.clone());
                    let _ = self.events.send(LiveEvent::Log(entry));
                }
                Err(error) => warn!(%error, "unreadable audit log payload"),
            },
            other => debug!(destination = ?other, "message for unknown destination"),
        }
    }
}

async fn next_token_signal(events: &mut broadcast::Receiver<SessionEvent>) -> TokenSignal {
    loop {
        match events.recv().await {
            Ok(SessionEvent::TokensChanged) | Err(broadcast::error::RecvError::Lagged(_)) => {
                return TokenSignal::Changed;
            }
            Ok(SessionEvent::LoginRequired) => return TokenSignal::LoggedOut,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Connects, and reconnects after the configured delay until the error
/// budget is spent. A token change restarts the connection immediately and
/// restores the budget; a logout stops the channel.
async fn supervise(shared: Arc<Shared>) {
    let mut session_events = shared.session.subscribe_events();
    let mut failures: u32 = 0;
    loop {
        let token = match shared.session.access_token() {
            Ok(Some(token)) => token,
            Ok(None) => {
                info!("no access token; live channel stopping");
                shared.set_state(ChannelState::Disconnected);
                return;
            }
            Err(error) => {
                warn!(%error, "token store unavailable; live channel stopping");
                shared.set_state(ChannelState::Disconnected);
                return;
            }
        };

        shared.set_state(ChannelState::Connecting);
        let ended = tokio::select! {
            error = shared.run_connection(&token) => Ended::Failed(error),
            signal = next_token_signal(&mut session_events) => Ended::Token(signal),
        };
        shared.detach_outbound();

        let error = match ended {
            Ended::Token(TokenSignal::Changed) => {
                debug!("access token changed; reconnecting live channel");
                failures = 0;
                continue;
            }
            Ended::Token(TokenSignal::LoggedOut) => {
                info!("session ended; live channel stopping");
                shared.set_state(ChannelState::Disconnected);
                return;
            }
            Ended::Failed(error) => error,
        };

        failures += 1;
        if failures > shared.config.error_budget {
            error!(%error, failures, "live channel error budget exhausted");
            shared.set_state(ChannelState::Failed {
                message: CONNECTION_LOST_MESSAGE.to_string(),
            });
            return;
        }
        warn!(%error, attempt = failures, budget = shared.config.error_budget, "live connection lost; retrying");
        shared.set_state(ChannelState::Reconnecting { attempt: failures });

        tokio::select! {
            () = tokio::time::sleep(shared.config.reconnect_delay) => {}
            signal = next_token_signal(&mut session_events) => match signal {
                TokenSignal::Changed => failures = 0,
                TokenSignal::LoggedOut => {
                    shared.set_state(ChannelState::Disconnected);
                    return;
                }
            },
        }
    }
}
