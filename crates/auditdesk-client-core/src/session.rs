//! Session/token controller.
//!
//! `Session` is the single injected owner of the token pair. The HTTP wrapper,
//! the tree/table controllers and the live channel all hold an
//! `Arc<Session>`; nothing reads tokens through globals.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::auth::{AuthApi, Credentials};
use crate::claims::decode_claims;
use crate::error::{ApiError, AuthenticationError};
use crate::store::TokenVault;

/// Poll period of the expiry check.
pub const AUTO_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
/// Refresh once the access token has this many seconds or fewer left.
pub const REFRESH_THRESHOLD_SECS: i64 = 30;

const EVENT_CHANNEL_CAPACITY: usize = 32;

type RefreshOutcome = Result<String, AuthenticationError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Unknown,
    Checking,
    Authenticated,
    Unauthenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub phase: AuthPhase,
    pub is_admin: bool,
    pub username: Option<String>,
}

impl SessionState {
    fn unknown() -> Self {
        Self {
            phase: AuthPhase::Unknown,
            is_admin: false,
            username: None,
        }
    }

    fn unauthenticated() -> Self {
        Self {
            phase: AuthPhase::Unauthenticated,
            is_admin: false,
            username: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == AuthPhase::Authenticated
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.phase, AuthPhase::Unknown | AuthPhase::Checking)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The driver should show the login screen.
    LoginRequired,
    /// The stored tokens were replaced, by this session's refresh or login
    /// or by another writer.
    TokensChanged,
}

/// Leader side of a single-flight refresh. Dropping it without `finish`
/// (for example when the leading request is cancelled) releases every queued
/// waiter with an error instead of leaving them parked forever.
struct RefreshFlight<'a> {
    gate: &'a Mutex<Option<Vec<oneshot::Sender<RefreshOutcome>>>>,
    finished: bool,
}

impl RefreshFlight<'_> {
    fn finish(mut self, outcome: &RefreshOutcome) {
        self.finished = true;
        self.release(outcome);
    }

    fn release(&self, outcome: &RefreshOutcome) {
        let waiters = lock(self.gate).take().unwrap_or_default();
        debug!(waiters = waiters.len(), "releasing refresh waiters");
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl Drop for RefreshFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.release(&Err(AuthenticationError::new(
                "REFRESH_ABORTED",
                "token refresh was abandoned",
            )));
        }
    }
}

pub struct Session {
    vault: TokenVault,
    api: Arc<dyn AuthApi>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    refresh_gate: Mutex<Option<Vec<oneshot::Sender<RefreshOutcome>>>>,
    visibility: Notify,
}

impl Session {
    pub fn new(vault: TokenVault, api: Arc<dyn AuthApi>) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::unknown());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            vault,
            api,
            state,
            events,
            refresh_gate: Mutex::new(None),
            visibility: Notify::new(),
        })
    }

    pub fn vault(&self) -> &TokenVault {
        &self.vault
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    pub fn is_admin(&self) -> bool {
        self.state.borrow().is_admin
    }

    /// Current access token, read from the store on every call.
    pub fn access_token(&self) -> Result<Option<String>, ApiError> {
        Ok(self.vault.access_token()?)
    }

    /// Reconciles local state with the stored tokens and the server.
    /// Returns whether the session ended up authenticated. Any failure along
    /// the way clears both tokens.
    pub async fn check_token(&self) -> bool {
        self.state.send_modify(|state| state.phase = AuthPhase::Checking);

        let resolved = match self.resolve_access_token().await {
            Ok(Some(access)) => decode_claims(&access).map_err(|error| {
                ApiError::Authentication(AuthenticationError::new(
                    "INVALID_TOKEN",
                    format!("access token could not be decoded: {error}"),
                ))
            }),
            Ok(None) => {
                debug!("no usable tokens; session is unauthenticated");
                self.clear_session();
                return false;
            }
            Err(error) => Err(error),
        };

        match resolved {
            Ok(claims) => {
                let is_admin = claims.is_admin();
                self.state.send_replace(SessionState {
                    phase: AuthPhase::Authenticated,
                    is_admin,
                    username: claims.sub,
                });
                true
            }
            Err(error) => {
                warn!(%error, "token check failed; clearing session");
                self.clear_session();
                false
            }
        }
    }

    async fn resolve_access_token(&self) -> Result<Option<String>, ApiError> {
        let (access, refresh) = self.vault.tokens()?;
        match (access, refresh) {
            (None, None) => Ok(None),
            (None, Some(_)) => Ok(Some(self.refresh().await?)),
            (Some(access), refresh) => {
                if self.api.validate(&access).await? {
                    Ok(Some(access))
                } else if refresh.is_some() {
                    debug!("access token rejected by server; refreshing");
                    Ok(Some(self.refresh().await?))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Refreshes when the access token is within [`REFRESH_THRESHOLD_SECS`]
    /// of expiry. Returns whether a refresh happened.
    pub async fn auto_refresh_token(&self) -> bool {
        let Ok(Some(access)) = self.vault.access_token() else {
            return false;
        };
        let Ok(claims) = decode_claims(&access) else {
            return false;
        };
        let Some(remaining) = claims.seconds_until_expiry(Utc::now()) else {
            return false;
        };
        if remaining > REFRESH_THRESHOLD_SECS {
            return false;
        }

        debug!(remaining, "access token close to expiry; refreshing");
        match self.refresh().await {
            Ok(_) => {
                self.check_token().await;
                true
            }
            Err(error) => {
                warn!(%error, "proactive refresh failed");
                false
            }
        }
    }

    /// Exchanges credentials for a token pair, persists it and reconciles.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<(), ApiError> {
        let pair = match self.api.login(credentials).await {
            Ok(pair) => pair,
            Err(error) => {
                self.clear_session();
                return Err(error);
            }
        };
        self.vault.persist(&pair)?;
        if self.login().await {
            info!(username = %credentials.username, "logged in");
            let _ = self.events.send(SessionEvent::TokensChanged);
            Ok(())
        } else {
            Err(AuthenticationError::new("LOGIN_FAILED", "login could not be confirmed").into())
        }
    }

    /// Tokens are expected to be persisted already.
    pub async fn login(&self) -> bool {
        self.check_token().await
    }

    /// Best-effort server logout, then unconditional local teardown.
    pub async fn logout(&self) {
        let access = self.vault.access_token().ok().flatten();
        if let Err(error) = self.api.logout(access.as_deref()).await {
            warn!(%error, "server-side logout failed");
        }
        self.force_relogin();
        info!("logged out");
    }

    /// Clears the session and asks the driver to show the login screen.
    pub fn force_relogin(&self) {
        self.clear_session();
        let _ = self.events.send(SessionEvent::LoginRequired);
    }

    fn clear_session(&self) {
        // Skipping the write when nothing is stored keeps two sessions on one
        // store from echoing change events back and forth.
        let already_empty = matches!(self.vault.tokens(), Ok((None, None)));
        if !already_empty && let Err(error) = self.vault.clear() {
            warn!(%error, "failed to clear stored tokens");
        }
        self.state.send_replace(SessionState::unauthenticated());
    }

    /// Single-flight refresh: at most one refresh request is in flight per
    /// session. Callers arriving while one is running are queued in arrival
    /// order and receive its outcome.
    pub async fn refresh(&self) -> Result<String, AuthenticationError> {
        let waiter = {
            let mut gate = lock(&self.refresh_gate);
            match gate.as_mut() {
                Some(queue) => {
                    let (sender, receiver) = oneshot::channel();
                    queue.push(sender);
                    Some(receiver)
                }
                None => {
                    *gate = Some(Vec::new());
                    None
                }
            }
        };

        if let Some(receiver) = waiter {
            return receiver.await.unwrap_or_else(|_| {
                Err(AuthenticationError::new(
                    "REFRESH_ABORTED",
                    "token refresh was abandoned",
                ))
            });
        }

        let flight = RefreshFlight {
            gate: &self.refresh_gate,
            finished: false,
        };
        let outcome = self.perform_refresh().await;
        flight.finish(&outcome);
        outcome
    }

    async fn perform_refresh(&self) -> RefreshOutcome {
        let refresh_token = match self.vault.refresh_token() {
            Ok(Some(token)) => token,
            Ok(None) => {
                self.force_relogin();
                return Err(AuthenticationError::new(
                    "NO_REFRESH_TOKEN",
                    "no refresh token available",
                ));
            }
            Err(error) => {
                self.force_relogin();
                return Err(AuthenticationError::new("STORE_UNAVAILABLE", error.to_string()));
            }
        };

        match self.api.refresh(&refresh_token).await {
            Ok(pair) => {
                if let Err(error) = self.vault.persist(&pair) {
                    self.force_relogin();
                    return Err(AuthenticationError::new("STORE_UNAVAILABLE", error.to_string()));
                }
                debug!("access token refreshed");
                let _ = self.events.send(SessionEvent::TokensChanged);
                Ok(pair.access_token)
            }
            Err(error) => {
                warn!(%error, "token refresh failed; clearing session");
                self.force_relogin();
                Err(match error {
                    ApiError::Authentication(auth) => auth,
                    other => AuthenticationError::new("REFRESH_FAILED", other.to_string()),
                })
            }
        }
    }

    /// Call when the driver regains focus; the supervisor re-validates.
    pub fn notify_visibility_regained(&self) {
        self.visibility.notify_one();
    }

    /// Runs the session lifecycle: an initial check, the periodic expiry
    /// check, re-validation on visibility regain, and re-validation when
    /// another writer changes the stored tokens.
    pub fn spawn_supervisor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let session = Arc::clone(self);
        let mut changes = self.vault.subscribe();
        tokio::spawn(async move {
            session.check_token().await;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        session.auto_refresh_token().await;
                    }
                    () = session.visibility.notified() => {
                        debug!("visibility regained; re-validating session");
                        session.check_token().await;
                    }
                    change = changes.recv() => match change {
                        Ok(change) if change.origin != session.vault.origin() && change.touches_tokens() => {
                            debug!(origin = change.origin, "tokens changed by another writer");
                            session.check_token().await;
                            let _ = session.events.send(SessionEvent::TokensChanged);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "missed store change notifications; re-validating");
                            session.check_token().await;
                            let _ = session.events.send(SessionEvent::TokensChanged);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}
