//! Token lifecycle coordinator
//!
//! Keeps the real-time connection's authentication in step with the access
//! token: refreshes it shortly before it expires, refreshes on demand when
//! the server rejects it, and ends the session when a refresh fails.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::refresh::RefreshCycle;
use super::store::TokenStore;
use super::token;
use crate::api::{AuthApi, AuthSession, LoginRequest, RegisterRequest, VerifyEmailRequest};
use crate::config::SessionSettings;
use crate::error::{Error, Result};
use crate::realtime::{ConnectionManager, StatusEvent};

// ─────────────────────────────────────────────────────────────────
// Session State
// ─────────────────────────────────────────────────────────────────

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum LogoutReason {
    /// The user logged out
    UserRequested,
    /// A token refresh failed
    RefreshFailed(String),
    /// The server terminated the session
    ServerLogout,
    /// The cold-start silent refresh failed
    SilentRefreshFailed,
}

impl LogoutReason {
    /// Message a UI shows on the login screen
    pub fn user_message(&self) -> &'static str {
        match self {
            LogoutReason::UserRequested => "You have been logged out.",
            LogoutReason::RefreshFailed(_) => "Your session has expired. Please log in again.",
            LogoutReason::ServerLogout => "You have been logged out by the server.",
            LogoutReason::SilentRefreshFailed => "Please log in to continue.",
        }
    }
}

/// Whether the user currently has a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Anonymous { reason: Option<LogoutReason> },
    Authenticated,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Anonymous { reason: None }
    }
}

// ─────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────

/// Deadline recorded for delays too long to add to the clock
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

struct RefreshTimer {
    generation: u64,
    due: Instant,
    handle: JoinHandle<()>,
}

struct Inner {
    api: Arc<dyn AuthApi>,
    connection: ConnectionManager,
    tokens: Arc<dyn TokenStore>,
    lead: Duration,
    refresh: RefreshCycle,
    timer: Mutex<Option<RefreshTimer>>,
    timer_generation: AtomicU64,
    /// A silent refresh from cold start is in flight
    cold_start: AtomicBool,
    state_tx: watch::Sender<SessionState>,
    listener: Mutex<Option<JoinHandle<()>>>,
    user: RwLock<Option<Value>>,
}

/// Drives the token lifecycle for one user session. Cheap to clone.
#[derive(Clone)]
pub struct TokenCoordinator {
    inner: Arc<Inner>,
}

impl TokenCoordinator {
    pub fn new(
        connection: ConnectionManager,
        api: Arc<dyn AuthApi>,
        settings: &SessionSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::default());
        let tokens = connection.tokens().clone();

        Self {
            inner: Arc::new(Inner {
                api,
                connection,
                tokens,
                lead: settings.refresh_lead(),
                refresh: RefreshCycle::new(),
                timer: Mutex::new(None),
                timer_generation: AtomicU64::new(0),
                cold_start: AtomicBool::new(false),
                state_tx,
                listener: Mutex::new(None),
                user: RwLock::new(None),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Profile fetched by the last login or `fetch_current_user`
    pub fn current_user(&self) -> Option<Value> {
        self.inner.user.read().clone()
    }

    /// Time until the armed refresh timer fires, if one is armed
    pub fn next_refresh_in(&self) -> Option<Duration> {
        self.inner
            .timer
            .lock()
            .as_ref()
            .map(|t| t.due.saturating_duration_since(Instant::now()))
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Start reacting to connection status events
    pub fn start(&self) {
        let mut slot = self.inner.listener.lock();
        if slot.is_some() {
            return;
        }

        let mut rx = self.inner.connection.subscribe_status();
        let weak = Arc::downgrade(&self.inner);

        *slot = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        TokenCoordinator { inner }.handle_status(event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Status listener lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Status listener stopped");
        }));
    }

    /// Stop the status listener and disarm the refresh timer
    pub fn shutdown(&self) {
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
        self.cancel_timer();
    }

    /// Restore the session on application start
    pub async fn bootstrap(&self) -> SessionState {
        if self.inner.tokens.access_token().is_some() {
            debug!("Stored token found, restoring session");
            self.inner.state_tx.send_replace(SessionState::Authenticated);
            self.schedule_proactive_refresh();
            if let Err(e) = self.fetch_current_user().await {
                warn!(error = %e, "Failed to fetch current user");
            }
        } else if self.inner.tokens.was_logged_in() {
            info!("Previous session found, attempting silent refresh");
            self.inner.cold_start.store(true, Ordering::SeqCst);
            if self.refresh_now().await.is_ok() {
                if let Err(e) = self.fetch_current_user().await {
                    warn!(error = %e, "Failed to fetch current user");
                }
            }
        } else {
            self.inner
                .state_tx
                .send_replace(SessionState::Anonymous { reason: None });
        }

        self.state()
    }

    // ─────────────────────────────────────────────────────────────
    // Refresh
    // ─────────────────────────────────────────────────────────────

    /// Arm the refresh timer for the stored token, replacing any armed one
    pub fn schedule_proactive_refresh(&self) {
        let mut slot = self.inner.timer.lock();
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }

        let Some(access_token) = self.inner.tokens.access_token() else {
            debug!("No access token, refresh not scheduled");
            return;
        };

        let Some(expires_at) = token::decode_expiry(&access_token) else {
            warn!("Access token is malformed, refresh not scheduled");
            return;
        };

        let delay = token::refresh_delay(expires_at, Utc::now(), self.inner.lead);
        let generation = self.inner.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(&self.inner);

        // Spawned under the slot lock so the task cannot look for its slot
        // before it is stored
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let this = TokenCoordinator { inner };
            this.release_timer(generation);

            debug!("Proactive refresh timer fired");
            if let Err(e) = this.refresh_now().await {
                debug!(error = %e, "Proactive refresh failed");
            }
        });

        let now = Instant::now();
        *slot = Some(RefreshTimer {
            generation,
            due: now.checked_add(delay).unwrap_or(now + FAR_FUTURE),
            handle,
        });

        info!(
            expires_at = %expires_at,
            refresh_in_secs = delay.as_secs(),
            "Proactive refresh scheduled"
        );
    }

    /// Refresh now. Concurrent callers share one refresh. Success adopts the
    /// new token; failure ends the session.
    pub async fn refresh_now(&self) -> Result<String> {
        let this = self.clone();
        self.inner
            .refresh
            .run(|| async move {
                match this.inner.api.refresh().await {
                    Ok(token) => {
                        this.adopt_token(&token);
                        Ok(token)
                    }
                    Err(failure) => {
                        warn!(error = %failure, "Token refresh failed");
                        this.end_session(LogoutReason::RefreshFailed(failure.to_string()));
                        Err(failure)
                    }
                }
            })
            .await
            .map_err(Error::from)
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.handle.abort();
            debug!("Refresh timer cancelled");
        }
    }

    /// Drop the timer slot if it still belongs to `generation`
    fn release_timer(&self, generation: u64) {
        let mut slot = self.inner.timer.lock();
        if slot.as_ref().map(|t| t.generation) == Some(generation) {
            slot.take();
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Token-acquiring operations
    // ─────────────────────────────────────────────────────────────

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession> {
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let session = self.inner.api.login(&request).await?;
        info!("Logged in");
        self.adopt_session(&session);
        Ok(session)
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<AuthSession> {
        let session = self.inner.api.register(request).await?;
        info!("Registered");
        self.adopt_session(&session);
        Ok(session)
    }

    pub async fn verify_email(&self, request: &VerifyEmailRequest) -> Result<Option<AuthSession>> {
        let session = self.inner.api.verify_email(request).await?;
        if let Some(session) = &session {
            self.adopt_session(session);
        }
        Ok(session)
    }

    /// Fetch the user profile. A refresh the REST layer performed on the way
    /// is adopted; a terminal auth failure ends the session.
    pub async fn fetch_current_user(&self) -> Result<Value> {
        let before = self.inner.tokens.access_token();

        match self.inner.api.current_user().await {
            Ok(user) => {
                if let Some(after) = self.inner.tokens.access_token() {
                    if before.as_deref() != Some(after.as_str()) {
                        debug!("Token refreshed while fetching user");
                        self.adopt_token(&after);
                    }
                }
                *self.inner.user.write() = Some(user.clone());
                Ok(user)
            }
            Err(Error::RefreshFailed(failure)) => {
                self.end_session(LogoutReason::RefreshFailed(failure.to_string()));
                Err(Error::RefreshFailed(failure))
            }
            Err(e) if e.is_unauthorized() => {
                self.end_session(LogoutReason::RefreshFailed(e.to_string()));
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Log out on the server (best effort) and locally
    pub async fn logout(&self) {
        if let Err(e) = self.inner.api.logout().await {
            warn!(error = %e, "Logout request failed");
        }

        self.clear_local_session();
        self.inner.state_tx.send_replace(SessionState::Anonymous {
            reason: Some(LogoutReason::UserRequested),
        });
        info!("Logged out");
    }

    fn adopt_session(&self, session: &AuthSession) {
        if let Some(user) = &session.user {
            *self.inner.user.write() = Some(user.clone());
        }
        self.adopt_token(&session.access_token);
    }

    /// Store a fresh token, re-arm the timer and re-authenticate the
    /// live connection
    fn adopt_token(&self, access_token: &str) {
        self.inner.cold_start.store(false, Ordering::SeqCst);
        self.inner.tokens.set_access_token(access_token);
        self.inner.tokens.set_was_logged_in(true);
        self.inner.state_tx.send_replace(SessionState::Authenticated);

        self.schedule_proactive_refresh();

        if self.inner.connection.is_connected() {
            self.inner.connection.authenticate(access_token);
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Session end
    // ─────────────────────────────────────────────────────────────

    /// End the session. Acts once: only while authenticated, or while a
    /// cold-start refresh is in flight.
    fn end_session(&self, reason: LogoutReason) -> bool {
        let cold_start = self.inner.cold_start.swap(false, Ordering::SeqCst);
        let reason = match reason {
            LogoutReason::RefreshFailed(_) if cold_start => LogoutReason::SilentRefreshFailed,
            other => other,
        };

        let acted = self.inner.state_tx.send_if_modified(|state| {
            if state.is_authenticated() || cold_start {
                *state = SessionState::Anonymous {
                    reason: Some(reason.clone()),
                };
                true
            } else {
                false
            }
        });

        if !acted {
            debug!(reason = ?reason, "Session already ended");
            return false;
        }

        self.clear_local_session();
        warn!(reason = ?reason, "Session ended");
        true
    }

    fn clear_local_session(&self) {
        self.cancel_timer();
        self.inner.tokens.clear_access_token();
        self.inner.tokens.set_was_logged_in(false);
        self.inner.user.write().take();
    }

    // ─────────────────────────────────────────────────────────────
    // Status reactions
    // ─────────────────────────────────────────────────────────────

    fn handle_status(&self, event: StatusEvent) {
        match event {
            StatusEvent::AuthError { code, .. } if code.is_recoverable() => {
                info!(code = %code, "Connection token rejected, refreshing");
                self.spawn_refresh();
            }
            StatusEvent::AuthError { code, .. } => {
                debug!(code = %code, "Auth error not recoverable by refresh");
            }
            StatusEvent::RefreshRequired => {
                info!("Server requested refresh");
                self.spawn_refresh();
            }
            StatusEvent::ServerLogout => {
                self.end_session(LogoutReason::ServerLogout);
            }
            StatusEvent::SessionExpired { reason } => {
                self.end_session(LogoutReason::RefreshFailed(reason));
            }
            _ => {}
        }
    }

    fn spawn_refresh(&self) {
        if !self.state().is_authenticated() {
            debug!("No session to refresh");
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.refresh_now().await {
                debug!(error = %e, "Reactive refresh failed");
            }
        });
    }
}
