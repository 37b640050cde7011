//! Real-time connection manager
//!
//! Owns one logical connection to the real-time server and exposes a
//! subscribe/emit surface that works whether or not the transport is up:
//! - Listeners registered while disconnected are queued and bound on connect
//! - Reconnects re-bind nothing; active listeners keep receiving events
//! - Every (re)connect re-authenticates with the stored token
//! - Status changes are published on the [`StatusBus`]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::listeners::{ListenerRegistry, Subscription, Table};
use super::status::{StatusBus, StatusEvent};
use super::transport::{ConnectOptions, TokenSource, Transport, TransportEvent, TransportSink};
use super::websocket::{WebSocketTransport, REASON_CLIENT};
use crate::auth::TokenStore;
use crate::config::RealtimeSettings;
use crate::error::{Error, Result};
use crate::protocol::{
    AuthErrorPayload, Frame, AUTH_ERROR, AUTH_LOGOUT, AUTH_REFRESH_REQUIRED, AUTH_SUCCESS,
};

// ─────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────

/// Snapshot returned by [`ConnectionManager::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub authenticated: bool,
    pub socket_id: Option<String>,
    pub reconnect_attempts: u32,
    pub has_pending_listeners: bool,
}

#[derive(Debug, Default)]
struct LinkState {
    connected: bool,
    authenticated: bool,
    socket_id: Option<String>,
    reconnect_attempts: u32,
    /// A transport session is open (connected or still trying)
    session_open: bool,
    /// `ConnectionFailed` already published for the current exhaustion
    failure_reported: bool,
}

/// Coarse link signal that `initialize` and `wait_for_connection` wait on
#[derive(Debug, Clone, PartialEq, Eq)]
enum Link {
    Down,
    Up,
    Failed(String),
}

/// Why `initialize` failed; cloneable so every caller gets the same outcome
#[derive(Debug, Clone, PartialEq, Eq)]
enum InitFailure {
    Timeout { url: String, timeout_ms: u64 },
    Failed { url: String, message: String },
}

impl From<InitFailure> for Error {
    fn from(failure: InitFailure) -> Self {
        match failure {
            InitFailure::Timeout { url, timeout_ms } => Error::connection_timeout(url, timeout_ms),
            InitFailure::Failed { url, message } => Error::connection_failed(url, message),
        }
    }
}

type InitFuture = Shared<BoxFuture<'static, std::result::Result<(), InitFailure>>>;

struct Inner {
    settings: RealtimeSettings,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenStore>,
    bus: StatusBus,
    link: RwLock<LinkState>,
    listeners: Mutex<ListenerRegistry>,
    link_tx: watch::Sender<Link>,
    init: Mutex<Option<InitFuture>>,
    /// Bumped on every connect/disconnect; events tagged with an older
    /// value come from a superseded session
    epoch: AtomicU64,
}

// ─────────────────────────────────────────────────────────────────
// Connection Manager
// ─────────────────────────────────────────────────────────────────

/// Handle on the process's real-time connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager over the given transport
    pub fn new(
        settings: RealtimeSettings,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenStore>,
        bus: StatusBus,
    ) -> Self {
        let (link_tx, _) = watch::channel(Link::Down);

        Self {
            inner: Arc::new(Inner {
                settings,
                transport,
                tokens,
                bus,
                link: RwLock::new(LinkState::default()),
                listeners: Mutex::new(ListenerRegistry::new()),
                link_tx,
                init: Mutex::new(None),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Create a manager over the WebSocket transport
    pub fn with_websocket(
        settings: RealtimeSettings,
        tokens: Arc<dyn TokenStore>,
        bus: StatusBus,
    ) -> Self {
        Self::new(settings, Arc::new(WebSocketTransport::new()), tokens, bus)
    }

    pub fn bus(&self) -> &StatusBus {
        &self.inner.bus
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.bus.subscribe()
    }

    pub fn tokens(&self) -> &Arc<dyn TokenStore> {
        &self.inner.tokens
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Connect and wait until the transport reports connected.
    ///
    /// Concurrent and repeated calls share one attempt and its outcome
    /// until [`cleanup`](Self::cleanup) is called.
    pub async fn initialize(&self, token: Option<String>) -> Result<()> {
        let attempt = {
            let mut slot = self.inner.init.lock();
            match slot.as_ref() {
                Some(attempt) => {
                    debug!("Initialization already started, joining it");
                    attempt.clone()
                }
                None => {
                    let this = self.clone();
                    let attempt = async move { this.run_initialize(token).await }
                        .boxed()
                        .shared();
                    *slot = Some(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await.map_err(Error::from)
    }

    async fn run_initialize(&self, token: Option<String>) -> std::result::Result<(), InitFailure> {
        let url = self.inner.settings.url.clone();
        let timeout = self.inner.settings.initialize_timeout();

        // Subscribe before connecting so a synchronous connect is not missed
        let mut link_rx = self.inner.link_tx.subscribe();

        self.connect(token).map_err(|e| InitFailure::Failed {
            url: url.clone(),
            message: e.to_string(),
        })?;

        let outcome = tokio::time::timeout(timeout, async {
            link_rx
                .wait_for(|link| *link != Link::Down)
                .await
                .map(|link| link.clone())
        })
        .await;

        match outcome {
            Ok(Ok(Link::Up)) => {
                info!("Real-time connection initialized");
                Ok(())
            }
            Ok(Ok(Link::Failed(message))) => {
                error!(error = %message, "Real-time connection failed");
                Err(InitFailure::Failed { url, message })
            }
            Ok(Ok(Link::Down)) | Ok(Err(_)) => Err(InitFailure::Failed {
                url,
                message: "connection manager shut down".to_string(),
            }),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Real-time connection timed out");
                Err(InitFailure::Timeout {
                    url,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Open the transport. No-op if a session is already open.
    ///
    /// The handshake carries `token`, or the stored token when none is given.
    pub fn connect(&self, token: Option<String>) -> Result<()> {
        let epoch = {
            let mut link = self.inner.link.write();
            if link.connected || link.session_open {
                debug!("Already connected or connecting, skipping connect");
                return Ok(());
            }
            link.session_open = true;
            link.reconnect_attempts = 0;
            link.failure_reported = false;
            self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };

        self.inner.link_tx.send_replace(Link::Down);

        let token = token.or_else(|| self.inner.tokens.access_token());
        let options = ConnectOptions::from_settings(&self.inner.settings, token)
            .with_token_source(TokenSource::from_store(self.inner.tokens.clone()));

        info!(url = %options.url, authenticated_handshake = options.auth_token.is_some(), "Opening real-time connection");

        if let Err(e) = self.inner.transport.open(options, self.sink(epoch)) {
            error!(error = %e, "Transport refused to open");
            self.inner.link.write().session_open = false;
            self.inner.link_tx.send_replace(Link::Failed(e.to_string()));
            return Err(e);
        }

        Ok(())
    }

    /// Close the transport. Listener tables are kept.
    pub fn disconnect(&self) {
        let was_connected = {
            let mut link = self.inner.link.write();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            let was_connected = link.connected;
            link.connected = false;
            link.authenticated = false;
            link.socket_id = None;
            link.session_open = false;
            was_connected
        };

        self.inner.transport.close();
        self.inner.link_tx.send_replace(Link::Down);

        if was_connected {
            info!("Disconnected from real-time server");
            self.inner.bus.publish(StatusEvent::Disconnected {
                reason: REASON_CLIENT.to_string(),
            });
        }
    }

    /// Tear everything down: drop all listeners, disconnect, and forget the
    /// memoised initialization
    pub fn cleanup(&self) {
        self.inner.listeners.lock().clear();
        self.disconnect();
        self.inner.init.lock().take();
        debug!("Connection manager cleaned up");
    }

    /// Wait until connected, or fail after `timeout`
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let mut link_rx = self.inner.link_tx.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            link_rx
                .wait_for(|link| *link == Link::Up)
                .await
                .map(|_| ())
        })
        .await;

        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => Err(Error::connection_timeout(
                &self.inner.settings.url,
                timeout.as_millis() as u64,
            )),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Messaging
    // ─────────────────────────────────────────────────────────────

    /// Present `token` on the live connection. False if not connected.
    pub fn authenticate(&self, token: &str) -> bool {
        if !self.inner.link.read().connected {
            debug!("Cannot authenticate: not connected");
            return false;
        }

        match self.inner.transport.send(Frame::authenticate(token)) {
            Ok(()) => {
                debug!("Sent authentication");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to send authentication");
                false
            }
        }
    }

    /// Subscribe to a server event. Works in every connection state.
    pub fn on<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        // Registry lock first, then the link: a concurrent connect either
        // sees this entry in pending or we see it connected
        let mut listeners = self.inner.listeners.lock();
        let table = if self.inner.link.read().connected {
            Table::Active
        } else {
            Table::Pending
        };

        let subscription = listeners.register(event, Arc::new(callback), table);
        debug!(event, pending = table == Table::Pending, "Listener registered");
        subscription
    }

    /// Unsubscribe. False if the registration is unknown.
    pub fn off(&self, subscription: &Subscription) -> bool {
        let removed = self.inner.listeners.lock().remove(subscription);
        if removed {
            debug!(event = subscription.event(), "Listener removed");
        }
        removed
    }

    /// Send an event to the server. False (and nothing sent) if not connected.
    pub fn emit(&self, event: &str, data: Value) -> bool {
        if !self.inner.link.read().connected {
            warn!(event, "Cannot emit: not connected");
            return false;
        }

        match self.inner.transport.send(Frame::new(event, data)) {
            Ok(()) => true,
            Err(e) => {
                warn!(event, error = %e, "Failed to emit");
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────

    pub fn status(&self) -> ConnectionStatus {
        let has_pending_listeners = self.inner.listeners.lock().has_pending();
        let link = self.inner.link.read();
        ConnectionStatus {
            connected: link.connected,
            authenticated: link.authenticated,
            socket_id: link.socket_id.clone(),
            reconnect_attempts: link.reconnect_attempts,
            has_pending_listeners,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.read().connected
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.link.read().authenticated
    }

    // ─────────────────────────────────────────────────────────────
    // Transport Events
    // ─────────────────────────────────────────────────────────────

    fn sink(&self, epoch: u64) -> TransportSink {
        let weak = Arc::downgrade(&self.inner);
        TransportSink::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                ConnectionManager { inner }.handle_transport_event(epoch, event);
            }
        })
    }

    fn handle_transport_event(&self, epoch: u64, event: TransportEvent) {
        match event {
            TransportEvent::Connected { socket_id } => self.on_connected(epoch, socket_id, None),
            TransportEvent::Reconnected { attempt, socket_id } => {
                self.on_connected(epoch, socket_id, Some(attempt))
            }
            TransportEvent::Disconnected { reason } => self.on_disconnected(epoch, reason),
            TransportEvent::ConnectError { message } => self.on_connect_error(epoch, message),
            TransportEvent::ReconnectError { message } => {
                if self.is_current(epoch) {
                    warn!(error = %message, "Reconnection attempt failed");
                }
            }
            TransportEvent::Message(frame) => {
                if self.is_current(epoch) {
                    self.on_frame(frame);
                } else {
                    debug!(event = %frame.event, "Ignoring frame from superseded session");
                }
            }
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.inner.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Run `f` on the link state if `epoch` is still the live session
    fn with_current_link<R>(&self, epoch: u64, f: impl FnOnce(&mut LinkState) -> R) -> Option<R> {
        let mut link = self.inner.link.write();
        if !self.is_current(epoch) {
            debug!("Ignoring event from superseded session");
            return None;
        }
        Some(f(&mut link))
    }

    fn on_connected(&self, epoch: u64, socket_id: String, attempt: Option<u32>) {
        let applied = self.with_current_link(epoch, |link| {
            link.connected = true;
            link.authenticated = false;
            link.socket_id = Some(socket_id.clone());
            link.reconnect_attempts = 0;
            link.failure_reported = false;
            link.session_open = true;
        });
        if applied.is_none() {
            return;
        }

        let promoted = self.inner.listeners.lock().promote_pending();

        match attempt {
            Some(attempt) => info!(socket_id = %socket_id, attempt, promoted, "Reconnected"),
            None => info!(socket_id = %socket_id, promoted, "Connected"),
        }

        self.inner.link_tx.send_replace(Link::Up);
        self.inner.bus.publish(StatusEvent::Connected);

        if let Some(token) = self.inner.tokens.access_token() {
            self.authenticate(&token);
        }
    }

    fn on_disconnected(&self, epoch: u64, reason: String) {
        let reconnection = self.inner.settings.reconnection;
        let applied = self.with_current_link(epoch, |link| {
            link.connected = false;
            link.authenticated = false;
            link.socket_id = None;
            if !reconnection {
                link.session_open = false;
            }
        });
        if applied.is_none() {
            return;
        }

        info!(reason = %reason, "Disconnected");

        self.inner.link_tx.send_if_modified(|link| {
            if *link == Link::Up {
                *link = Link::Down;
                true
            } else {
                false
            }
        });
        self.inner.bus.publish(StatusEvent::Disconnected { reason });
    }

    fn on_connect_error(&self, epoch: u64, message: String) {
        let max = self.inner.settings.max_reconnect_attempts;
        let exhausted = self.with_current_link(epoch, |link| {
            link.reconnect_attempts += 1;
            if link.reconnect_attempts >= max && !link.failure_reported {
                link.failure_reported = true;
                link.session_open = false;
                Some(link.reconnect_attempts)
            } else {
                None
            }
        });

        let Some(exhausted) = exhausted else {
            return;
        };

        warn!(error = %message, "Connection attempt failed");

        if let Some(attempts) = exhausted {
            error!(attempts, "Max reconnection attempts reached");
            self.inner.link_tx.send_replace(Link::Failed(message));
            self.inner.bus.publish(StatusEvent::ConnectionFailed { attempts });
        }
    }

    fn on_frame(&self, frame: Frame) {
        match frame.event.as_str() {
            AUTH_SUCCESS => {
                let authenticated = {
                    let mut link = self.inner.link.write();
                    if link.connected {
                        link.authenticated = true;
                    }
                    link.authenticated
                };
                if authenticated {
                    info!("Real-time connection authenticated");
                    self.inner.bus.publish(StatusEvent::Authenticated);
                }
            }
            AUTH_ERROR => {
                let payload = AuthErrorPayload::from_value(&frame.data);
                self.inner.link.write().authenticated = false;
                warn!(code = %payload.code, message = ?payload.message, "Authentication rejected");
                self.inner.bus.publish(StatusEvent::AuthError {
                    code: payload.code,
                    message: payload.message,
                });
            }
            AUTH_LOGOUT => {
                warn!("Server ended the session");
                self.inner.link.write().authenticated = false;
                self.inner.tokens.clear_access_token();
                self.inner.bus.publish(StatusEvent::ServerLogout);
            }
            AUTH_REFRESH_REQUIRED => {
                info!("Server requested a token refresh");
                self.inner.bus.publish(StatusEvent::RefreshRequired);
            }
            _ => {}
        }

        let callbacks = self.inner.listeners.lock().callbacks_for(&frame.event);
        if callbacks.is_empty() {
            debug!(event = %frame.event, "No listeners for event");
        }
        for callback in callbacks {
            callback(&frame.data);
        }
    }
}
