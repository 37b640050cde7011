//! Process-wide connection status bus
//!
//! The connection manager publishes here; the token coordinator and any UI
//! shell subscribe. Publishing never fails: with no subscribers the event is
//! simply dropped.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::protocol::AuthErrorCode;

/// Capacity of the broadcast ring; slow subscribers see `Lagged`
const BUS_CAPACITY: usize = 64;

/// Connection and authentication status changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    /// Transport connected (initially or after a reconnect)
    Connected,

    /// Transport dropped
    Disconnected { reason: String },

    /// Server accepted the connection's token
    Authenticated,

    /// Server rejected the connection's token
    AuthError {
        code: AuthErrorCode,
        message: Option<String>,
    },

    /// Server terminated the session
    ServerLogout,

    /// Server asked for a token refresh
    RefreshRequired,

    /// Reconnection attempts reached their limit
    ConnectionFailed { attempts: u32 },

    /// A REST request's token refresh failed and the stored token was cleared
    SessionExpired { reason: String },
}

impl StatusEvent {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            StatusEvent::Connected => "connected",
            StatusEvent::Disconnected { .. } => "disconnected",
            StatusEvent::Authenticated => "authenticated",
            StatusEvent::AuthError { .. } => "auth_error",
            StatusEvent::ServerLogout => "server_logout",
            StatusEvent::RefreshRequired => "refresh_required",
            StatusEvent::ConnectionFailed { .. } => "connection_failed",
            StatusEvent::SessionExpired { .. } => "session_expired",
        }
    }
}

/// Typed publish/subscribe bus for [`StatusEvent`]s
#[derive(Debug, Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event to every current subscriber
    pub fn publish(&self, event: StatusEvent) {
        trace!(event = event.name(), "Publishing status event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}
