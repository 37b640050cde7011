//! Transport seam
//!
//! A transport owns the physical connection and its reconnection loop. It
//! reports lifecycle changes and inbound frames through a [`TransportSink`];
//! the connection manager decides what they mean.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::TokenStore;
use crate::config::{RealtimeSettings, TransportKind};
use crate::error::Result;
use crate::protocol::Frame;

/// Lifecycle changes and inbound traffic reported by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// First successful connection of a session
    Connected { socket_id: String },

    /// Connection dropped, for the given reason
    Disconnected { reason: String },

    /// A connection attempt failed
    ConnectError { message: String },

    /// Connection re-established after a drop
    Reconnected { attempt: u32, socket_id: String },

    /// A reconnection attempt failed
    ReconnectError { message: String },

    /// Inbound frame from the server
    Message(Frame),
}

/// Callback endpoint a transport reports into
#[derive(Clone)]
pub struct TransportSink {
    handler: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl TransportSink {
    pub fn new(handler: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.handler)(event);
    }
}

impl fmt::Debug for TransportSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportSink")
    }
}

/// Where reconnect handshakes read their bearer token from
#[derive(Clone)]
pub struct TokenSource {
    read: Arc<dyn Fn() -> Option<String> + Send + Sync>,
}

impl TokenSource {
    pub fn new(read: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            read: Arc::new(read),
        }
    }

    /// Follow whatever token the store holds at the time of each attempt
    pub fn from_store(tokens: Arc<dyn TokenStore>) -> Self {
        Self::new(move || tokens.access_token())
    }

    pub fn current(&self) -> Option<String> {
        (self.read)()
    }
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenSource")
    }
}

impl PartialEq for TokenSource {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.read, &other.read)
    }
}

/// Options a transport is opened with
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub url: String,

    /// Send credentials (cookies) with the handshake
    pub with_credentials: bool,

    /// Allowed transports in preference order
    pub transports: Vec<TransportKind>,

    /// Reconnect automatically after a drop
    pub reconnection: bool,

    /// Failed attempts after which the transport stops trying
    pub reconnection_attempts: u32,

    pub reconnection_delay: Duration,

    pub reconnection_delay_max: Duration,

    /// Handshake timeout
    pub timeout: Duration,

    /// Bearer token presented during the first handshake
    pub auth_token: Option<String>,

    /// Token for later handshakes; without one every attempt reuses
    /// `auth_token`
    pub token_source: Option<TokenSource>,
}

impl ConnectOptions {
    pub fn from_settings(settings: &RealtimeSettings, auth_token: Option<String>) -> Self {
        Self {
            url: settings.url.clone(),
            with_credentials: settings.with_credentials,
            transports: settings.transports.clone(),
            reconnection: settings.reconnection,
            reconnection_attempts: settings.max_reconnect_attempts,
            reconnection_delay: settings.reconnect_delay(),
            reconnection_delay_max: settings.reconnect_delay_max(),
            timeout: settings.connect_timeout(),
            auth_token,
            token_source: None,
        }
    }

    pub fn with_token_source(mut self, source: TokenSource) -> Self {
        self.token_source = Some(source);
        self
    }

    /// Bearer token for the `attempt`th handshake of a session, counting
    /// from 1. Reconnects pick up tokens refreshed since the session opened.
    pub fn handshake_token(&self, attempt: u32) -> Option<String> {
        match &self.token_source {
            Some(source) if attempt > 1 => source.current(),
            _ => self.auth_token.clone(),
        }
    }
}

/// A bidirectional real-time transport
pub trait Transport: Send + Sync {
    /// Start connecting. Lifecycle events arrive on `sink`; an error here
    /// means the transport refused to start at all.
    fn open(&self, options: ConnectOptions, sink: TransportSink) -> Result<()>;

    /// Queue a frame on the live connection
    fn send(&self, frame: Frame) -> Result<()>;

    /// Close the connection and stop reconnecting
    fn close(&self);
}
