//! Test doubles shared by the unit tests
#![cfg(test)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::api::{AuthApi, AuthSession, LoginRequest, RegisterRequest, VerifyEmailRequest};
use crate::auth::RefreshOutcome;
use crate::error::{Error, RefreshFailure, Result};
use crate::protocol::{Frame, AUTH_AUTHENTICATE};
use crate::realtime::{ConnectOptions, Transport, TransportEvent, TransportSink};

// ─────────────────────────────────────────────────────────────────
// Tokens
// ─────────────────────────────────────────────────────────────────

/// Unsigned three-part token whose payload carries `exp`
pub fn fake_jwt(exp: DateTime<Utc>) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        json!({ "sub": "user-1", "exp": exp.timestamp() }).to_string(),
    );
    format!("{header}.{payload}.signature")
}

pub fn jwt_expiring_in(validity: chrono::Duration) -> String {
    fake_jwt(Utc::now() + validity)
}

// ─────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────

/// Transport that records what the manager asks of it and lets the test
/// play the server's side
#[derive(Default)]
pub struct MockTransport {
    opens: Mutex<Vec<ConnectOptions>>,
    sinks: Mutex<Vec<TransportSink>>,
    sent: Mutex<Vec<Frame>>,
    closes: AtomicUsize,
    fail_open: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Emit on the most recent session's sink
    pub fn emit(&self, event: TransportEvent) {
        let sink = self.sinks.lock().last().cloned();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    pub fn connect(&self, socket_id: &str) {
        self.emit(TransportEvent::Connected {
            socket_id: socket_id.to_string(),
        });
    }

    /// Deliver a server frame
    pub fn server(&self, event: &str, data: Value) {
        self.emit(TransportEvent::Message(Frame::new(event, data)));
    }

    /// Sink handed to the `index`th open
    pub fn sink(&self, index: usize) -> TransportSink {
        self.sinks.lock()[index].clone()
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().len()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<ConnectOptions> {
        self.opens.lock().last().cloned()
    }

    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    /// Tokens carried by `auth:authenticate` frames, in order
    pub fn auth_tokens_sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|f| f.event == AUTH_AUTHENTICATE)
            .filter_map(|f| f.data["token"].as_str().map(str::to_string))
            .collect()
    }

    /// Yield until at least `count` opens happened
    pub async fn wait_for_open(&self, count: usize) {
        while self.open_count() < count {
            tokio::task::yield_now().await;
        }
    }
}

impl Transport for MockTransport {
    fn open(&self, options: ConnectOptions, sink: TransportSink) -> Result<()> {
        self.opens.lock().push(options);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::Connection("transport refused to open".to_string()));
        }
        self.sinks.lock().push(sink);
        Ok(())
    }

    fn send(&self, frame: Frame) -> Result<()> {
        self.sent.lock().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────
// Auth API
// ─────────────────────────────────────────────────────────────────

/// Scripted auth endpoints with call counters
pub struct MockAuthApi {
    refresh_calls: AtomicUsize,
    current_user_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    refresh_outcome: Mutex<RefreshOutcome>,
    refresh_delay: Mutex<Duration>,
    login_token: Mutex<Option<String>>,
    logout_fails: AtomicBool,
}

impl MockAuthApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            refresh_calls: AtomicUsize::new(0),
            current_user_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            refresh_outcome: Mutex::new(Err(RefreshFailure::Rejected { status: 401 })),
            refresh_delay: Mutex::new(Duration::ZERO),
            login_token: Mutex::new(None),
            logout_fails: AtomicBool::new(false),
        })
    }

    pub fn set_refresh(&self, outcome: RefreshOutcome) {
        *self.refresh_outcome.lock() = outcome;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock() = delay;
    }

    /// Token handed out by login/register/verify; `None` rejects credentials
    pub fn set_login_token(&self, token: Option<String>) {
        *self.login_token.lock() = token;
    }

    pub fn set_logout_fails(&self, fails: bool) {
        self.logout_fails.store(fails, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn current_user_calls(&self) -> usize {
        self.current_user_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    fn issue(&self, email: &str) -> Option<AuthSession> {
        self.login_token.lock().clone().map(|access_token| AuthSession {
            access_token,
            user: Some(json!({ "id": "user-1", "email": email })),
        })
    }
}

#[async_trait]
impl AuthApi for MockAuthApi {
    async fn login(&self, request: &LoginRequest) -> Result<AuthSession> {
        self.issue(&request.email).ok_or_else(|| Error::AuthenticationFailed {
            message: "Invalid credentials".to_string(),
        })
    }

    async fn register(&self, request: &RegisterRequest) -> Result<AuthSession> {
        self.issue(&request.email).ok_or_else(|| Error::Http {
            status: 409,
            message: "Email already registered".to_string(),
        })
    }

    async fn verify_email(&self, request: &VerifyEmailRequest) -> Result<Option<AuthSession>> {
        Ok(self.issue(&request.email))
    }

    async fn refresh(&self) -> RefreshOutcome {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.refresh_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.refresh_outcome.lock().clone()
    }

    async fn current_user(&self) -> Result<Value> {
        self.current_user_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "id": "user-1", "role": "customer" }))
    }

    async fn logout(&self) -> Result<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.logout_fails.load(Ordering::SeqCst) {
            return Err(Error::Network("connection reset".to_string()));
        }
        Ok(())
    }
}
