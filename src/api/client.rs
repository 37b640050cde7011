//! HTTP API client with bearer auth and single-flight refresh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::types::{AuthSession, LoginRequest, RegisterRequest, VerifyEmailRequest};
use super::AuthApi;
use crate::auth::{token, RefreshCycle, RefreshOutcome, TokenStore};
use crate::config::ApiSettings;
use crate::error::{Error, RefreshFailure, Result};
use crate::realtime::{StatusBus, StatusEvent};

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const VERIFY_EMAIL_PATH: &str = "/auth/verify-email";
pub const CURRENT_USER_PATH: &str = "/auth/me";
pub const LOGOUT_PATH: &str = "/auth/logout";

/// HTTP client for the storefront REST API
pub struct ApiClient {
    client: Client,
    base_url: String,
    public_paths: Vec<String>,
    refresh_path: String,
    tokens: Arc<dyn TokenStore>,
    refresh: RefreshCycle,
    cookies: Arc<Jar>,
    status: Option<StatusBus>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(settings: &ApiSettings, tokens: Arc<dyn TokenStore>) -> Result<Self> {
        let cookies = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(cookies.clone())
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            public_paths: settings.public_paths.clone(),
            refresh_path: settings.refresh_path.clone(),
            tokens,
            refresh: RefreshCycle::new(),
            cookies,
            status: None,
        })
    }

    /// Announce refresh failures as [`StatusEvent::SessionExpired`] on `bus`
    pub fn with_status_bus(mut self, bus: StatusBus) -> Self {
        self.status = Some(bus);
        self
    }

    pub fn tokens(&self) -> &Arc<dyn TokenStore> {
        &self.tokens
    }

    /// Cookie jar holding the refresh cookie; share it with the real-time
    /// transport so credentialed handshakes carry the same cookies
    pub fn cookie_jar(&self) -> Arc<Jar> {
        self.cookies.clone()
    }

    /// Whether `path` skips the bearer header and refresh handling
    pub fn is_public(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path.contains(p.as_str()))
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    // ─────────────────────────────────────────────────────────────
    // JSON helpers
    // ─────────────────────────────────────────────────────────────

    pub async fn get_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes> {
        self.send_json(Method::GET, path, None::<&()>).await
    }

    pub async fn post_json<TReq, TRes>(&self, path: &str, body: &TReq) -> Result<TRes>
    where
        TReq: Serialize + ?Sized,
        TRes: DeserializeOwned,
    {
        self.send_json(Method::POST, path, Some(body)).await
    }

    pub async fn put_json<TReq, TRes>(&self, path: &str, body: &TReq) -> Result<TRes>
    where
        TReq: Serialize + ?Sized,
        TRes: DeserializeOwned,
    {
        self.send_json(Method::PUT, path, Some(body)).await
    }

    pub async fn patch_json<TReq, TRes>(&self, path: &str, body: &TReq) -> Result<TRes>
    where
        TReq: Serialize + ?Sized,
        TRes: DeserializeOwned,
    {
        self.send_json(Method::PATCH, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.execute(Method::DELETE, path, None).await.map(|_| ())
    }

    async fn send_json<TReq, TRes>(&self, method: Method, path: &str, body: Option<&TReq>) -> Result<TRes>
    where
        TReq: Serialize + ?Sized,
        TRes: DeserializeOwned,
    {
        let body = body.map(serde_json::to_vec).transpose()?;
        let text = self.execute(method, path, body).await?;
        parse_body(&text)
    }

    // ─────────────────────────────────────────────────────────────
    // Request pipeline
    // ─────────────────────────────────────────────────────────────

    /// Send a request; on 401 refresh (or pick up a token refreshed
    /// meanwhile) and retry once
    async fn execute(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<String> {
        let public = self.is_public(path);
        let sent_token = if public { None } else { self.tokens.access_token() };

        let (status, text) = self
            .send_once(method.clone(), path, body.as_deref(), sent_token.as_deref())
            .await?;

        if status != 401 || public {
            return check_status(status, text);
        }

        let retry_token = match self.tokens.access_token() {
            Some(current) if sent_token.as_deref() != Some(current.as_str()) => {
                debug!(path, "Token changed while request was in flight, retrying");
                current
            }
            None if !self.tokens.was_logged_in() => {
                debug!(path, "Request unauthorized with no session to refresh");
                return check_status(status, text);
            }
            _ => {
                debug!(path, "Request unauthorized, refreshing token");
                self.refresh_access_token().await?
            }
        };

        let (status, text) = self
            .send_once(method, path, body.as_deref(), Some(&retry_token))
            .await?;
        check_status(status, text)
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
        token: Option<&str>,
    ) -> Result<(u16, String)> {
        let url = self.url(path);
        let mut rb = self.client.request(method, &url);

        if let Some(token) = token {
            rb = rb.bearer_auth(token);
        }
        if let Some(body) = body {
            rb = rb
                .header("Content-Type", "application/json")
                .body(body.to_vec());
        }

        let resp = rb.send().await.map_err(|e| Error::Network(e.to_string()))?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Network(format!("failed to read body: {e}")))?;

        Ok((status, text))
    }

    // ─────────────────────────────────────────────────────────────
    // Refresh
    // ─────────────────────────────────────────────────────────────

    /// Obtain a new access token, sharing any refresh already in flight
    pub async fn refresh_access_token(&self) -> Result<String> {
        self.refresh
            .run(|| self.call_refresh())
            .await
            .map_err(Error::from)
    }

    /// One refresh round trip. A failure leaves no stale session behind:
    /// the token and the logged-in flag are cleared and the bus is told.
    async fn call_refresh(&self) -> RefreshOutcome {
        let outcome = self.request_refresh().await;
        if let Err(failure) = &outcome {
            self.expire_session(failure);
        }
        outcome
    }

    fn expire_session(&self, failure: &RefreshFailure) {
        self.tokens.clear_access_token();
        self.tokens.set_was_logged_in(false);
        warn!(error = %failure, "Refresh failed, stored session cleared");

        if let Some(bus) = &self.status {
            bus.publish(StatusEvent::SessionExpired {
                reason: failure.to_string(),
            });
        }
    }

    async fn request_refresh(&self) -> RefreshOutcome {
        let url = self.url(&self.refresh_path);
        debug!(url = %url, "Refreshing access token");

        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| RefreshFailure::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Refresh rejected");
            return Err(RefreshFailure::Rejected {
                status: status.as_u16(),
            });
        }

        let body: Value = resp.json().await.map_err(|_| RefreshFailure::MalformedToken)?;
        let token = super::types::extract_access_token(&body).ok_or(RefreshFailure::MalformedToken)?;
        if !token::is_decodable(&token) {
            warn!("Refresh returned an undecodable token");
            return Err(RefreshFailure::MalformedToken);
        }

        self.tokens.set_access_token(&token);
        self.tokens.set_was_logged_in(true);
        info!("Access token refreshed");

        Ok(token)
    }
}

/// Map a non-success status to `Error::Http`, preferring the body's `message`
fn check_status(status: u16, text: String) -> Result<String> {
    if (200..300).contains(&status) {
        return Ok(text);
    }

    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| {
            if text.is_empty() {
                reqwest::StatusCode::from_u16(status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                text
            }
        });

    Err(Error::Http { status, message })
}

fn parse_body<T: DeserializeOwned>(text: &str) -> Result<T> {
    let parsed = if text.trim().is_empty() {
        serde_json::from_value(Value::Null)
    } else {
        serde_json::from_str(text)
    };
    parsed.map_err(|e| Error::ProtocolMalformed {
        message: e.to_string(),
    })
}

#[async_trait]
impl AuthApi for ApiClient {
    async fn login(&self, request: &LoginRequest) -> Result<AuthSession> {
        let body: Value = self.post_json(LOGIN_PATH, request).await.map_err(|e| match e {
            Error::Http { status: 400 | 401, message } => Error::AuthenticationFailed { message },
            other => other,
        })?;
        AuthSession::from_response(&body).ok_or_else(|| Error::ProtocolMalformed {
            message: "login response carried no access token".to_string(),
        })
    }

    async fn register(&self, request: &RegisterRequest) -> Result<AuthSession> {
        let body: Value = self.post_json(REGISTER_PATH, request).await?;
        AuthSession::from_response(&body).ok_or_else(|| Error::ProtocolMalformed {
            message: "register response carried no access token".to_string(),
        })
    }

    async fn verify_email(&self, request: &VerifyEmailRequest) -> Result<Option<AuthSession>> {
        let body: Value = self.post_json(VERIFY_EMAIL_PATH, request).await?;
        Ok(AuthSession::from_response(&body))
    }

    async fn refresh(&self) -> RefreshOutcome {
        self.refresh.run(|| self.call_refresh()).await
    }

    async fn current_user(&self) -> Result<Value> {
        let body: Value = self.get_json(CURRENT_USER_PATH).await?;
        Ok(body.get("user").cloned().unwrap_or(body))
    }

    async fn logout(&self) -> Result<()> {
        let _: Value = self.post_json(LOGOUT_PATH, &serde_json::json!({})).await?;
        Ok(())
    }
}
