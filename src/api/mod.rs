//! REST API collaborator
//!
//! The [`ApiClient`] carries the bearer token, refreshes it on 401 and
//! implements [`AuthApi`], the auth surface the token coordinator drives.

mod client;
mod types;

pub use client::ApiClient;
pub use types::*;

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::RefreshOutcome;
use crate::error::Result;

/// Auth endpoints used by the token coordinator
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> Result<AuthSession>;

    async fn register(&self, request: &RegisterRequest) -> Result<AuthSession>;

    /// Verify an email address; some servers log the user in on success
    async fn verify_email(&self, request: &VerifyEmailRequest) -> Result<Option<AuthSession>>;

    /// Exchange the refresh credential for a new access token
    async fn refresh(&self) -> RefreshOutcome;

    async fn current_user(&self) -> Result<Value>;

    async fn logout(&self) -> Result<()>;
}
