//! Auth endpoint payloads

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyEmailRequest {
    pub email: String,
    pub code: String,
}

/// A token-bearing auth response
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSession {
    pub access_token: String,

    /// User profile, when the endpoint returns one
    pub user: Option<Value>,
}

impl AuthSession {
    /// Read a session out of an auth response body, if it carries a token
    pub fn from_response(body: &Value) -> Option<Self> {
        let access_token = extract_access_token(body)?;
        let user = body
            .get("user")
            .or_else(|| body.pointer("/data/user"))
            .cloned();
        Some(Self { access_token, user })
    }
}

/// Find the access token in a response body.
///
/// Accepts `accessToken`, `token` or `data.accessToken`.
pub fn extract_access_token(body: &Value) -> Option<String> {
    body.get("accessToken")
        .or_else(|| body.get("token"))
        .or_else(|| body.pointer("/data/accessToken"))
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
