//! Real-time wire frame
//!
//! Every message on the real-time connection is a JSON text frame of the
//! form `{"event": "<name>", "data": <json>}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────
// Event Names
// ─────────────────────────────────────────────────────────────────

/// Client → server: present a bearer token for the live connection
pub const AUTH_AUTHENTICATE: &str = "auth:authenticate";

/// Server → client: the presented token was accepted
pub const AUTH_SUCCESS: &str = "auth:success";

/// Server → client: the presented token was rejected
pub const AUTH_ERROR: &str = "auth:error";

/// Server → client: the session was terminated server-side
pub const AUTH_LOGOUT: &str = "auth:logout";

/// Server → client: the client should refresh its token now
pub const AUTH_REFRESH_REQUIRED: &str = "auth:refreshRequired";

// ─────────────────────────────────────────────────────────────────
// Frame
// ─────────────────────────────────────────────────────────────────

/// One named event with an opaque JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Event name (e.g. "order:created")
    pub event: String,

    /// Event payload; absent payloads decode as `null`
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    /// Create a new frame
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Build the `auth:authenticate` frame carrying `token`
    pub fn authenticate(token: &str) -> Self {
        Self::new(AUTH_AUTHENTICATE, serde_json::json!({ "token": token }))
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON text frame
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Parse a binary frame holding UTF-8 JSON
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ─────────────────────────────────────────────────────────────────
// Auth Error Payload
// ─────────────────────────────────────────────────────────────────

/// Reason code carried by `auth:error`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuthErrorCode {
    /// The access token is past its expiry
    TokenExpired,
    /// The access token is not valid for this server
    InvalidToken,
    /// Any other code, preserved verbatim
    Other(String),
}

impl AuthErrorCode {
    /// Map a wire code onto the enum
    pub fn parse(code: &str) -> Self {
        match code {
            "TOKEN_EXPIRED" => AuthErrorCode::TokenExpired,
            "INVALID_TOKEN" => AuthErrorCode::InvalidToken,
            other => AuthErrorCode::Other(other.to_string()),
        }
    }

    /// Wire representation
    pub fn as_str(&self) -> &str {
        match self {
            AuthErrorCode::TokenExpired => "TOKEN_EXPIRED",
            AuthErrorCode::InvalidToken => "INVALID_TOKEN",
            AuthErrorCode::Other(code) => code,
        }
    }

    /// Codes a token refresh can fix
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AuthErrorCode::TokenExpired | AuthErrorCode::InvalidToken)
    }
}

impl fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AuthErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AuthErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(AuthErrorCode::parse(&code))
    }
}

/// Payload of `auth:error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthErrorPayload {
    pub code: AuthErrorCode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AuthErrorPayload {
    /// Decode from a frame's data; a missing or odd payload becomes an unknown code
    pub fn from_value(data: &Value) -> Self {
        serde_json::from_value(data.clone()).unwrap_or_else(|_| AuthErrorPayload {
            code: AuthErrorCode::Other("UNKNOWN".to_string()),
            message: data
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}
