//! Crate error type
//!
//! Every error maps to a numeric [`ErrorCode`] grouped by area, a CLI exit
//! status and, where one exists, a hint telling the user what to do next.
//! Refresh failures have their own cloneable type because one outcome is
//! fanned out to every request queued behind the refresh.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable numeric codes, rendered as `E<code>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    NotConnected = 302,
    ConnectionLost = 303,

    // Protocol / HTTP errors (4xx)
    ProtocolMalformed = 401,
    HttpStatus = 402,
    AuthenticationFailed = 403,
    Unauthorized = 404,

    // Session errors (5xx)
    RefreshFailed = 500,
    TokenMalformed = 501,
    NoSession = 502,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Process exit status: one per hundred-block of codes
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            code @ 100..=599 => i32::from(code / 100) * 10,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a token refresh did not produce a usable token.
///
/// Cloneable so a single outcome can be handed to every request that queued
/// behind the in-flight refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    /// The refresh endpoint could not be reached
    #[error("network error: {0}")]
    Network(String),

    /// The refresh endpoint answered with a non-success status
    #[error("refresh rejected with HTTP {status}")]
    Rejected { status: u16 },

    /// The response carried no token, or one whose payload cannot be decoded
    #[error("refresh returned a malformed token")]
    MalformedToken,

    /// The refresh leader went away before producing an outcome
    #[error("refresh was abandoned before completing")]
    Abandoned,
}

/// Errors raised by the client
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// TOML that does not deserialize into `ClientConfig`
    #[error("Invalid configuration file: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// A value parsed but is not acceptable
    #[error("Invalid setting{}: {message}", .field.as_ref().map(|f| format!(" '{}'", f)).unwrap_or_default())]
    ConfigValidation { message: String, field: Option<String> },

    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    #[error("Cannot read {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot render configuration: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Handshake or framing failure inside tungstenite
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// The real-time server could not be reached, or gave up reconnecting
    #[error("Cannot connect to {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("No connection to {url} within {timeout_ms}ms")]
    ConnectionTimeout { url: String, timeout_ms: u64 },

    /// Operation needs a live connection
    #[error("Not connected to the real-time server")]
    NotConnected,

    #[error("Real-time transport error: {0}")]
    Connection(String),

    // ─────────────────────────────────────────────────────────────
    // Protocol / HTTP Errors
    // ─────────────────────────────────────────────────────────────

    /// Malformed frame or response body
    #[error("Malformed message: {message}")]
    ProtocolMalformed { message: String },

    /// Non-success HTTP status from the REST API
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Request could not be sent or its body not read
    #[error("Network error: {0}")]
    Network(String),

    /// Login credentials were rejected
    #[error("Login failed: {message}")]
    AuthenticationFailed { message: String },

    // ─────────────────────────────────────────────────────────────
    // Session Errors
    // ─────────────────────────────────────────────────────────────

    /// Token refresh failed; the session is over
    #[error("Token refresh failed: {0}")]
    RefreshFailed(#[from] RefreshFailure),

    /// The access token payload could not be decoded
    #[error("Access token is malformed")]
    TokenMalformed,

    /// Operation requires a logged-in session
    #[error("No active session")]
    NoSession,

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::ProtocolMalformed,
            Error::WebSocket(_) => ErrorCode::ConnectionFailed,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::NotConnected => ErrorCode::NotConnected,
            Error::Connection(_) => ErrorCode::ConnectionLost,

            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::Http { status: 401, .. } => ErrorCode::Unauthorized,
            Error::Http { .. } => ErrorCode::HttpStatus,
            Error::Network(_) => ErrorCode::ConnectionFailed,
            Error::AuthenticationFailed { .. } => ErrorCode::AuthenticationFailed,

            Error::RefreshFailed(_) => ErrorCode::RefreshFailed,
            Error::TokenMalformed => ErrorCode::TokenMalformed,
            Error::NoSession => ErrorCode::NoSession,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Transient failures a caller may try again
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConnectionFailed { .. }
            | Error::ConnectionTimeout { .. }
            | Error::NotConnected
            | Error::Connection(_)
            | Error::Network(_)
            | Error::WebSocket(_)
            | Error::Io(_) => true,
            Error::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Failures that no retry will fix: bad config or a dead session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Config(_)
                | Error::RefreshFailed(_)
                | Error::TokenMalformed
                | Error::Internal(_)
        )
    }

    /// Whether the REST layer reported the request as unauthorized
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Http { status: 401, .. })
    }

    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    /// What the user can do about it, if anything
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'storefront-realtime config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'storefront-realtime config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),

            Error::ConnectionFailed { .. } | Error::Network(_) => Some(
                "Check your network connection and verify the server URLs are correct."
            ),
            Error::ConnectionTimeout { .. } => Some(
                "The real-time server may be down or unreachable. The client keeps working offline."
            ),
            Error::NotConnected => Some(
                "Wait for the connection to come up before sending events."
            ),

            Error::AuthenticationFailed { .. } => Some(
                "Check your email and password and try again."
            ),
            Error::RefreshFailed(_) | Error::NoSession => Some(
                "Your session has ended. Run 'storefront-realtime login' to sign in again."
            ),
            Error::TokenMalformed => Some(
                "The stored session is corrupt. Run 'storefront-realtime logout' and sign in again."
            ),

            _ => None,
        }
    }

    /// Colored message plus hint, for stderr
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!("\x1b[31mError [{}]\x1b[0m: {}\n", self.code(), self);
        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }
        output
    }

    /// Plain single-line form for log files
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code(), self)
    }
}

impl Error {
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    /// Validation failure pinned to a dotted setting name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn connection_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn connection_timeout(url: impl Into<String>, timeout_ms: u64) -> Self {
        Error::ConnectionTimeout {
            url: url.into(),
            timeout_ms,
        }
    }
}
