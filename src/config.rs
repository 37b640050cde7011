//! Client configuration
//!
//! Built-in defaults, overlaid by the first TOML file found (`--config`,
//! `./storefront.toml`, the user config dir, `~/.storefront/client.toml`),
//! overlaid by `STOREFRONT_*` environment variables. Paths are shell-expanded
//! and the result validated before anyone sees it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// REST API settings
    pub api: ApiSettings,

    /// Real-time connection settings
    pub realtime: RealtimeSettings,

    /// Token lifecycle settings
    pub session: SessionSettings,

    pub logging: LoggingSettings,

    pub storage: StorageSettings,
}

/// REST API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Base URL of the REST API (e.g. "http://localhost:4000/api")
    pub base_url: String,

    /// Path fragments that never carry a bearer token nor trigger a refresh
    pub public_paths: Vec<String>,

    /// Path of the refresh endpoint, relative to the base URL
    pub refresh_path: String,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

/// Transport flavours the real-time connection may use, in preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Reserved: accepted in configuration so server-compatible preference
    /// lists parse, but no polling transport exists and it is skipped
    Polling,
    Websocket,
}

/// Real-time connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    /// WebSocket URL of the real-time server
    pub url: String,

    /// Let the transport reconnect on its own after a drop
    pub reconnection: bool,

    /// Reconnection attempts before the connection is reported as failed
    pub max_reconnect_attempts: u32,

    /// Initial reconnection delay in milliseconds
    pub reconnect_delay_ms: u64,

    /// Upper bound for the reconnection delay in milliseconds
    pub reconnect_delay_max_ms: u64,

    /// Handshake timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// How long `initialize` waits for the first connection, in milliseconds
    pub initialize_timeout_ms: u64,

    /// Default timeout for `wait_for_connection`, in milliseconds. The
    /// `run` command waits this long again when `initialize` times out.
    pub wait_timeout_ms: u64,

    /// Send the API client's cookies (the refresh cookie) with the handshake
    pub with_credentials: bool,

    /// Allowed transports, in preference order. Must include `websocket`,
    /// the only one implemented; `polling` is reserved.
    pub transports: Vec<TransportKind>,

    /// Domain events the `run` command subscribes to and logs
    pub events: Vec<String>,
}

/// Token lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Seconds before expiry at which the access token is refreshed
    pub refresh_lead_secs: u64,

    /// Persist the access token to the data directory
    pub persist_tokens: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default verbosity; `RUST_LOG` and `-v`/`-q` take precedence
    pub level: String,

    /// Daily-rolled log file; console only when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Rolled files kept on disk
    pub max_files: u32,

    pub json_format: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Base data directory (holds the persisted session)
    pub data_dir: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4000/api".to_string(),
            public_paths: [
                "/auth/login",
                "/auth/register",
                "/auth/refresh",
                "/auth/verify-email",
                "/auth/forgot-password",
                "/auth/reset-password",
                "/products",
                "/categories",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            refresh_path: "/auth/refresh".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:4000/realtime".to_string(),
            reconnection: true,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            reconnect_delay_max_ms: 5000,
            connect_timeout_ms: 20000,
            initialize_timeout_ms: 10000,
            wait_timeout_ms: 5000,
            with_credentials: true,
            transports: vec![TransportKind::Polling, TransportKind::Websocket],
            events: vec![
                "order:created".to_string(),
                "order:statusUpdated".to_string(),
                "cart:updated".to_string(),
                "wishlist:updated".to_string(),
                "notification:new".to_string(),
            ],
        }
    }
}

impl RealtimeSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn reconnect_delay_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_max_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            refresh_lead_secs: 120,
            persist_tokens: true,
        }
    }
}

impl SessionSettings {
    pub fn refresh_lead(&self) -> Duration {
        Duration::from_secs(self.refresh_lead_secs)
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 5,
            json_format: false,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.storefront".to_string(),
        }
    }
}

impl ClientConfig {
    /// Resolve the effective configuration, `path` replacing the search
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match Self::locate(path)? {
            Some(file) => {
                let config = Self::from_file(&file)?;
                info!(path = %file.display(), "Configuration loaded");
                config
            }
            None => {
                debug!("No configuration file, starting from defaults");
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.expand_paths();
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML configuration file without overrides or validation
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse {
            message: e.to_string(),
            source: Some(e),
        })
    }

    /// An explicit path must exist; otherwise the first candidate that does wins
    fn locate(explicit: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            let path = PathBuf::from(expand_path(path));
            if !path.exists() {
                return Err(Error::config_not_found(path));
            }
            return Ok(Some(path));
        }

        let candidates = [
            Some(PathBuf::from("storefront.toml")),
            dirs::config_dir().map(|d| d.join("storefront").join("client.toml")),
            default_config_path(),
        ];

        let found = candidates.into_iter().flatten().find(|p| p.exists());
        if let Some(ref path) = found {
            debug!(path = %path.display(), "Using configuration file");
        }
        Ok(found)
    }

    fn apply_env_overrides(&mut self) {
        override_string("STOREFRONT_API_URL", &mut self.api.base_url);
        override_parsed("STOREFRONT_API_TIMEOUT_SECS", &mut self.api.request_timeout_secs);

        override_string("STOREFRONT_REALTIME_URL", &mut self.realtime.url);
        override_parsed(
            "STOREFRONT_MAX_RECONNECT_ATTEMPTS",
            &mut self.realtime.max_reconnect_attempts,
        );
        override_parsed("STOREFRONT_CONNECT_TIMEOUT_MS", &mut self.realtime.connect_timeout_ms);

        override_parsed("STOREFRONT_REFRESH_LEAD_SECS", &mut self.session.refresh_lead_secs);
        override_flag("STOREFRONT_PERSIST_TOKENS", &mut self.session.persist_tokens);

        override_string("STOREFRONT_LOG_LEVEL", &mut self.logging.level);
        if let Ok(file) = std::env::var("STOREFRONT_LOG_FILE") {
            self.logging.file = Some(file);
        }
        override_flag("STOREFRONT_LOG_JSON", &mut self.logging.json_format);

        override_string("STOREFRONT_DATA_DIR", &mut self.storage.data_dir);
    }

    fn expand_paths(&mut self) {
        self.storage.data_dir = expand_path(&self.storage.data_dir);
        self.logging.file = self.logging.file.as_deref().map(expand_path);
    }

    /// Reject values the client cannot run with, naming the offending key
    pub fn validate(&self) -> Result<()> {
        let realtime_url = url::Url::parse(&self.realtime.url)
            .map_err(|e| Error::config_field_invalid("realtime.url", e.to_string()))?;
        if !matches!(realtime_url.scheme(), "ws" | "wss") {
            return Err(Error::config_field_invalid(
                "realtime.url",
                "Real-time URL must start with ws:// or wss://",
            ));
        }

        let api_url = url::Url::parse(&self.api.base_url)
            .map_err(|e| Error::config_field_invalid("api.base_url", e.to_string()))?;
        if !matches!(api_url.scheme(), "http" | "https") {
            return Err(Error::config_field_invalid(
                "api.base_url",
                "API base URL must start with http:// or https://",
            ));
        }

        if self.realtime.max_reconnect_attempts == 0 {
            return Err(Error::config_field_invalid(
                "realtime.max_reconnect_attempts",
                "must be at least 1",
            ));
        }

        if self.realtime.reconnect_delay_ms > self.realtime.reconnect_delay_max_ms {
            return Err(Error::config_field_invalid(
                "realtime.reconnect_delay_ms",
                "must not exceed reconnect_delay_max_ms",
            ));
        }

        if !self.realtime.transports.contains(&TransportKind::Websocket) {
            return Err(Error::config_field_invalid(
                "realtime.transports",
                "must include \"websocket\", the only implemented transport",
            ));
        }

        if self.session.refresh_lead_secs == 0 {
            return Err(Error::config_field_invalid(
                "session.refresh_lead_secs",
                "lead time must be positive",
            ));
        }

        const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
        if !LEVELS.iter().any(|l| l.eq_ignore_ascii_case(&self.logging.level)) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!("'{}' is not one of {}", self.logging.level, LEVELS.join("/")),
            ));
        }

        Ok(())
    }

    /// Where the persisted session lives
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }
}

fn override_string(var: &str, target: &mut String) {
    if let Ok(value) = std::env::var(var) {
        *target = value;
    }
}

/// Unparseable values are ignored and the previous setting kept
fn override_parsed<T: std::str::FromStr>(var: &str, target: &mut T) {
    match std::env::var(var).map(|v| v.parse::<T>()) {
        Ok(Ok(value)) => *target = value,
        Ok(Err(_)) => warn!(var, "Ignoring unparseable environment override"),
        Err(_) => {}
    }
}

fn override_flag(var: &str, target: &mut bool) {
    if let Ok(value) = std::env::var(var) {
        *target = matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }
}

/// `~` and `$VAR` expansion; the input is kept as-is when a variable is unset
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .map(|expanded| expanded.into_owned())
        .unwrap_or_else(|_| path.to_string())
}

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".storefront").join("client.toml"))
}

/// Write a commented default file to `path` or `~/.storefront/client.toml`
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = match path {
        Some(p) => PathBuf::from(expand_path(p)),
        None => default_config_path().unwrap_or_else(|| PathBuf::from("client.toml")),
    };

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists; pass --force to replace it",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

fn generate_default_config() -> String {
    r#"# Storefront real-time client configuration

[api]
# Base URL of the REST API
base_url = "http://localhost:4000/api"

# Path fragments that skip the bearer header and 401 refresh handling
public_paths = [
    "/auth/login",
    "/auth/register",
    "/auth/refresh",
    "/auth/verify-email",
    "/auth/forgot-password",
    "/auth/reset-password",
    "/products",
    "/categories",
]

# Refresh endpoint (relative to base_url)
refresh_path = "/auth/refresh"

# Request timeout in seconds
request_timeout_secs = 30

[realtime]
# WebSocket URL of the real-time server
url = "ws://localhost:4000/realtime"

# Reconnect automatically after a dropped connection
reconnection = true

# Attempts before the connection is reported as failed
max_reconnect_attempts = 5

# Reconnection delay bounds in milliseconds
reconnect_delay_ms = 1000
reconnect_delay_max_ms = 5000

# Handshake timeout in milliseconds
connect_timeout_ms = 20000

# How long startup waits for the first connection, in milliseconds
initialize_timeout_ms = 10000

# Default wait_for_connection timeout, in milliseconds; `run` waits this
# long again when the first connection is slow
wait_timeout_ms = 5000

# Send the API client's cookies with the handshake
with_credentials = true

# Allowed transports, in preference order. Only "websocket" is implemented;
# "polling" is reserved and skipped.
transports = ["polling", "websocket"]

# Domain events logged by the `run` command
events = ["order:created", "order:statusUpdated", "cart:updated", "wishlist:updated", "notification:new"]

[session]
# Refresh the access token this many seconds before it expires
refresh_lead_secs = 120

# Keep the session across restarts
persist_tokens = true

[logging]
# error, warn, info, debug or trace (RUST_LOG overrides per module)
level = "info"

# Uncomment to also write daily-rolled log files
# file = "~/.storefront/logs/client.log"
max_files = 5

# One JSON object per line instead of human-readable output
json_format = false

[storage]
# Holds session.json when persist_tokens is on
data_dir = "~/.storefront"
"#
    .to_string()
}
