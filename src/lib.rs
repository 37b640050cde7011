//! Storefront real-time client engine
//!
//! A [`ConnectionManager`] owns the process's persistent real-time
//! connection: it queues event subscriptions until the transport is up,
//! re-authenticates on every (re)connect and publishes typed status events.
//! A [`TokenCoordinator`] keeps the access token fresh, refreshing it ahead
//! of expiry and in reaction to server auth errors, and forces a logout
//! when a refresh fails for good. The [`ApiClient`] is the REST
//! collaborator both of them lean on.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod realtime;

mod testing;

pub use api::{ApiClient, AuthApi};
pub use auth::{FileTokenStore, LogoutReason, MemoryTokenStore, SessionState, TokenCoordinator, TokenStore};
pub use config::ClientConfig;
pub use error::{Error, ErrorCode, RefreshFailure, Result};
pub use realtime::{ConnectionManager, ConnectionStatus, StatusBus, StatusEvent, Subscription};
