//! Real-time connection layer
//!
//! The [`ConnectionManager`] owns the connection lifecycle on top of a
//! pluggable [`Transport`] and reports status on the [`StatusBus`].

mod listeners;
mod manager;
mod status;
mod transport;
mod websocket;

pub use listeners::{Callback, ListenerId, Subscription};
pub use manager::{ConnectionManager, ConnectionStatus};
pub use status::{StatusBus, StatusEvent};
pub use transport::{ConnectOptions, TokenSource, Transport, TransportEvent, TransportSink};
pub use websocket::{WebSocketTransport, REASON_CLIENT, REASON_CLOSED, REASON_ERROR, REASON_SERVER};
