//! Protocol module for the real-time connection
//!
//! Defines the wire frame and the authentication events exchanged with the
//! real-time server. Frames are JSON text messages over WebSocket.

mod frame;

pub use frame::*;
