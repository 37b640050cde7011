//! Authentication token lifecycle
//!
//! - `token`: expiry decoding and refresh timing
//! - `store`: client-side persistence of the access token
//! - `refresh`: single-flight refresh critical section
//! - `coordinator`: keeps the real-time connection authenticated

mod coordinator;
mod refresh;
mod store;
pub mod token;

pub use coordinator::{LogoutReason, SessionState, TokenCoordinator};
pub use refresh::{RefreshCycle, RefreshOutcome};
pub use store::{FileTokenStore, MemoryTokenStore, StoredSession, TokenStore, SESSION_FILE};
