//! Client-side token persistence
//!
//! Holds the current access token and the "was previously logged in" flag
//! used to attempt a silent refresh on cold start. The refresh credential
//! itself lives in the HTTP cookie jar, never here.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Persistent store for the session's access token
pub trait TokenStore: Send + Sync {
    fn access_token(&self) -> Option<String>;

    fn set_access_token(&self, token: &str);

    fn clear_access_token(&self);

    fn was_logged_in(&self) -> bool;

    fn set_was_logged_in(&self, value: bool);
}

/// What the store holds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    #[serde(default)]
    pub was_logged_in: bool,
}

// ─────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────

/// Store that lives only as long as the process
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    session: RwLock<StoredSession>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a token already present
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            session: RwLock::new(StoredSession {
                access_token: Some(token.into()),
                was_logged_in: true,
            }),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn access_token(&self) -> Option<String> {
        self.session.read().access_token.clone()
    }

    fn set_access_token(&self, token: &str) {
        self.session.write().access_token = Some(token.to_string());
    }

    fn clear_access_token(&self) {
        self.session.write().access_token = None;
    }

    fn was_logged_in(&self) -> bool {
        self.session.read().was_logged_in
    }

    fn set_was_logged_in(&self, value: bool) {
        self.session.write().was_logged_in = value;
    }
}

// ─────────────────────────────────────────────────────────────────
// File-backed store
// ─────────────────────────────────────────────────────────────────

/// File name inside the data directory
pub const SESSION_FILE: &str = "session.json";

/// Store persisted as JSON in the data directory, rewritten on every change
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    session: RwLock<StoredSession>,
}

impl FileTokenStore {
    /// Open (or lazily create) `session.json` under `data_dir`
    pub fn open(data_dir: impl AsRef<Path>) -> Self {
        let path = data_dir.as_ref().join(SESSION_FILE);
        let session = Self::load(&path);
        Self {
            path,
            session: RwLock::new(session),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of what is stored
    pub fn snapshot(&self) -> StoredSession {
        self.session.read().clone()
    }

    fn load(path: &Path) -> StoredSession {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return StoredSession::default(),
        };

        match serde_json::from_str(&content) {
            Ok(session) => {
                debug!(path = %path.display(), "Loaded stored session");
                session
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Stored session is corrupt, starting empty");
                StoredSession::default()
            }
        }
    }

    fn update(&self, f: impl FnOnce(&mut StoredSession)) {
        let snapshot = {
            let mut session = self.session.write();
            f(&mut session);
            session.clone()
        };
        self.persist(&snapshot);
    }

    fn persist(&self, session: &StoredSession) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "Failed to create data directory");
                return;
            }
        }

        let json = match serde_json::to_string_pretty(session) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize session");
                return;
            }
        };

        if let Err(e) = fs::write(&self.path, json) {
            warn!(path = %self.path.display(), error = %e, "Failed to persist session");
        }
    }
}

impl TokenStore for FileTokenStore {
    fn access_token(&self) -> Option<String> {
        self.session.read().access_token.clone()
    }

    fn set_access_token(&self, token: &str) {
        self.update(|s| s.access_token = Some(token.to_string()));
    }

    fn clear_access_token(&self) {
        self.update(|s| s.access_token = None);
    }

    fn was_logged_in(&self) -> bool {
        self.session.read().was_logged_in
    }

    fn set_was_logged_in(&self, value: bool) {
        self.update(|s| s.was_logged_in = value);
    }
}
