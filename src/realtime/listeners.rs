//! Event listener registry
//!
//! Two tables: `active` holds listeners dispatched from the live connection,
//! `pending` holds listeners registered while disconnected. Pending entries
//! are promoted in registration order on the next connect.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Listener callback; invoked with the frame's payload
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Arena index of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Handle returned by `on`, used to unsubscribe
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    event: String,
    id: ListenerId,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }
}

#[derive(Clone)]
struct Entry {
    id: ListenerId,
    callback: Callback,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry").field("id", &self.id).finish()
    }
}

/// Where a registration landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Active,
    Pending,
}

#[derive(Debug, Default)]
pub struct ListenerRegistry {
    next_id: u64,
    active: HashMap<String, Vec<Entry>>,
    pending: Vec<(String, Entry)>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback in the given table
    pub fn register(&mut self, event: &str, callback: Callback, table: Table) -> Subscription {
        let id = ListenerId(self.next_id);
        self.next_id += 1;

        let entry = Entry { id, callback };
        match table {
            Table::Active => self.active.entry(event.to_string()).or_default().push(entry),
            Table::Pending => self.pending.push((event.to_string(), entry)),
        }

        Subscription {
            event: event.to_string(),
            id,
        }
    }

    /// Remove a registration from whichever table holds it
    pub fn remove(&mut self, subscription: &Subscription) -> bool {
        if let Some(entries) = self.active.get_mut(&subscription.event) {
            if let Some(pos) = entries.iter().position(|e| e.id == subscription.id) {
                entries.remove(pos);
                if entries.is_empty() {
                    self.active.remove(&subscription.event);
                }
                return true;
            }
        }

        if let Some(pos) = self
            .pending
            .iter()
            .position(|(event, e)| e.id == subscription.id && *event == subscription.event)
        {
            self.pending.remove(pos);
            return true;
        }

        false
    }

    /// Move every pending entry into the active table, in registration order.
    /// Returns the number promoted.
    pub fn promote_pending(&mut self) -> usize {
        let promoted = self.pending.len();
        for (event, entry) in self.pending.drain(..) {
            self.active.entry(event).or_default().push(entry);
        }
        promoted
    }

    /// Callbacks currently active for `event`, cloned so they can be invoked
    /// without holding the registry lock
    pub fn callbacks_for(&self, event: &str) -> Vec<Callback> {
        self.active
            .get(event)
            .map(|entries| entries.iter().map(|e| e.callback.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.pending.clear();
    }
}
