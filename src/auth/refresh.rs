//! Single-flight token refresh
//!
//! The first caller into a [`RefreshCycle`] becomes the leader and performs
//! the refresh. Callers arriving while it is in flight queue up and receive
//! the leader's outcome instead of starting their own.

use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::RefreshFailure;

/// Result of one refresh: the new access token or why there is none
pub type RefreshOutcome = std::result::Result<String, RefreshFailure>;

#[derive(Default)]
struct CycleState {
    in_progress: bool,
    queued: Vec<oneshot::Sender<RefreshOutcome>>,
}

/// Critical section guarding concurrent refresh attempts
#[derive(Default)]
pub struct RefreshCycle {
    state: Mutex<CycleState>,
}

impl RefreshCycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `refresh` unless a refresh is already in flight, in which case
    /// wait for and share that one's outcome.
    pub async fn run<F, Fut>(&self, refresh: F) -> RefreshOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshOutcome>,
    {
        let waiter = {
            let mut state = self.state.lock();
            if state.in_progress {
                let (tx, rx) = oneshot::channel();
                state.queued.push(tx);
                Some(rx)
            } else {
                state.in_progress = true;
                None
            }
        };

        if let Some(rx) = waiter {
            debug!("Refresh already in flight, queued");
            return rx.await.unwrap_or(Err(RefreshFailure::Abandoned));
        }

        let mut leader = Leader {
            cycle: self,
            finished: false,
        };
        let outcome = refresh().await;
        leader.finish(outcome.clone());
        outcome
    }

    pub fn is_in_progress(&self) -> bool {
        self.state.lock().in_progress
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }

    fn release(&self, outcome: RefreshOutcome) {
        let queued = {
            let mut state = self.state.lock();
            state.in_progress = false;
            std::mem::take(&mut state.queued)
        };

        if !queued.is_empty() {
            debug!(waiters = queued.len(), ok = outcome.is_ok(), "Releasing queued refresh waiters");
        }
        for tx in queued {
            let _ = tx.send(outcome.clone());
        }
    }
}

/// Releases the cycle even if the leader's future is dropped mid-refresh
struct Leader<'a> {
    cycle: &'a RefreshCycle,
    finished: bool,
}

impl Leader<'_> {
    fn finish(&mut self, outcome: RefreshOutcome) {
        self.finished = true;
        self.cycle.release(outcome);
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.cycle.release(Err(RefreshFailure::Abandoned));
        }
    }
}
