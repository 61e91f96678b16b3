use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::cancel::CancelToken;
use crate::error::BrokerError;

/// Per-key counting semaphore with FIFO hand-off and cancellable waits.
///
/// Cloning shares the underlying state. Keys are independent records, so
/// unrelated profiles never wait on each other.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyLimiter {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    keys: Mutex<HashMap<String, KeyState>>,
    next_waiter: AtomicU64,
}

#[derive(Debug, Default)]
struct KeyState {
    active: usize,
    limit: usize,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

impl KeyState {
    /// Hand free capacity to queued waiters in arrival order.
    ///
    /// A popped waiter owns its slot even if its receiver is already gone;
    /// its [`PendingAcquire`] gives the slot back on drop.
    fn drain(&mut self) {
        while self.active < self.limit {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            self.active += 1;
            let _ = waiter.grant.send(());
        }
    }

    fn is_idle(&self) -> bool {
        self.active == 0 && self.waiters.is_empty()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, KeyState>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, key: &str) {
        let mut keys = self.lock();
        let Some(state) = keys.get_mut(key) else {
            tracing::warn!(key, "release for untracked key");
            return;
        };
        state.active = state.active.saturating_sub(1);
        state.drain();
        if state.is_idle() {
            keys.remove(key);
        }
    }

    /// Remove a queued waiter. Returns `false` when it was already granted.
    fn withdraw(&self, key: &str, id: u64) -> bool {
        let mut keys = self.lock();
        let Some(state) = keys.get_mut(key) else {
            return false;
        };
        let Some(pos) = state.waiters.iter().position(|w| w.id == id) else {
            return false;
        };
        state.waiters.remove(pos);
        if state.is_idle() {
            keys.remove(key);
        }
        true
    }
}

impl ConcurrencyLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for a slot under `key`, allowing at most `limit` concurrent holders.
    ///
    /// `limit` is stored on every call so that live policy changes take effect
    /// for the next hand-off. Config loading rejects zero; a snapshot built by
    /// hand with a zero limit still gets one slot.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Cancelled` if `cancel` fires before a slot is granted.
    pub async fn acquire(
        &self,
        key: &str,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<SlotGuard, BrokerError> {
        if cancel.is_cancelled() {
            return Err(BrokerError::cancelled_by(cancel));
        }

        let (id, grant_rx) = {
            let mut keys = self.shared.lock();
            let state = keys.entry(key.to_owned()).or_default();
            state.limit = limit.max(1);
            if state.waiters.is_empty() && state.active < state.limit {
                state.active += 1;
                tracing::trace!(key, active = state.active, "slot granted");
                return Ok(self.guard(key));
            }
            let id = self.shared.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, grant: tx });
            state.drain();
            tracing::debug!(
                key,
                active = state.active,
                queued = state.waiters.len(),
                "waiting for slot"
            );
            (id, rx)
        };

        let mut pending = PendingAcquire {
            shared: Arc::clone(&self.shared),
            key: key.to_owned(),
            id,
            settled: false,
        };

        tokio::select! {
            biased;
            // Senders are only consumed by a grant, so either arm means the slot is ours.
            _ = grant_rx => {
                pending.settled = true;
                Ok(self.guard(key))
            }
            () = cancel.cancelled() => {
                pending.settled = true;
                if self.shared.withdraw(key, id) {
                    tracing::debug!(key, "waiter cancelled while queued");
                    Err(BrokerError::cancelled_by(cancel))
                } else {
                    // Granted concurrently; cancellation after grant is a no-op here.
                    Ok(self.guard(key))
                }
            }
        }
    }

    fn guard(&self, key: &str) -> SlotGuard {
        SlotGuard {
            shared: Arc::clone(&self.shared),
            key: key.to_owned(),
            released: false,
        }
    }

    /// Number of holders currently active under `key`.
    #[must_use]
    pub fn active(&self, key: &str) -> usize {
        self.shared.lock().get(key).map_or(0, |s| s.active)
    }

    /// Number of waiters queued under `key`.
    #[must_use]
    pub fn queued(&self, key: &str) -> usize {
        self.shared.lock().get(key).map_or(0, |s| s.waiters.len())
    }

    /// Number of keys with live state. Idle keys are discarded.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.shared.lock().len()
    }
}

/// Queued acquisition; withdraws itself or returns a handed-off slot when dropped
/// before settling.
struct PendingAcquire {
    shared: Arc<Shared>,
    key: String,
    id: u64,
    settled: bool,
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if !self.settled && !self.shared.withdraw(&self.key, self.id) {
            self.shared.release(&self.key);
        }
    }
}

/// One granted unit of work under a key. Released exactly once, explicitly or on drop.
#[derive(Debug)]
pub struct SlotGuard {
    shared: Arc<Shared>,
    key: String,
    released: bool,
}

impl SlotGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Give the slot back. Further calls are no-ops.
    pub fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        self.shared.release(&self.key);
        tracing::trace!(key = %self.key, "slot released");
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
    }
}
