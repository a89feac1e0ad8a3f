//! Per-resource mutual exclusion with a bounded FIFO wait queue.
//!
//! Locks are created on first use and reclaimed by [`LockTable::reap_idle`]
//! once they have been idle longer than a TTL.
//!
//! # Guarantees
//!
//! - At most one holder per key
//! - Grants follow arrival order; a newcomer never skips queued waiters
//! - A [`LockGuard`] releases exactly once, explicitly or on drop
//! - A waiter that gives up (deadline or cancellation) leaves the queue

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::core::{RequestId, ResourceKey};

/// Why a lock was not granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    /// The wait queue for the key is at its depth limit.
    #[error("wait queue is full ({depth} waiting)")]
    QueueFull { depth: usize },
    /// The waiter's deadline passed before the lock was granted.
    #[error("lock not granted before the wait deadline")]
    WaitExpired,
}

// =============================================================================
// Lock State
// =============================================================================

struct Waiter {
    id: RequestId,
    tx: oneshot::Sender<LockGuard>,
}

struct LockState {
    holder: Option<RequestId>,
    queue: VecDeque<Waiter>,
    idle_since: Instant,
    /// Set by the reaper when it removes the entry; acquirers must look again.
    retired: bool,
}

struct KeyLock {
    key: ResourceKey,
    state: Mutex<LockState>,
}

impl KeyLock {
    fn new(key: ResourceKey) -> Self {
        Self {
            key,
            state: Mutex::new(LockState {
                holder: None,
                queue: VecDeque::new(),
                idle_since: Instant::now(),
                retired: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand the lock to the next live waiter, or mark it idle.
    fn release(self: &Arc<Self>, holder: RequestId) {
        let mut state = self.state();
        if state.holder != Some(holder) {
            return;
        }
        while let Some(waiter) = state.queue.pop_front() {
            state.holder = Some(waiter.id);
            let guard = LockGuard::new(self.clone(), waiter.id);
            match waiter.tx.send(guard) {
                Ok(()) => {
                    trace!(key = %self.key, from = %holder, to = %waiter.id, "lock handed over");
                    return;
                }
                Err(mut unsent) => {
                    // Receiver is gone; this guard must not release on drop.
                    unsent.released = true;
                }
            }
        }
        state.holder = None;
        state.idle_since = Instant::now();
        trace!(key = %self.key, "lock idle");
    }

    fn remove_waiter(&self, id: RequestId) -> bool {
        let mut state = self.state();
        let before = state.queue.len();
        state.queue.retain(|waiter| waiter.id != id);
        state.queue.len() != before
    }
}

// =============================================================================
// Lock Guard
// =============================================================================

/// Proof of holding a resource lock.
#[must_use = "the lock is released when the guard is dropped"]
pub struct LockGuard {
    lock: Arc<KeyLock>,
    holder: RequestId,
    acquired_at: Instant,
    released: bool,
}

impl LockGuard {
    fn new(lock: Arc<KeyLock>, holder: RequestId) -> Self {
        Self {
            lock,
            holder,
            acquired_at: Instant::now(),
            released: false,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.lock.key
    }

    pub fn holder(&self) -> RequestId {
        self.holder
    }

    /// How long the lock has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Release now rather than at end of scope.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.lock.release(self.holder);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.lock.key)
            .field("holder", &self.holder)
            .finish()
    }
}

/// Removes a queued waiter if the acquiring future is dropped before grant.
struct WaiterGuard {
    lock: Arc<KeyLock>,
    id: RequestId,
    armed: bool,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.armed && self.lock.remove_waiter(self.id) {
            trace!(key = %self.lock.key, request_id = %self.id, "abandoned lock wait");
        }
    }
}

// =============================================================================
// Lock Table
// =============================================================================

/// On-demand map of per-key locks.
#[derive(Clone)]
pub struct LockTable {
    locks: Arc<DashMap<ResourceKey, Arc<KeyLock>>>,
    max_depth: usize,
}

impl LockTable {
    /// Create a table whose per-key queues hold at most `max_depth` waiters.
    pub fn new(max_depth: usize) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            max_depth,
        }
    }

    /// Acquire the lock for `key` on behalf of request `id`.
    ///
    /// Grants immediately when the key is free and nobody is queued. Otherwise
    /// joins the queue and waits until granted or `wait_deadline` passes.
    /// A grant that races the deadline wins.
    pub async fn acquire(
        &self,
        key: &ResourceKey,
        id: RequestId,
        wait_deadline: Instant,
    ) -> Result<LockGuard, LockError> {
        let (lock, mut rx) = loop {
            let lock = self
                .locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(KeyLock::new(key.clone())))
                .clone();

            let mut state = lock.state();
            if state.retired {
                continue;
            }
            if state.holder.is_none() && state.queue.is_empty() {
                state.holder = Some(id);
                drop(state);
                debug!(key = %key, request_id = %id, "lock granted");
                return Ok(LockGuard::new(lock, id));
            }
            if state.queue.len() >= self.max_depth {
                debug!(key = %key, request_id = %id, depth = state.queue.len(), "lock queue full");
                return Err(LockError::QueueFull {
                    depth: state.queue.len(),
                });
            }

            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter { id, tx });
            trace!(key = %key, request_id = %id, position = state.queue.len(), "queued for lock");
            drop(state);
            break (lock, rx);
        };

        let mut waiter = WaiterGuard {
            lock: lock.clone(),
            id,
            armed: true,
        };

        match tokio::time::timeout_at(wait_deadline, &mut rx).await {
            Ok(Ok(guard)) => {
                waiter.armed = false;
                debug!(key = %key, request_id = %id, "lock granted after wait");
                Ok(guard)
            }
            Ok(Err(_)) => {
                // Sender dropped without a grant; only happens if the waiter
                // was removed from the queue.
                waiter.armed = false;
                Err(LockError::WaitExpired)
            }
            Err(_) => {
                waiter.armed = false;
                if lock.remove_waiter(id) {
                    debug!(key = %key, request_id = %id, "lock wait expired");
                    return Err(LockError::WaitExpired);
                }
                // Already handed over under the state mutex; take the grant.
                rx.try_recv().map_err(|_| LockError::WaitExpired)
            }
        }
    }

    /// Current holder of the key's lock.
    pub fn holder(&self, key: &ResourceKey) -> Option<RequestId> {
        self.locks.get(key).and_then(|lock| lock.state().holder)
    }

    /// Number of waiters queued for the key.
    pub fn queue_len(&self, key: &ResourceKey) -> usize {
        self.locks
            .get(key)
            .map(|lock| lock.state().queue.len())
            .unwrap_or(0)
    }

    /// Number of keys with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Remove locks that are unheld, unqueued, and idle for at least `ttl`.
    /// Returns how many were removed.
    pub fn reap_idle(&self, ttl: Duration) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| {
            let mut state = lock.state();
            let idle = state.holder.is_none()
                && state.queue.is_empty()
                && state.idle_since.elapsed() >= ttl;
            if idle {
                state.retired = true;
            }
            !idle
        });
        before.saturating_sub(self.locks.len())
    }

    /// Periodically reap idle locks until `cancel` fires.
    pub fn spawn_reaper(
        &self,
        ttl: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let reaped = table.reap_idle(ttl);
                        if reaped > 0 {
                            debug!(reaped, remaining = table.len(), "reclaimed idle locks");
                        }
                    }
                }
            }
            info!("idle lock reaper stopped");
        })
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("keys", &self.locks.len())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}
