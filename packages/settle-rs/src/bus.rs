//! Per-resource fan-out of state observations.
//!
//! # Guarantees
//!
//! - **Per-key ordering**: observations for one key reach listeners in
//!   strictly increasing sequence order; stale or duplicate sequence numbers
//!   are discarded and counted
//! - **Never blocks the publisher**: each listener has a bounded buffer, and on
//!   overflow the oldest buffered observation is dropped
//! - **Latest wins**: only the most recent state matters for verification, so
//!   dropping history is safe
//!
//! The bus also remembers the latest observation per key (the tracked set)
//! and the windows during which the event stream may have missed events.
//!
//! Per-key state lives as long as the resource does. Once a key's latest
//! observation is a removal older than the pruning TTL and nobody listens on
//! it, [`ObservationBus::prune_removed`] forgets the key, so memory is bounded
//! by the set of live resources plus recently removed ones.
//!
//! # Example
//!
//! ```ignore
//! let bus = ObservationBus::new();
//!
//! // Register before issuing a command so nothing is missed
//! let mut listener = bus.listen(&"light.kitchen".into());
//!
//! // The subscriber publishes normalized observations
//! bus.publish(observation);
//!
//! let obs = listener.recv().await;
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::core::{ResourceKey, StateObservation};

/// Default buffer capacity per listener.
const DEFAULT_LISTENER_CAPACITY: usize = 64;

/// Default retention for closed gap windows.
const DEFAULT_GAP_RETENTION: Duration = Duration::from_secs(300);

/// What happened to a published observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted and handed to this many listeners.
    Delivered(usize),
    /// Sequence number not greater than the last delivered one for the key.
    Stale,
}

/// Cloneable handle to the shared listener registry.
#[derive(Clone)]
pub struct ObservationBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    listeners: DashMap<ResourceKey, Vec<Arc<ListenerSlot>>>,
    last_sequence: DashMap<ResourceKey, u64>,
    latest: DashMap<ResourceKey, StateObservation>,
    gaps: Mutex<GapLog>,
    capacity: usize,
    overflow: AtomicU64,
    stale: AtomicU64,
    next_listener_id: AtomicU64,
}

impl ObservationBus {
    /// Create a bus with default listener capacity.
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_LISTENER_CAPACITY, DEFAULT_GAP_RETENTION)
    }

    /// Create a bus with the given per-listener capacity and gap retention.
    ///
    /// Closed gap windows older than `gap_retention` are forgotten; set it to
    /// at least the longest verification deadline.
    pub fn with_settings(capacity: usize, gap_retention: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: DashMap::new(),
                last_sequence: DashMap::new(),
                latest: DashMap::new(),
                gaps: Mutex::new(GapLog::new(gap_retention)),
                capacity: capacity.max(1),
                overflow: AtomicU64::new(0),
                stale: AtomicU64::new(0),
                next_listener_id: AtomicU64::new(0),
            }),
        }
    }

    /// Deliver an observation to every listener of its key.
    ///
    /// Holds the key's sequence entry while fanning out, so concurrent
    /// publishers cannot reorder observations for the same key.
    pub fn publish(&self, obs: StateObservation) -> PublishOutcome {
        let mut sequence = match self.inner.last_sequence.entry(obs.key.clone()) {
            Entry::Occupied(entry) if obs.sequence <= *entry.get() => {
                self.inner.stale.fetch_add(1, Ordering::Relaxed);
                trace!(
                    key = %obs.key,
                    sequence = obs.sequence,
                    last = *entry.get(),
                    "discarding stale observation"
                );
                return PublishOutcome::Stale;
            }
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => entry.insert(obs.sequence),
        };
        *sequence = obs.sequence;

        self.inner.latest.insert(obs.key.clone(), obs.clone());

        let mut delivered = 0;
        if let Some(slots) = self.inner.listeners.get(&obs.key) {
            for slot in slots.iter() {
                if slot.push(obs.clone(), self.inner.capacity) {
                    let total = self.inner.overflow.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        key = %obs.key,
                        listener = slot.id,
                        overflow = total,
                        "listener buffer full, dropped oldest observation"
                    );
                }
                delivered += 1;
            }
        }
        drop(sequence);

        PublishOutcome::Delivered(delivered)
    }

    /// Register a listener for one key.
    ///
    /// Only observations published after this call are received.
    pub fn listen(&self, key: &ResourceKey) -> Listener {
        let slot = Arc::new(ListenerSlot {
            id: self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed),
            buffer: Mutex::new(VecDeque::with_capacity(self.inner.capacity)),
            notify: Notify::new(),
            overflow: AtomicU64::new(0),
        });
        self.inner
            .listeners
            .entry(key.clone())
            .or_default()
            .push(slot.clone());
        Listener {
            key: key.clone(),
            slot,
            bus: self.inner.clone(),
        }
    }

    /// Most recent observation for a key, including removals.
    pub fn latest(&self, key: &ResourceKey) -> Option<StateObservation> {
        self.inner.latest.get(key).map(|obs| obs.clone())
    }

    /// True when the key's latest observation shows it present.
    pub fn is_tracked(&self, key: &ResourceKey) -> bool {
        self.inner
            .latest
            .get(key)
            .map(|obs| !obs.is_removal())
            .unwrap_or(false)
    }

    /// Last delivered sequence number for a key.
    pub fn last_sequence(&self, key: &ResourceKey) -> Option<u64> {
        self.inner.last_sequence.get(key).map(|seq| *seq)
    }

    /// Number of live listeners for a key.
    pub fn listener_count(&self, key: &ResourceKey) -> usize {
        self.inner
            .listeners
            .get(key)
            .map(|slots| slots.len())
            .unwrap_or(0)
    }

    /// Observations dropped because a listener's buffer was full.
    pub fn overflow_count(&self) -> u64 {
        self.inner.overflow.load(Ordering::Relaxed)
    }

    /// Observations discarded for out-of-order sequence numbers.
    pub fn stale_count(&self) -> u64 {
        self.inner.stale.load(Ordering::Relaxed)
    }

    /// Number of keys with a remembered latest observation.
    pub fn tracked_len(&self) -> usize {
        self.inner.latest.len()
    }

    /// Forget keys whose latest observation is a removal received at least
    /// `ttl` ago and that have no listeners. Returns how many were forgotten.
    pub fn prune_removed(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<(ResourceKey, u64)> = self
            .inner
            .latest
            .iter()
            .filter(|entry| {
                entry.is_removal() && now.saturating_duration_since(entry.received_at) >= ttl
            })
            .map(|entry| (entry.key().clone(), entry.sequence))
            .collect();

        let mut pruned = 0;
        for (key, sequence) in expired {
            if self.listener_count(&key) > 0 {
                continue;
            }
            // A newer observation may have arrived since the scan.
            let removed = self
                .inner
                .latest
                .remove_if(&key, |_, obs| obs.is_removal() && obs.sequence == sequence)
                .is_some();
            if removed {
                self.inner
                    .last_sequence
                    .remove_if(&key, |_, last| *last <= sequence);
                pruned += 1;
            }
        }
        pruned
    }

    /// Spawn a background task that prunes removed keys every `interval`.
    pub fn spawn_pruner(
        &self,
        ttl: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let pruned = bus.prune_removed(ttl);
                        if pruned > 0 {
                            debug!(pruned, tracked = bus.tracked_len(), "forgot removed resources");
                        }
                    }
                }
            }
            info!("removed resource pruner stopped");
        })
    }

    // =========================================================================
    // Gap windows
    // =========================================================================

    /// Open a possible-gap window, if one is not already open.
    pub fn begin_gap(&self) {
        self.gaps().begin(Instant::now());
    }

    /// Close the open gap window, if any.
    pub fn end_gap(&self) {
        self.gaps().end(Instant::now());
    }

    /// Drop the open gap window without recording it (the stream resumed
    /// from a cursor, so nothing was missed).
    pub fn discard_gap(&self) {
        self.gaps().open = None;
    }

    /// True while a gap window is open.
    pub fn in_gap(&self) -> bool {
        self.gaps().open.is_some()
    }

    /// True if any gap window intersects `[from, to]`.
    pub fn gap_overlaps(&self, from: Instant, to: Instant) -> bool {
        self.gaps().overlaps(from, to)
    }

    fn gaps(&self) -> MutexGuard<'_, GapLog> {
        self.inner
            .gaps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ObservationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObservationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationBus")
            .field("keys_with_listeners", &self.inner.listeners.len())
            .field("tracked", &self.inner.latest.len())
            .field("overflow", &self.overflow_count())
            .finish()
    }
}

// =============================================================================
// Listener
// =============================================================================

struct ListenerSlot {
    id: u64,
    buffer: Mutex<VecDeque<StateObservation>>,
    notify: Notify,
    overflow: AtomicU64,
}

impl ListenerSlot {
    /// Push, dropping the oldest entry when full. Returns true on overflow.
    fn push(&self, obs: StateObservation, capacity: usize) -> bool {
        let overflowed = {
            let mut buffer = self
                .buffer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let overflowed = if buffer.len() >= capacity {
                buffer.pop_front();
                self.overflow.fetch_add(1, Ordering::Relaxed);
                true
            } else {
                false
            };
            buffer.push_back(obs);
            overflowed
        };
        // notify_one stores a permit, so a recv that has not started waiting yet still wakes.
        self.notify.notify_one();
        overflowed
    }

    fn pop(&self) -> Option<StateObservation> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }
}

/// Receives observations for one key. Unregisters itself on drop.
pub struct Listener {
    key: ResourceKey,
    slot: Arc<ListenerSlot>,
    bus: Arc<BusInner>,
}

impl Listener {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Wait for the next observation.
    pub async fn recv(&mut self) -> StateObservation {
        loop {
            if let Some(obs) = self.slot.pop() {
                return obs;
            }
            self.slot.notify.notified().await;
        }
    }

    /// Take the next buffered observation without waiting.
    pub fn try_recv(&mut self) -> Option<StateObservation> {
        self.slot.pop()
    }

    /// Observations this listener lost to overflow.
    pub fn overflow_count(&self) -> u64 {
        self.slot.overflow.load(Ordering::Relaxed)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let now_empty = match self.bus.listeners.get_mut(&self.key) {
            Some(mut slots) => {
                slots.retain(|slot| slot.id != self.slot.id);
                slots.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.bus
                .listeners
                .remove_if(&self.key, |_, slots| slots.is_empty());
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("key", &self.key)
            .field("id", &self.slot.id)
            .finish()
    }
}

// =============================================================================
// Gap Log
// =============================================================================

struct GapLog {
    open: Option<Instant>,
    closed: VecDeque<(Instant, Instant)>,
    retention: Duration,
}

impl GapLog {
    fn new(retention: Duration) -> Self {
        Self {
            open: None,
            closed: VecDeque::new(),
            retention,
        }
    }

    fn begin(&mut self, now: Instant) {
        if self.open.is_none() {
            self.open = Some(now);
        }
    }

    fn end(&mut self, now: Instant) {
        if let Some(start) = self.open.take() {
            self.closed.push_back((start, now));
        }
        while let Some((_, end)) = self.closed.front() {
            if now.saturating_duration_since(*end) > self.retention {
                self.closed.pop_front();
            } else {
                break;
            }
        }
    }

    fn overlaps(&self, from: Instant, to: Instant) -> bool {
        if let Some(start) = self.open {
            if start <= to {
                return true;
            }
        }
        self.closed
            .iter()
            .any(|(start, end)| *start <= to && *end >= from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::to_attributes;
    use chrono::Utc;
    use serde_json::json;

    fn obs(key: &str, seq: u64, brightness: i64) -> StateObservation {
        StateObservation::new(
            key.into(),
            seq,
            Utc::now(),
            Some(to_attributes(json!({ "brightness": brightness }))),
        )
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = ObservationBus::new();
        let mut listener = bus.listen(&"light.a".into());

        assert_eq!(bus.publish(obs("light.a", 1, 10)), PublishOutcome::Delivered(1));

        let received = listener.recv().await;
        assert_eq!(received.sequence, 1);
        assert_eq!(received.attribute("brightness"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn test_listeners_only_see_their_key() {
        let bus = ObservationBus::new();
        let mut a = bus.listen(&"light.a".into());
        let mut b = bus.listen(&"light.b".into());

        bus.publish(obs("light.b", 1, 20));
        bus.publish(obs("light.a", 1, 10));

        assert_eq!(a.recv().await.key.as_str(), "light.a");
        assert_eq!(b.recv().await.key.as_str(), "light.b");
        assert!(a.try_recv().is_none());
        assert!(b.try_recv().is_none());
    }

    #[test]
    fn test_stale_sequences_are_discarded() {
        let bus = ObservationBus::new();
        let mut listener = bus.listen(&"light.a".into());

        bus.publish(obs("light.a", 5, 50));
        assert_eq!(bus.publish(obs("light.a", 5, 51)), PublishOutcome::Stale);
        assert_eq!(bus.publish(obs("light.a", 3, 30)), PublishOutcome::Stale);
        bus.publish(obs("light.a", 6, 60));

        assert_eq!(listener.try_recv().map(|o| o.sequence), Some(5));
        assert_eq!(listener.try_recv().map(|o| o.sequence), Some(6));
        assert!(listener.try_recv().is_none());
        assert_eq!(bus.stale_count(), 2);
        assert_eq!(bus.last_sequence(&"light.a".into()), Some(6));
    }

    #[test]
    fn test_sequences_are_per_key() {
        let bus = ObservationBus::new();
        assert_eq!(bus.publish(obs("light.a", 10, 1)), PublishOutcome::Delivered(0));
        assert_eq!(bus.publish(obs("light.b", 1, 1)), PublishOutcome::Delivered(0));
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let bus = ObservationBus::with_settings(2, DEFAULT_GAP_RETENTION);
        let mut listener = bus.listen(&"light.a".into());

        for seq in 1..=4 {
            bus.publish(obs("light.a", seq, seq as i64 * 10));
        }

        assert_eq!(listener.overflow_count(), 2);
        assert_eq!(bus.overflow_count(), 2);
        assert_eq!(listener.try_recv().map(|o| o.sequence), Some(3));
        assert_eq!(listener.try_recv().map(|o| o.sequence), Some(4));
    }

    #[test]
    fn test_slow_listener_does_not_affect_others() {
        let bus = ObservationBus::with_settings(1, DEFAULT_GAP_RETENTION);
        let _slow = bus.listen(&"light.a".into());
        let mut fast = bus.listen(&"light.a".into());

        bus.publish(obs("light.a", 1, 10));
        assert_eq!(fast.try_recv().map(|o| o.sequence), Some(1));
        bus.publish(obs("light.a", 2, 20));
        assert_eq!(fast.try_recv().map(|o| o.sequence), Some(2));
        assert_eq!(fast.overflow_count(), 0);
        assert_eq!(bus.overflow_count(), 1);
    }

    #[test]
    fn test_listener_unregisters_on_drop() {
        let bus = ObservationBus::new();
        let key: ResourceKey = "light.a".into();
        let first = bus.listen(&key);
        let second = bus.listen(&key);
        assert_eq!(bus.listener_count(&key), 2);

        drop(first);
        assert_eq!(bus.listener_count(&key), 1);
        drop(second);
        assert_eq!(bus.listener_count(&key), 0);
        assert_eq!(bus.publish(obs("light.a", 1, 1)), PublishOutcome::Delivered(0));
    }

    #[test]
    fn test_latest_tracks_removal() {
        let bus = ObservationBus::new();
        let key: ResourceKey = "light.a".into();
        assert!(!bus.is_tracked(&key));

        bus.publish(obs("light.a", 1, 10));
        assert!(bus.is_tracked(&key));

        bus.publish(StateObservation::new(key.clone(), 2, Utc::now(), None));
        assert!(!bus.is_tracked(&key));
        assert!(bus.latest(&key).unwrap().is_removal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_windows() {
        let bus = ObservationBus::new();
        let t0 = Instant::now();

        tokio::time::advance(Duration::from_secs(1)).await;
        bus.begin_gap();
        assert!(bus.in_gap());
        assert!(bus.gap_overlaps(t0, Instant::now()));

        tokio::time::advance(Duration::from_secs(1)).await;
        bus.end_gap();
        assert!(!bus.in_gap());
        let after = Instant::now();

        tokio::time::advance(Duration::from_secs(1)).await;
        // Window [1s, 2s] overlaps [0s, 3s] but not [3s, 4s].
        assert!(bus.gap_overlaps(t0, Instant::now()));
        assert!(!bus.gap_overlaps(after + Duration::from_millis(500), Instant::now()));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_later_publish() {
        let bus = ObservationBus::new();
        let mut listener = bus.listen(&"light.a".into());

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(obs("light.a", 1, 99));
        });

        let received = listener.recv().await;
        assert_eq!(received.attribute("brightness"), Some(&json!(99)));
    }

    fn removal(key: &str, seq: u64) -> StateObservation {
        StateObservation::new(key.into(), seq, Utc::now(), None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_forgets_old_removals_only() {
        let bus = ObservationBus::new();
        bus.publish(obs("light.kept", 1, 10));
        bus.publish(obs("light.gone", 1, 10));
        bus.publish(removal("light.gone", 2));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(bus.prune_removed(Duration::from_secs(1)), 0);
        assert_eq!(bus.tracked_len(), 2);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(bus.prune_removed(Duration::from_secs(1)), 1);
        assert_eq!(bus.tracked_len(), 1);
        assert!(bus.latest(&"light.gone".into()).is_none());
        assert_eq!(bus.last_sequence(&"light.gone".into()), None);
        assert!(bus.is_tracked(&"light.kept".into()));
        assert_eq!(bus.last_sequence(&"light.kept".into()), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_keeps_removed_key_with_listener() {
        let bus = ObservationBus::new();
        bus.publish(removal("light.gone", 1));
        let listener = bus.listen(&"light.gone".into());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(bus.prune_removed(Duration::from_secs(1)), 0);
        assert_eq!(bus.last_sequence(&"light.gone".into()), Some(1));

        drop(listener);
        assert_eq!(bus.prune_removed(Duration::from_secs(1)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruned_key_accepts_fresh_sequence() {
        let bus = ObservationBus::new();
        bus.publish(obs("light.gone", 7, 10));
        bus.publish(removal("light.gone", 8));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(bus.prune_removed(Duration::from_secs(1)), 1);

        // Recreated resources may restart their sequence.
        assert_eq!(bus.publish(obs("light.gone", 1, 20)), PublishOutcome::Delivered(0));
        assert!(bus.is_tracked(&"light.gone".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruner_task_runs_until_cancelled() {
        let bus = ObservationBus::new();
        let cancel = CancellationToken::new();
        let pruner = bus.spawn_pruner(Duration::from_secs(1), Duration::from_millis(500), cancel.clone());

        for i in 0..50 {
            bus.publish(removal(&format!("light.{i}"), 1));
        }
        assert_eq!(bus.tracked_len(), 50);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(bus.tracked_len(), 0);

        cancel.cancel();
        pruner.await.unwrap();
    }
}
