//! Long-lived subscription to the backend's change feed.
//!
//! The `Subscriber` is a single service with explicit start/stop. It:
//! - Connects to an [`EventSource`] (wildcard or a key list)
//! - Normalizes [`RawEvent`]s into [`StateObservation`]s
//! - Publishes them to the [`ObservationBus`] without blocking on listeners
//! - Reconnects forever with capped exponential backoff plus jitter
//! - Resumes from the last cursor when the source supports it, otherwise
//!   records a possible-gap window on the bus
//!
//! # Architecture
//!
//! ```text
//! Subscriber::start()
//!     │
//!     └─► read loop (spawned)
//!             ├─► EventSource::subscribe(scope, cursor)
//!             ├─► normalize ──► ObservationBus::publish
//!             └─► on error/end: Disconnected, begin gap, back off, retry
//! ```
//!
//! Connection state is published on a `watch` channel so the dispatcher can
//! refuse new work while the feed is down.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{ObservationBus, PublishOutcome};
use crate::core::{Attributes, ResourceKey, StateObservation};
use crate::error::SettleError;

/// Opaque resume position issued by the backend.
pub type Cursor = String;

/// Event stream item as the backend sends it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub resource_key: String,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// `None` reports the resource as removed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

impl RawEvent {
    /// Convert to an observation, or `None` when the key is blank.
    pub fn normalize(self) -> Option<StateObservation> {
        let key = self.resource_key.trim();
        if key.is_empty() {
            return None;
        }
        Some(StateObservation::new(
            ResourceKey::new(key),
            self.sequence,
            self.timestamp.unwrap_or_else(Utc::now),
            self.attributes,
        ))
    }
}

/// Failures reported by an [`EventSource`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("stream failed: {0}")]
    Stream(String),
    /// The resume cursor is no longer valid; subscribe again without one.
    #[error("resume cursor rejected: {0}")]
    CursorRejected(String),
}

/// Which resources a subscription covers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "keys", rename_all = "snake_case")]
pub enum SubscriptionScope {
    #[default]
    All,
    Keys(Vec<ResourceKey>),
}

/// Stream of backend events for one connection.
pub type EventStream = BoxStream<'static, Result<RawEvent, SourceError>>;

/// The backend's change-notification feed.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Whether `subscribe` honors a resume cursor.
    fn supports_resume(&self) -> bool {
        false
    }

    /// Open one connection. The stream ending or yielding an error counts as
    /// a disconnect.
    async fn subscribe(
        &self,
        scope: &SubscriptionScope,
        resume: Option<Cursor>,
    ) -> Result<EventStream, SourceError>;
}

/// Current state of the feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected { since: Instant },
    Stopped,
}

// =============================================================================
// Reconnect Policy
// =============================================================================

/// Backoff between reconnect attempts.
///
/// Delay for attempt `n` (0-based) is `min(max, initial * multiplier^n)`
/// scaled by a random factor in `[1 - jitter, 1 + jitter]`, never above `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    /// Fraction in `[0, 1]`.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2,
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        let base = self.initial.saturating_mul(factor).min(self.max);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let scale = 1.0 + jitter * (fastrand::f64() * 2.0 - 1.0);
        base.mul_f64(scale).min(self.max)
    }
}

// =============================================================================
// Subscriber
// =============================================================================

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The single event stream service. Construct once and inject it.
pub struct Subscriber {
    source: Arc<dyn EventSource>,
    bus: ObservationBus,
    scope: SubscriptionScope,
    policy: ReconnectPolicy,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    running: Mutex<Option<Running>>,
}

impl Subscriber {
    pub fn new(
        source: Arc<dyn EventSource>,
        bus: ObservationBus,
        scope: SubscriptionScope,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Stopped);
        Self {
            source,
            bus,
            scope,
            policy,
            state_tx: Arc::new(state_tx),
            running: Mutex::new(None),
        }
    }

    /// Spawn the read loop. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), SettleError> {
        let mut running = self.running();
        if running.is_some() {
            return Err(SettleError::AlreadyRunning {
                service: "event stream subscriber",
            });
        }

        let cancel = CancellationToken::new();
        let ctx = ReadLoop {
            source: self.source.clone(),
            bus: self.bus.clone(),
            scope: self.scope.clone(),
            policy: self.policy.clone(),
            state: self.state_tx.clone(),
            cancel: cancel.clone(),
        };
        self.state_tx.send_replace(ConnectionState::Connecting);
        let handle = tokio::spawn(ctx.run());
        *running = Some(Running { cancel, handle });

        info!(scope = ?self.scope, "event stream subscriber started");
        Ok(())
    }

    /// Cancel the read loop and wait for it to exit.
    pub async fn stop(&self) -> Result<(), SettleError> {
        let running = self.running().take().ok_or(SettleError::NotRunning {
            service: "event stream subscriber",
        })?;
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            warn!(error = %e, "event stream read loop ended abnormally");
        }
        // Anything still waiting can no longer be sure it saw every event.
        self.bus.begin_gap();
        self.state_tx.send_replace(ConnectionState::Stopped);
        info!("event stream subscriber stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every connection state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("scope", &self.scope)
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Read Loop
// =============================================================================

struct ReadLoop {
    source: Arc<dyn EventSource>,
    bus: ObservationBus,
    scope: SubscriptionScope,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
}

impl ReadLoop {
    async fn run(self) {
        let mut cursor: Option<Cursor> = None;
        let mut attempt: u32 = 0;

        // Nothing has been seen yet; the first connect starts inside a gap.
        self.bus.begin_gap();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let resume = if self.source.supports_resume() {
                cursor.clone()
            } else {
                None
            };
            let resumed = resume.is_some();

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.source.subscribe(&self.scope, resume) => result,
            };

            match connected {
                Ok(stream) => {
                    attempt = 0;
                    if resumed {
                        self.bus.discard_gap();
                    } else {
                        self.bus.end_gap();
                    }
                    self.state.send_replace(ConnectionState::Connected);
                    info!(resumed, "event stream connected");

                    if !self.read(stream, &mut cursor).await {
                        break;
                    }
                }
                Err(SourceError::CursorRejected(reason)) => {
                    warn!(reason = %reason, "resume cursor rejected, resubscribing from live");
                    cursor = None;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "event stream connection failed");
                }
            }

            self.mark_disconnected();
            let delay = self.policy.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to event stream");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            self.state.send_replace(ConnectionState::Connecting);
        }

        debug!("event stream read loop exiting");
    }

    /// Drain one connection. Returns false when cancelled.
    async fn read(&self, mut stream: EventStream, cursor: &mut Option<Cursor>) -> bool {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(raw)) => {
                    let position = raw.cursor.clone();
                    let sequence = raw.sequence;
                    match raw.normalize() {
                        Some(obs) => {
                            if let PublishOutcome::Stale = self.bus.publish(obs) {
                                debug!(sequence, "stale event discarded");
                            }
                        }
                        None => warn!(sequence, "dropping event with blank resource key"),
                    }
                    if position.is_some() {
                        *cursor = position;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "event stream error");
                    return true;
                }
                None => {
                    warn!("event stream ended");
                    return true;
                }
            }
        }
    }

    fn mark_disconnected(&self) {
        self.bus.begin_gap();
        self.state.send_if_modified(|state| match state {
            ConnectionState::Disconnected { .. } => false,
            _ => {
                *state = ConnectionState::Disconnected {
                    since: Instant::now(),
                };
                true
            }
        });
    }
}
