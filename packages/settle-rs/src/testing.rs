//! Testing utilities for settle.
//!
//! [`SimulatedBackend`] is an in-memory device registry that implements both
//! [`Backend`] and [`EventSource`], so an engine can run end to end without a
//! real system behind it.
//!
//! # Feature Flag
//!
//! This module is only available in tests or with the `testing` feature:
//!
//! ```toml
//! [dependencies]
//! settle = { path = "../settle-rs", features = ["testing"] }
//! ```
//!
//! # Behavior
//!
//! - Accepted commands take effect after a configurable latency, in a
//!   spawned task, and are reported on every open feed
//! - The new state is computed when the command is accepted and written as a
//!   full replacement, like a registry that stores whole documents. Two
//!   unserialized writers to one key therefore lose updates
//! - Per-key [`Behavior`] can make a resource ignore commands, end up in a
//!   different state, or ramp through intermediate values
//! - Rejections can be scripted, feeds dropped, and connects refused
//!
//! # Example
//!
//! ```ignore
//! use settle::testing::{Behavior, SimulatedBackend};
//!
//! let sim = SimulatedBackend::new();
//! sim.seed("light.kitchen", json!({"state": "off"}));
//! sim.reject_next(IssueRejection::new(RejectionKind::ConnectionReset, "reset"));
//!
//! let engine = Engine::builder()
//!     .with_backend(sim.clone())
//!     .with_event_source(sim.clone())
//!     .build()?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::backend::{Backend, IssueRejection, RejectionKind};
use crate::core::{to_attributes, Attributes, Operation, ResourceKey};
use crate::predicate::STATE_ATTRIBUTE;
use crate::subscriber::{Cursor, EventSource, EventStream, RawEvent, SourceError, SubscriptionScope};

/// Default delay between acceptance and the reported effect.
const DEFAULT_LATENCY: Duration = Duration::from_millis(50);

/// How a resource responds to accepted commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    /// Apply the command and report the new state.
    Apply,
    /// Accept the command but never change or report anything.
    Silent,
    /// Apply the command, then these attributes win (another actor overrides).
    Override(Attributes),
    /// Report `attribute` passing through each value before the final state.
    Ramp {
        attribute: String,
        through: Vec<Value>,
        interval: Duration,
    },
}

/// A command the backend received.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCommand {
    pub key: ResourceKey,
    pub operation: Operation,
    pub at: Instant,
}

struct Feed {
    scope: SubscriptionScope,
    tx: mpsc::UnboundedSender<Result<RawEvent, SourceError>>,
}

impl Feed {
    fn covers(&self, key: &str) -> bool {
        match &self.scope {
            SubscriptionScope::All => true,
            SubscriptionScope::Keys(keys) => keys.iter().any(|k| k.as_str() == key),
        }
    }
}

#[derive(Default)]
struct SimState {
    entities: HashMap<ResourceKey, Attributes>,
    sequences: HashMap<ResourceKey, u64>,
    log: Vec<RawEvent>,
    feeds: Vec<Feed>,
    rejections: VecDeque<IssueRejection>,
    behaviors: HashMap<ResourceKey, Behavior>,
    latency: Option<Duration>,
    refuse_connects: u32,
    issued: Vec<IssuedCommand>,
}

struct SimInner {
    state: Mutex<SimState>,
    resume: bool,
}

/// In-memory backend and change feed.
#[derive(Clone)]
pub struct SimulatedBackend {
    inner: Arc<SimInner>,
}

impl SimulatedBackend {
    /// A backend whose feed cannot resume from a cursor.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A backend whose feed replays missed events from a cursor.
    pub fn resumable() -> Self {
        Self::build(true)
    }

    fn build(resume: bool) -> Self {
        Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(SimState::default()),
                resume,
            }),
        }
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Create or replace a resource, reporting it on the feed.
    pub fn seed(&self, key: impl Into<ResourceKey>, attributes: Value) {
        self.write(&key.into(), Some(to_attributes(attributes)));
    }

    /// Change a resource as another actor would.
    pub fn set_state(&self, key: impl Into<ResourceKey>, attributes: Value) {
        let key = key.into();
        let mut merged = self.state(key.clone()).unwrap_or_default();
        merged.extend(to_attributes(attributes));
        self.write(&key, Some(merged));
    }

    /// Remove a resource as another actor would.
    pub fn remove(&self, key: impl Into<ResourceKey>) {
        self.write(&key.into(), None);
    }

    /// Reject the next issued command (queued, first in first out).
    pub fn reject_next(&self, rejection: IssueRejection) {
        self.lock().rejections.push_back(rejection);
    }

    pub fn set_behavior(&self, key: impl Into<ResourceKey>, behavior: Behavior) {
        self.lock().behaviors.insert(key.into(), behavior);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// End every open feed.
    pub fn disconnect_all(&self) {
        let dropped = std::mem::take(&mut self.lock().feeds);
        debug!(feeds = dropped.len(), "simulated feed disconnect");
    }

    /// Refuse the next `count` subscribe attempts.
    pub fn refuse_connects(&self, count: u32) {
        self.lock().refuse_connects = count;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn state(&self, key: impl Into<ResourceKey>) -> Option<Attributes> {
        self.lock().entities.get(&key.into()).cloned()
    }

    pub fn issued(&self) -> Vec<IssuedCommand> {
        self.lock().issued.clone()
    }

    pub fn open_feeds(&self) -> usize {
        self.lock()
            .feeds
            .iter()
            .filter(|feed| !feed.tx.is_closed())
            .count()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store the resource and report it to every feed that covers it.
    fn write(&self, key: &ResourceKey, attributes: Option<Attributes>) {
        let mut state = self.lock();
        match &attributes {
            Some(attrs) => state.entities.insert(key.clone(), attrs.clone()),
            None => state.entities.remove(key),
        };

        let sequence = {
            let seq = state.sequences.entry(key.clone()).or_insert(0);
            *seq += 1;
            *seq
        };
        let event = RawEvent {
            resource_key: key.to_string(),
            sequence,
            timestamp: Some(Utc::now()),
            attributes,
            cursor: Some((state.log.len() + 1).to_string()),
        };
        state.log.push(event.clone());
        state.feeds.retain(|feed| {
            if feed.covers(key.as_str()) {
                feed.tx.send(Ok(event.clone())).is_ok()
            } else {
                !feed.tx.is_closed()
            }
        });
    }

    async fn play(self, key: ResourceKey, behavior: Behavior, next: Option<Attributes>, latency: Duration) {
        if behavior == Behavior::Silent {
            return;
        }
        tokio::time::sleep(latency).await;
        match behavior {
            Behavior::Silent | Behavior::Apply => self.write(&key, next),
            Behavior::Override(winner) => {
                let mut final_state = next.unwrap_or_default();
                final_state.extend(winner);
                self.write(&key, Some(final_state));
            }
            Behavior::Ramp {
                attribute,
                through,
                interval,
            } => {
                for value in through {
                    let mut step = next.clone().unwrap_or_default();
                    step.insert(attribute.clone(), value);
                    self.write(&key, Some(step));
                    tokio::time::sleep(interval).await;
                }
                self.write(&key, next);
            }
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SimulatedBackend")
            .field("entities", &state.entities.len())
            .field("events", &state.log.len())
            .field("feeds", &state.feeds.len())
            .field("resume", &self.inner.resume)
            .finish()
    }
}

/// State after applying `operation` to `current`.
fn apply(current: Option<&Attributes>, operation: &Operation) -> Option<Attributes> {
    let mut next = current.cloned().unwrap_or_default();
    match operation {
        Operation::TurnOn { attributes } => {
            next.insert(STATE_ATTRIBUTE.into(), Value::from("on"));
            next.extend(attributes.clone());
        }
        Operation::TurnOff => {
            next.insert(STATE_ATTRIBUTE.into(), Value::from("off"));
        }
        Operation::Set { attributes } => next.extend(attributes.clone()),
        Operation::AddMember { attribute, member } => {
            let mut members = match next.remove(attribute) {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            if !members.contains(member) {
                members.push(member.clone());
            }
            next.insert(attribute.clone(), Value::Array(members));
        }
        Operation::RemoveMember { attribute, member } => {
            if let Some(Value::Array(items)) = next.get_mut(attribute) {
                items.retain(|item| item != member);
            }
        }
        Operation::Create { attributes } => return Some(attributes.clone()),
        Operation::Delete => return None,
    }
    Some(next)
}

#[async_trait::async_trait]
impl Backend for SimulatedBackend {
    async fn issue(&self, key: &ResourceKey, operation: &Operation) -> Result<(), IssueRejection> {
        let (behavior, next, latency) = {
            let mut state = self.lock();
            state.issued.push(IssuedCommand {
                key: key.clone(),
                operation: operation.clone(),
                at: Instant::now(),
            });
            if let Some(rejection) = state.rejections.pop_front() {
                return Err(rejection);
            }

            let current = state.entities.get(key);
            if current.is_none() && !matches!(operation, Operation::Create { .. }) {
                return Err(IssueRejection::new(
                    RejectionKind::NotFound,
                    format!("no resource named {key}"),
                ));
            }
            let next = apply(current, operation);
            let behavior = state.behaviors.get(key).cloned().unwrap_or(Behavior::Apply);
            (behavior, next, state.latency.unwrap_or(DEFAULT_LATENCY))
        };

        debug!(key = %key, operation = operation.kind(), ?behavior, "simulated command accepted");
        tokio::spawn(self.clone().play(key.clone(), behavior, next, latency));
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventSource for SimulatedBackend {
    fn supports_resume(&self) -> bool {
        self.inner.resume
    }

    async fn subscribe(
        &self,
        scope: &SubscriptionScope,
        resume: Option<Cursor>,
    ) -> Result<EventStream, SourceError> {
        let mut state = self.lock();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(SourceError::Connect("simulated outage".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Feed {
            scope: scope.clone(),
            tx,
        };

        if let (true, Some(cursor)) = (self.inner.resume, resume) {
            let position: usize = cursor
                .parse()
                .map_err(|_| SourceError::CursorRejected(cursor.clone()))?;
            let missed = state
                .log
                .iter()
                .skip(position)
                .filter(|event| feed.covers(&event.resource_key));
            for event in missed {
                let _ = feed.tx.send(Ok(event.clone()));
            }
        }

        state.feeds.push(feed);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
