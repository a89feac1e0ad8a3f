//! Correlation of observations against pending verifications.
//!
//! A [`PendingVerification`] is owned by exactly one wait from registration
//! until it reaches a terminal status. The wait consumes observations from a
//! bus [`Listener`] registered before the command was issued, so nothing
//! emitted after issuance is missed.
//!
//! # State Machine
//!
//! ```text
//! Created ──► AwaitingObservation ──► Satisfied
//!                                 ├─► TimedOut
//!                                 ├─► Diverged
//!                                 └─► Unknown
//! ```
//!
//! Terminal statuses are write-once.
//!
//! # Resolution at the deadline
//!
//! | Observations | Last state | Gap overlapped | Result |
//! |---|---|---|---|
//! | none | - | - | `Unknown` |
//! | some | final contradiction | - | `Diverged` |
//! | some | missing / moving | yes | `Unknown` |
//! | some | missing / moving | no | `TimedOut` |

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::bus::{Listener, ObservationBus};
use crate::core::{RequestId, ResourceKey, StateObservation};
use crate::error::SettleError;
use crate::predicate::{Evaluation, Matcher, Predicate};

// =============================================================================
// Verification Status
// =============================================================================

/// Lifecycle of a pending verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Created,
    AwaitingObservation,
    Satisfied,
    TimedOut,
    Diverged,
    Unknown,
}

impl VerificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerificationStatus::Satisfied
                | VerificationStatus::TimedOut
                | VerificationStatus::Diverged
                | VerificationStatus::Unknown
        )
    }

    /// Forward-only transitions; nothing leaves a terminal status.
    pub fn can_transition_to(&self, next: VerificationStatus) -> bool {
        match (self, next) {
            (VerificationStatus::Created, VerificationStatus::AwaitingObservation) => true,
            (VerificationStatus::Created | VerificationStatus::AwaitingObservation, next) => {
                next.is_terminal()
            }
            _ => false,
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationStatus::Created => write!(f, "created"),
            VerificationStatus::AwaitingObservation => write!(f, "awaiting_observation"),
            VerificationStatus::Satisfied => write!(f, "satisfied"),
            VerificationStatus::TimedOut => write!(f, "timed_out"),
            VerificationStatus::Diverged => write!(f, "diverged"),
            VerificationStatus::Unknown => write!(f, "unknown"),
        }
    }
}

// =============================================================================
// Pending Verification
// =============================================================================

/// One request's outstanding check against the event stream.
#[derive(Debug)]
pub struct PendingVerification {
    request_id: RequestId,
    key: ResourceKey,
    predicate: Predicate,
    registered_at: Instant,
    deadline: Instant,
    status: VerificationStatus,
    present_at_registration: bool,
}

impl PendingVerification {
    pub fn new(request_id: RequestId, key: ResourceKey, predicate: Predicate, deadline: Instant) -> Self {
        Self {
            request_id,
            key,
            predicate,
            registered_at: Instant::now(),
            deadline,
            status: VerificationStatus::Created,
            present_at_registration: false,
        }
    }

    /// Record whether the resource was tracked when the wait was registered.
    /// An `Exists` check on a resource that was already present only succeeds
    /// once it is removed and appears again.
    pub fn with_baseline_presence(mut self, present: bool) -> Self {
        self.present_at_registration = present;
        self
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn status(&self) -> VerificationStatus {
        self.status
    }

    /// Move to `next`, refusing backward moves and re-entry after a terminal status.
    pub fn transition(&mut self, next: VerificationStatus) -> Result<(), SettleError> {
        if !self.status.can_transition_to(next) {
            return Err(SettleError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

// =============================================================================
// Wait Engine
// =============================================================================

/// How a wait ended.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub status: VerificationStatus,
    /// The caller's cancellation token fired.
    pub cancelled: bool,
    /// The satisfying observation when satisfied, else the last one seen.
    pub observation: Option<StateObservation>,
    /// Observations received for the key during the wait.
    pub observed: usize,
    pub explanation: String,
}

/// Resolves pending verifications against bus listeners.
#[derive(Debug, Clone)]
pub struct WaitEngine {
    bus: ObservationBus,
    settle_window: usize,
    settle_gap: Duration,
}

impl WaitEngine {
    pub fn new(bus: ObservationBus, settle_window: usize, settle_gap: Duration) -> Self {
        Self {
            bus,
            settle_window,
            settle_gap,
        }
    }

    /// Block until `pending` reaches a terminal status, its deadline passes,
    /// or `cancel` fires.
    pub async fn wait(
        &self,
        pending: &mut PendingVerification,
        listener: &mut Listener,
        cancel: &CancellationToken,
    ) -> Verdict {
        self.advance(pending, VerificationStatus::AwaitingObservation);

        let mut matcher = Matcher::new(pending.predicate.clone(), self.settle_window, self.settle_gap)
            .require_appearance(pending.present_at_registration);
        let mut last: Option<StateObservation> = None;
        let deadline = pending.deadline;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.advance(pending, VerificationStatus::Unknown);
                    debug!(request_id = %pending.request_id, key = %pending.key, "verification cancelled");
                    return Verdict {
                        status: VerificationStatus::Unknown,
                        cancelled: true,
                        observation: last,
                        observed: matcher.observed(),
                        explanation: "wait cancelled by caller; the command may still take effect".into(),
                    };
                }
                obs = listener.recv() => {
                    let evaluation = matcher.observe(&obs);
                    debug!(
                        request_id = %pending.request_id,
                        key = %obs.key,
                        sequence = obs.sequence,
                        ?evaluation,
                        "observation evaluated"
                    );
                    if evaluation == Evaluation::Satisfied {
                        self.advance(pending, VerificationStatus::Satisfied);
                        return Verdict {
                            status: VerificationStatus::Satisfied,
                            cancelled: false,
                            explanation: format!(
                                "{} predicate satisfied at sequence {}",
                                matcher.predicate().kind(),
                                obs.sequence
                            ),
                            observation: Some(obs),
                            observed: matcher.observed(),
                        };
                    }
                    last = Some(obs);
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        let (status, explanation) = self.resolve_at_deadline(pending, &matcher, last.as_ref());
        self.advance(pending, status);
        debug!(request_id = %pending.request_id, key = %pending.key, %status, "verification resolved at deadline");
        Verdict {
            status,
            cancelled: false,
            observation: last,
            observed: matcher.observed(),
            explanation,
        }
    }

    fn resolve_at_deadline(
        &self,
        pending: &PendingVerification,
        matcher: &Matcher,
        last: Option<&StateObservation>,
    ) -> (VerificationStatus, String) {
        let now = Instant::now();
        if matcher.observed() == 0 {
            let reason = if self.bus.gap_overlaps(pending.registered_at, now) {
                "no observation received; the event stream may have missed events"
            } else {
                "no observation received for the resource before the deadline"
            };
            return (VerificationStatus::Unknown, reason.into());
        }
        if matcher.contradiction_is_final(now) {
            let seen = last
                .and_then(|obs| obs.attributes.as_ref())
                .map(|attrs| serde_json::Value::Object(attrs.clone()).to_string())
                .unwrap_or_else(|| "removed".into());
            return (
                VerificationStatus::Diverged,
                format!("resource settled in a different state: {seen}"),
            );
        }
        if self.bus.gap_overlaps(pending.registered_at, now) {
            return (
                VerificationStatus::Unknown,
                "event stream gap overlapped the wait; outcome cannot be determined".into(),
            );
        }
        (
            VerificationStatus::TimedOut,
            format!(
                "{} observation(s) received but the desired state was not reached",
                matcher.observed()
            ),
        )
    }

    fn advance(&self, pending: &mut PendingVerification, next: VerificationStatus) {
        if let Err(e) = pending.transition(next) {
            error!(request_id = %pending.request_id, error = %e, "verification state machine violated");
        }
    }
}
