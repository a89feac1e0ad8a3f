//! End-to-end handling of one mutation request.
//!
//! ```text
//! execute(request)
//!     │
//!     ├─► validate ───────────────────────────────► InvalidRequest
//!     ├─► check feed connectivity ────────────────► ConnectivityLost
//!     ├─► acquire resource lock (bounded wait) ───► ResourceBusy
//!     ├─► listen on the bus for the key
//!     ├─► [short-circuit if already satisfied] ───► Satisfied (0 attempts)
//!     ├─► issue with retry policy ────────────────► CommandRejected
//!     ├─► wait for verification ──────────────────► Satisfied | TimedOut | Diverged | Unknown
//!     └─► release lock, return OperationResult
//! ```
//!
//! Every path returns an [`OperationResult`]; nothing here returns `Err` or
//! panics for expected failures. The lock guard is dropped on every exit,
//! including when the caller's future is dropped.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::bus::ObservationBus;
use crate::config::EngineConfig;
use crate::core::{Attributes, MutationRequest, RequestId, ResourceKey, StateObservation};
use crate::error::{OutcomeCode, Remediation, SettleError};
use crate::lock::LockTable;
use crate::retry::{Classify, FailureClass, RetryOutcome};
use crate::subscriber::ConnectionState;
use crate::wait::{PendingVerification, VerificationStatus, WaitEngine};

/// Terminal outcome of [`Dispatcher::execute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub request_id: RequestId,
    pub resource_key: ResourceKey,
    pub code: OutcomeCode,
    /// Terminal verification status, when a verification was registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_attributes: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_sequence: Option<u64>,
    pub elapsed_ms: u64,
    /// Issuance attempts made (0 when nothing was issued).
    pub attempts: u32,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Remediation>,
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// Accumulates the parts of a result as a request progresses.
struct Outcome {
    request_id: RequestId,
    key: ResourceKey,
    started: Instant,
    attempts: u32,
    verification: Option<VerificationStatus>,
    observation: Option<StateObservation>,
}

impl Outcome {
    fn finish(
        self,
        code: OutcomeCode,
        explanation: impl Into<String>,
        remediation: Option<Remediation>,
    ) -> OperationResult {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let (final_attributes, final_sequence) = match self.observation {
            Some(obs) => (obs.attributes, Some(obs.sequence)),
            None => (None, None),
        };
        let explanation = explanation.into();

        if code.is_success() {
            info!(request_id = %self.request_id, key = %self.key, elapsed_ms, attempts = self.attempts, "request satisfied");
        } else {
            warn!(
                request_id = %self.request_id,
                key = %self.key,
                %code,
                elapsed_ms,
                attempts = self.attempts,
                explanation = %explanation,
                "request did not succeed"
            );
        }

        OperationResult {
            request_id: self.request_id,
            resource_key: self.key,
            code,
            verification: self.verification,
            final_attributes,
            final_sequence,
            elapsed_ms,
            attempts: self.attempts,
            explanation,
            remediation,
        }
    }

    fn fail(self, code: OutcomeCode, explanation: impl Into<String>) -> OperationResult {
        self.finish(code, explanation, code.remediation())
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// The sole entry point for mutations. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn Backend>,
    classifier: Arc<dyn Classify>,
    bus: ObservationBus,
    locks: LockTable,
    waits: WaitEngine,
    connection: watch::Receiver<ConnectionState>,
    config: Arc<EngineConfig>,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn Backend>,
        classifier: Arc<dyn Classify>,
        bus: ObservationBus,
        locks: LockTable,
        connection: watch::Receiver<ConnectionState>,
        config: EngineConfig,
    ) -> Self {
        let waits = WaitEngine::new(bus.clone(), config.settle_window, config.settle_gap);
        Self {
            backend,
            classifier,
            bus,
            locks,
            waits,
            connection,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a request to a terminal result.
    pub async fn execute(&self, request: MutationRequest) -> OperationResult {
        self.execute_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Execute a request, giving up with `Cancelled` when `cancel` fires.
    ///
    /// Cancellation releases the lock immediately. A command that was already
    /// issued is not retracted.
    pub async fn execute_with_cancel(
        &self,
        request: MutationRequest,
        cancel: &CancellationToken,
    ) -> OperationResult {
        let key = request.key().clone();
        let outcome = Outcome {
            request_id: request.id(),
            key: key.clone(),
            started: Instant::now(),
            attempts: 0,
            verification: None,
            observation: None,
        };
        let id = outcome.request_id;

        debug!(
            request_id = %id,
            key = %key,
            operation = request.operation().kind(),
            "executing request"
        );

        if let Err(e) = validate(&request) {
            return outcome.fail(OutcomeCode::InvalidRequest, e.to_string());
        }

        if let Some(reason) = self.connectivity_problem() {
            return outcome.fail(OutcomeCode::ConnectivityLost, reason);
        }

        let budget = self.effective_deadline(&request);
        let deadline = outcome.started + budget;
        let wait_deadline = outcome.started + self.config.max_queue_wait.min(budget);

        // Lock
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return outcome.fail(OutcomeCode::Cancelled, "cancelled while waiting for the resource lock");
            }
            acquired = self.locks.acquire(&key, id, wait_deadline) => match acquired {
                Ok(guard) => guard,
                Err(e) => {
                    return outcome.fail(OutcomeCode::ResourceBusy, format!("resource {key} is busy: {e}"));
                }
            },
        };

        // Listen before issuing so no effect of this command can be missed.
        let mut listener = self.bus.listen(&key);
        let present_before_issue = self.bus.is_tracked(&key);
        let predicate = request.effective_predicate();

        if self.config.short_circuit {
            if let Some(latest) = self.bus.latest(&key) {
                if predicate.is_satisfied_by(&latest) {
                    debug!(request_id = %id, key = %key, sequence = latest.sequence, "desired state already observed");
                    let mut outcome = outcome;
                    outcome.observation = Some(latest);
                    return outcome.finish(
                        OutcomeCode::Satisfied,
                        format!("{} predicate already satisfied; command not issued", predicate.kind()),
                        None,
                    );
                }
            }
        }

        // Issue
        let attempts = AtomicU32::new(0);
        let operation = request.operation();
        let issued = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.config.retry.run(self.classifier.as_ref(), deadline, |attempt| {
                attempts.store(attempt, Ordering::Relaxed);
                debug!(request_id = %id, key = %key, attempt, "issuing command");
                self.backend.issue(&key, operation)
            }) => Some(result),
        };

        let mut outcome = outcome;
        outcome.attempts = attempts.load(Ordering::Relaxed);

        match issued {
            None => {
                return outcome.fail(
                    OutcomeCode::Cancelled,
                    "cancelled during command issuance; the command may still take effect",
                );
            }
            Some(RetryOutcome::Rejected {
                attempts,
                rejection,
                class,
                ..
            }) => {
                outcome.attempts = attempts;
                let explanation = match class {
                    FailureClass::Transient => {
                        format!("command failed after {attempts} attempt(s): {rejection}")
                    }
                    FailureClass::ResourceConflict => {
                        format!("resource is held by another actor: {rejection}")
                    }
                    FailureClass::Terminal => format!("backend rejected the command: {rejection}"),
                };
                return outcome.finish(
                    OutcomeCode::CommandRejected,
                    explanation,
                    Some(rejection.kind.remediation()),
                );
            }
            Some(RetryOutcome::Accepted { attempts }) => {
                outcome.attempts = attempts;
            }
        }

        // Verify
        let mut pending = PendingVerification::new(id, key.clone(), predicate, deadline)
            .with_baseline_presence(present_before_issue);
        let verdict = self.waits.wait(&mut pending, &mut listener, cancel).await;
        drop(listener);
        debug!(
            request_id = %id,
            key = %key,
            held_ms = guard.held_for().as_millis() as u64,
            "releasing resource lock"
        );
        guard.release();

        outcome.verification = Some(verdict.status);
        outcome.observation = verdict.observation;
        if verdict.cancelled {
            return outcome.finish(OutcomeCode::Cancelled, verdict.explanation, None);
        }
        let code = OutcomeCode::from(verdict.status);
        let remediation = code.remediation();
        outcome.finish(code, verdict.explanation, remediation)
    }

    /// `min(request deadline or default, ceiling)`.
    fn effective_deadline(&self, request: &MutationRequest) -> Duration {
        request
            .deadline()
            .unwrap_or(self.config.default_deadline)
            .min(self.config.max_deadline)
    }

    fn connectivity_problem(&self) -> Option<String> {
        match *self.connection.borrow() {
            ConnectionState::Stopped => Some("event stream subscriber is not running".into()),
            ConnectionState::Disconnected { since } if since.elapsed() > self.config.connectivity_grace => {
                Some(format!(
                    "event stream has been disconnected for {}ms",
                    since.elapsed().as_millis()
                ))
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("locks", &self.locks)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

fn validate(request: &MutationRequest) -> Result<(), SettleError> {
    if request.key().is_blank() {
        return Err(SettleError::invalid_request("resource key is empty"));
    }
    if request.deadline().map(|d| d.is_zero()).unwrap_or(false) {
        return Err(SettleError::invalid_request("deadline must be positive"));
    }
    request
        .operation()
        .validate()
        .map_err(SettleError::invalid_request)?;
    if let Some(predicate) = request.predicate() {
        predicate.validate().map_err(SettleError::invalid_request)?;
    }
    Ok(())
}
