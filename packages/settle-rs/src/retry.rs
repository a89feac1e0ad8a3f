//! Failure classification and retry policy for command issuance.
//!
//! - [`FailureClass`] - how a rejection should be treated
//! - [`Classify`] / [`DefaultClassifier`] - maps backend rejections to classes
//! - [`RetryPolicy`] - attempt budget and exponential backoff
//!
//! Only transient failures are retried. Resource conflicts (another actor
//! outside this engine holds the resource) and terminal failures are surfaced
//! on the first attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{IssueRejection, RejectionKind};

/// Classification of issuance failures for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Connection reset, backend momentarily unavailable. Retried.
    Transient,
    /// The backend reports the resource is held by another actor. Not retried.
    ResourceConflict,
    /// Validation, authorization, not found. Never retried.
    Terminal,
}

/// Maps backend rejections to a [`FailureClass`].
pub trait Classify: Send + Sync + 'static {
    fn classify(&self, rejection: &IssueRejection) -> FailureClass;
}

/// Classification by [`RejectionKind`] alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl Classify for DefaultClassifier {
    fn classify(&self, rejection: &IssueRejection) -> FailureClass {
        match rejection.kind {
            RejectionKind::ConnectionReset | RejectionKind::Unavailable | RejectionKind::Timeout => {
                FailureClass::Transient
            }
            RejectionKind::ResourceLocked => FailureClass::ResourceConflict,
            RejectionKind::Validation
            | RejectionKind::Unauthorized
            | RejectionKind::NotFound
            | RejectionKind::Other => FailureClass::Terminal,
        }
    }
}

/// Attempt budget and backoff schedule for transient failures.
///
/// The delay before retry `n` (1-based) is
/// `min(max_backoff, initial_backoff * multiplier^(n-1))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            multiplier: 4,
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Result of running an issuance under a [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// The backend accepted the command.
    Accepted { attempts: u32 },
    /// The command was not accepted.
    Rejected {
        attempts: u32,
        rejection: IssueRejection,
        class: FailureClass,
        /// True when a transient failure ran out of attempts or time.
        exhausted: bool,
    },
}

impl RetryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Accepted { attempts } | RetryOutcome::Rejected { attempts, .. } => {
                *attempts
            }
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1 = first retry).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Whether another attempt is allowed after `attempts` failures of `class`.
    pub fn should_retry(&self, class: FailureClass, attempts: u32) -> bool {
        class == FailureClass::Transient && attempts < self.max_attempts
    }

    /// Run `issue` until it is accepted, fails non-transiently, runs out of
    /// attempts, or the next backoff would cross `deadline`.
    ///
    /// Each attempt is also bounded by `deadline`; an attempt still pending
    /// then is dropped and reported as a [`RejectionKind::Timeout`].
    pub async fn run<F, Fut>(
        &self,
        classifier: &dyn Classify,
        deadline: Instant,
        mut issue: F,
    ) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), IssueRejection>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            // A backend call that outlives the deadline counts as a timeout.
            let rejection = match tokio::time::timeout_at(deadline, issue(attempts)).await {
                Ok(Ok(())) => return RetryOutcome::Accepted { attempts },
                Ok(Err(rejection)) => rejection,
                Err(_) => IssueRejection::new(
                    RejectionKind::Timeout,
                    "backend did not answer before the request deadline",
                ),
            };

            let class = classifier.classify(&rejection);
            if !self.should_retry(class, attempts) {
                let exhausted = class == FailureClass::Transient;
                warn!(attempts, ?class, error = %rejection, "command issuance failed");
                return RetryOutcome::Rejected {
                    attempts,
                    rejection,
                    class,
                    exhausted,
                };
            }

            let delay = self.backoff(attempts);
            if Instant::now() + delay >= deadline {
                warn!(attempts, error = %rejection, "no time left to retry command issuance");
                return RetryOutcome::Rejected {
                    attempts,
                    rejection,
                    class,
                    exhausted: true,
                };
            }

            debug!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %rejection,
                "transient issuance failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
