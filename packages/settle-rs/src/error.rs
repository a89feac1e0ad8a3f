//! Structured error types and outcome codes for settle.
//!
//! `SettleError` provides pattern-matchable errors for API misuse and
//! lifecycle problems. `OutcomeCode` is the machine-readable status carried by
//! every [`OperationResult`](crate::OperationResult).
//!
//! # The Error Boundary Rule
//!
//! > **Expected failure modes never escape `execute` as errors or panics.**
//!
//! - `SettleError` / `anyhow` are internal transport (construction, config)
//! - `OutcomeCode` + explanation + [`Remediation`] is the only externalized failure
//!
//! # Example
//!
//! ```ignore
//! let result = handle.execute(request).await;
//! match result.code {
//!     OutcomeCode::Satisfied => println!("done"),
//!     OutcomeCode::Diverged => println!("someone else changed it: {}", result.explanation),
//!     code => println!("{code}: {:?}", result.remediation),
//! }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wait::VerificationStatus;

// =============================================================================
// Outcome Code
// =============================================================================

/// Machine-readable status of a finished request.
///
/// `Diverged` is kept apart from `TimedOut` so callers can tell "nothing
/// happened" from "something else happened".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeCode {
    /// The requested effect was observed.
    Satisfied,
    /// The request was malformed; nothing was issued.
    InvalidRequest,
    /// The resource lock could not be obtained in time; nothing was issued.
    ResourceBusy,
    /// The backend refused the command, or every transient retry failed.
    CommandRejected,
    /// Observations arrived but never reached the desired state.
    TimedOut,
    /// A final observed state contradicts the desired state.
    Diverged,
    /// Observation coverage was insufficient to decide.
    Unknown,
    /// The event stream is down; nothing was issued.
    ConnectivityLost,
    /// The caller stopped waiting. An issued command is not retracted.
    Cancelled,
}

impl OutcomeCode {
    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeCode::Satisfied)
    }

    /// Default remediation for this outcome, if one applies.
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            OutcomeCode::Satisfied | OutcomeCode::Cancelled => None,
            OutcomeCode::InvalidRequest => Some(Remediation::FixParameters),
            OutcomeCode::ResourceBusy => Some(Remediation::RetryLater),
            OutcomeCode::CommandRejected => Some(Remediation::RetryLater),
            OutcomeCode::TimedOut => Some(Remediation::IncreaseDeadline),
            OutcomeCode::Diverged => Some(Remediation::VerifyResourceKey),
            OutcomeCode::Unknown => Some(Remediation::IncreaseDeadline),
            OutcomeCode::ConnectivityLost => Some(Remediation::CheckConnectivity),
        }
    }
}

impl From<VerificationStatus> for OutcomeCode {
    fn from(status: VerificationStatus) -> Self {
        match status {
            VerificationStatus::Satisfied => OutcomeCode::Satisfied,
            VerificationStatus::TimedOut => OutcomeCode::TimedOut,
            VerificationStatus::Diverged => OutcomeCode::Diverged,
            // Non-terminal statuses never reach a result; treat as undecided.
            VerificationStatus::Unknown
            | VerificationStatus::Created
            | VerificationStatus::AwaitingObservation => OutcomeCode::Unknown,
        }
    }
}

impl fmt::Display for OutcomeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeCode::Satisfied => write!(f, "satisfied"),
            OutcomeCode::InvalidRequest => write!(f, "invalid_request"),
            OutcomeCode::ResourceBusy => write!(f, "resource_busy"),
            OutcomeCode::CommandRejected => write!(f, "command_rejected"),
            OutcomeCode::TimedOut => write!(f, "timed_out"),
            OutcomeCode::Diverged => write!(f, "diverged"),
            OutcomeCode::Unknown => write!(f, "unknown"),
            OutcomeCode::ConnectivityLost => write!(f, "connectivity_lost"),
            OutcomeCode::Cancelled => write!(f, "cancelled"),
        }
    }
}

// =============================================================================
// Remediation
// =============================================================================

/// Suggested next step for the caller after a non-success outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remediation {
    IncreaseDeadline,
    VerifyResourceKey,
    RetryLater,
    CheckConnectivity,
    CheckPermissions,
    FixParameters,
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hint = match self {
            Remediation::IncreaseDeadline => "increase the deadline and check the resource state",
            Remediation::VerifyResourceKey => "verify the resource key exists and is not controlled elsewhere",
            Remediation::RetryLater => "retry later",
            Remediation::CheckConnectivity => "check connectivity to the backend event stream",
            Remediation::CheckPermissions => "check credentials and permissions for this resource",
            Remediation::FixParameters => "fix the request parameters",
        };
        f.write_str(hint)
    }
}

// =============================================================================
// Settle Error
// =============================================================================

/// Structured error type for settle operations.
#[derive(Debug, Error)]
pub enum SettleError {
    /// The request failed validation.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// A service was started twice.
    #[error("{service} is already running")]
    AlreadyRunning { service: &'static str },

    /// A service was used before being started.
    #[error("{service} is not running")]
    NotRunning { service: &'static str },

    /// A verification tried to leave a terminal state or move backward.
    #[error("invalid verification transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: VerificationStatus,
        to: VerificationStatus,
    },

    /// Configuration values are inconsistent.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl SettleError {
    pub(crate) fn invalid_request(reason: impl Into<String>) -> Self {
        SettleError::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        SettleError::InvalidConfig {
            reason: reason.into(),
        }
    }
}
