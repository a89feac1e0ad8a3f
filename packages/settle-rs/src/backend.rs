//! Command issuance interface for the device-control backend.
//!
//! Implement [`Backend`] to connect settle to a real system (a websocket
//! client, an HTTP API, a message bus). Issuance is acknowledgment only:
//! `Ok(())` means the backend accepted the command, not that it took effect.
//!
//! # Example Implementation
//!
//! ```ignore
//! use settle::{Backend, IssueRejection, Operation, RejectionKind, ResourceKey};
//!
//! struct HttpBackend { client: reqwest::Client, base: String }
//!
//! #[async_trait]
//! impl Backend for HttpBackend {
//!     async fn issue(&self, key: &ResourceKey, op: &Operation) -> Result<(), IssueRejection> {
//!         let resp = self.client
//!             .post(format!("{}/services/{}", self.base, op.kind()))
//!             .json(&op.parameters())
//!             .send()
//!             .await
//!             .map_err(|e| IssueRejection::new(RejectionKind::ConnectionReset, e.to_string()))?;
//!         match resp.status().as_u16() {
//!             200..=299 => Ok(()),
//!             401 | 403 => Err(IssueRejection::new(RejectionKind::Unauthorized, "denied")),
//!             404 => Err(IssueRejection::new(RejectionKind::NotFound, key.to_string())),
//!             _ => Err(IssueRejection::new(RejectionKind::Unavailable, "backend error")),
//!         }
//!     }
//! }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Operation, ResourceKey};
use crate::error::Remediation;

/// Sends mutations to the backend.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Issue one command. Returns once the backend has accepted or rejected it.
    async fn issue(&self, key: &ResourceKey, operation: &Operation) -> Result<(), IssueRejection>;
}

/// Why the backend refused a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// Connection dropped while issuing.
    ConnectionReset,
    /// Backend momentarily unavailable (starting up, overloaded).
    Unavailable,
    /// Issuance did not complete in time.
    Timeout,
    /// Another actor outside this engine holds the resource.
    ResourceLocked,
    /// Parameters were rejected.
    Validation,
    /// Authentication or authorization failed.
    Unauthorized,
    /// The resource does not exist.
    NotFound,
    /// Anything the backend could not describe more precisely.
    Other,
}

impl RejectionKind {
    /// Suggested next step when a rejection of this kind reaches the caller.
    pub fn remediation(&self) -> Remediation {
        match self {
            RejectionKind::ConnectionReset | RejectionKind::Unavailable | RejectionKind::Timeout => {
                Remediation::CheckConnectivity
            }
            RejectionKind::ResourceLocked | RejectionKind::Other => Remediation::RetryLater,
            RejectionKind::Validation => Remediation::FixParameters,
            RejectionKind::Unauthorized => Remediation::CheckPermissions,
            RejectionKind::NotFound => Remediation::VerifyResourceKey,
        }
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionKind::ConnectionReset => write!(f, "connection_reset"),
            RejectionKind::Unavailable => write!(f, "unavailable"),
            RejectionKind::Timeout => write!(f, "timeout"),
            RejectionKind::ResourceLocked => write!(f, "resource_locked"),
            RejectionKind::Validation => write!(f, "validation"),
            RejectionKind::Unauthorized => write!(f, "unauthorized"),
            RejectionKind::NotFound => write!(f, "not_found"),
            RejectionKind::Other => write!(f, "other"),
        }
    }
}

/// A command rejected by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct IssueRejection {
    pub kind: RejectionKind,
    pub message: String,
}

impl IssueRejection {
    pub fn new(kind: RejectionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
