//! Core data model for the dispatch and verification engine.
//!
//! # Overview
//!
//! Settle separates **intent** from **evidence**:
//! - [`MutationRequest`] = Intent (what the caller wants the backend to do)
//! - [`StateObservation`] = Evidence (what the backend's event stream says happened)
//!
//! A backend acknowledging a command only means it was delivered. Whether the
//! effect took place is decided later, by matching observations against a
//! [`Predicate`](crate::Predicate).

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::predicate::Predicate;

/// Attribute snapshot of a resource, as reported by the backend.
pub type Attributes = serde_json::Map<String, Value>;

/// Convert a JSON object into [`Attributes`]. Non-object values yield an empty map.
pub fn to_attributes(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        _ => Attributes::new(),
    }
}

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of the controlled entity or registry item a mutation targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the key is empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ResourceKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Unique identifier for a single mutation request.
///
/// Used as the lock holder id, the verification id, and the `request_id`
/// field in every log line the request produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Operations
// =============================================================================

/// A mutation the backend is asked to perform, with its parameters.
///
/// Serialized with a `kind` tag so operations can be logged and forwarded
/// over a wire without losing their shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Switch the resource on, optionally with extra attributes (brightness, color).
    TurnOn {
        #[serde(default)]
        attributes: Attributes,
    },
    /// Switch the resource off.
    TurnOff,
    /// Write one or more attributes.
    Set { attributes: Attributes },
    /// Add a member to an array-valued attribute (labels, groups).
    AddMember { attribute: String, member: Value },
    /// Remove a member from an array-valued attribute.
    RemoveMember { attribute: String, member: Value },
    /// Create the resource.
    Create {
        #[serde(default)]
        attributes: Attributes,
    },
    /// Delete the resource.
    Delete,
}

impl Operation {
    /// Stable snake_case name of the operation kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::TurnOn { .. } => "turn_on",
            Operation::TurnOff => "turn_off",
            Operation::Set { .. } => "set",
            Operation::AddMember { .. } => "add_member",
            Operation::RemoveMember { .. } => "remove_member",
            Operation::Create { .. } => "create",
            Operation::Delete => "delete",
        }
    }

    /// The operation's parameters as a flat attribute map.
    pub fn parameters(&self) -> Attributes {
        match self {
            Operation::TurnOn { attributes }
            | Operation::Set { attributes }
            | Operation::Create { attributes } => attributes.clone(),
            Operation::AddMember { attribute, member }
            | Operation::RemoveMember { attribute, member } => {
                let mut params = Attributes::new();
                params.insert("attribute".into(), Value::String(attribute.clone()));
                params.insert("member".into(), member.clone());
                params
            }
            Operation::TurnOff | Operation::Delete => Attributes::new(),
        }
    }

    /// Structural problems that make the operation impossible to issue.
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            Operation::Set { attributes } if attributes.is_empty() => {
                Err("set requires at least one attribute".into())
            }
            Operation::TurnOn { attributes }
            | Operation::Set { attributes }
            | Operation::Create { attributes }
                if attributes.keys().any(|k| k.trim().is_empty()) =>
            {
                Err("attribute names must not be blank".into())
            }
            Operation::AddMember { attribute, .. } | Operation::RemoveMember { attribute, .. }
                if attribute.trim().is_empty() =>
            {
                Err("member operations require an attribute name".into())
            }
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Mutation Request
// =============================================================================

/// A request to mutate one resource and verify the effect.
///
/// Immutable once built.
///
/// # Example
///
/// ```ignore
/// let request = MutationRequest::new(
///     "light.kitchen",
///     Operation::Set { attributes: to_attributes(json!({"brightness": 80})) },
/// )
/// .with_deadline(Duration::from_secs(5));
///
/// let result = handle.execute(request).await;
/// ```
#[derive(Debug, Clone)]
pub struct MutationRequest {
    id: RequestId,
    key: ResourceKey,
    operation: Operation,
    predicate: Option<Predicate>,
    deadline: Option<Duration>,
}

impl MutationRequest {
    pub fn new(key: impl Into<ResourceKey>, operation: Operation) -> Self {
        Self {
            id: RequestId::new(),
            key: key.into(),
            operation,
            predicate: None,
            deadline: None,
        }
    }

    /// Use an explicit success predicate instead of the operation's default.
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Bound the whole request (queue wait, issuance, verification).
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// The predicate used for verification: explicit, or derived from the operation.
    pub fn effective_predicate(&self) -> Predicate {
        self.predicate
            .clone()
            .unwrap_or_else(|| Predicate::for_operation(&self.operation))
    }
}

// =============================================================================
// State Observation
// =============================================================================

/// One normalized state-change event for a resource.
///
/// Produced only by the event stream subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateObservation {
    pub key: ResourceKey,
    /// Per-key sequence number from the backend's event stream.
    pub sequence: u64,
    /// Backend timestamp of the change.
    pub timestamp: DateTime<Utc>,
    /// Attribute snapshot, or `None` when the backend reports the resource removed.
    pub attributes: Option<Attributes>,
    /// Local monotonic receive time, used to measure gaps between observations.
    #[serde(skip, default = "Instant::now")]
    pub received_at: Instant,
}

impl StateObservation {
    pub fn new(
        key: ResourceKey,
        sequence: u64,
        timestamp: DateTime<Utc>,
        attributes: Option<Attributes>,
    ) -> Self {
        Self {
            key,
            sequence,
            timestamp,
            attributes,
            received_at: Instant::now(),
        }
    }

    /// True when this observation reports the resource as removed.
    pub fn is_removal(&self) -> bool {
        self.attributes.is_none()
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.as_ref().and_then(|attrs| attrs.get(name))
    }
}
