//! # Settle
//!
//! Dispatches mutations to an eventually consistent device-control backend
//! and decides, from the backend's own event stream, whether each mutation
//! actually took effect.
//!
//! ## Core Concepts
//!
//! Settle separates **intent** from **evidence**:
//! - [`MutationRequest`] = Intent (what the caller wants changed)
//! - [`StateObservation`] = Evidence (what the event stream reports)
//!
//! The key principle: **an acknowledgment is not an effect**. A request only
//! succeeds when an observation newer than the command satisfies its
//! [`Predicate`].
//!
//! ## Architecture
//!
//! ```text
//! EventSource (websocket / feed)
//!     │
//!     ▼ subscribe()
//! Subscriber ── reconnect with backoff, record gaps
//!     │
//!     ▼ publish()
//! ObservationBus ── per-key sequence filter, bounded listeners
//!     │
//!     ▼ listen()                       caller
//! WaitEngine ◄─────────────┐             │
//!     │                    │             ▼ execute()
//!     ▼ Verdict            │        Dispatcher
//! OperationResult          │             │
//!                          │             ├─► LockTable.acquire()  (FIFO per key)
//!                          └─────────────┤
//!                                        └─► Backend.issue()      (with retry)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One writer per key** - Mutations to the same resource never overlap
//! 2. **Listen before issue** - No observation caused by a command is missed
//! 3. **Monotonic sequences** - Stale or duplicate observations are dropped
//! 4. **Bounded everything** - Queues, listener buffers and deadlines have limits
//! 5. **Every request ends** - Each request gets exactly one terminal result
//!
//! ## Example
//!
//! ```ignore
//! use settle::{Engine, EngineConfig, MutationRequest, Operation, Predicate};
//! use serde_json::json;
//!
//! let handle = Engine::builder()
//!     .with_config(EngineConfig::from_env()?)
//!     .with_backend(backend.clone())
//!     .with_event_source(backend)
//!     .build()?
//!     .start()?;
//!
//! let result = handle
//!     .execute(
//!         MutationRequest::new("light.kitchen", Operation::TurnOff)
//!             .with_deadline(Duration::from_secs(5)),
//!     )
//!     .await;
//!
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! ```

// Core modules
mod backend;
mod bus;
mod config;
mod core;
mod dispatch;
mod engine;
mod error;
mod lock;
mod predicate;
mod retry;
mod subscriber;
mod wait;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// End-to-end scenarios (test-only)
#[cfg(test)]
mod scenario_tests;

// Re-export data model
pub use crate::core::{
    to_attributes, Attributes, MutationRequest, Operation, RequestId, ResourceKey,
    StateObservation,
};

// Re-export predicate types
pub use predicate::{Evaluation, Predicate, STATE_ATTRIBUTE};

// Re-export error types
pub use crate::error::{OutcomeCode, Remediation, SettleError};

// Re-export backend types
pub use backend::{Backend, IssueRejection, RejectionKind};

// Re-export retry types
pub use retry::{Classify, DefaultClassifier, FailureClass, RetryOutcome, RetryPolicy};

// Re-export bus types
pub use bus::{Listener, ObservationBus, PublishOutcome};

// Re-export lock types
pub use lock::{LockError, LockGuard, LockTable};

// Re-export verification types
pub use wait::{PendingVerification, Verdict, VerificationStatus, WaitEngine};

// Re-export subscriber types
pub use subscriber::{
    ConnectionState, Cursor, EventSource, EventStream, RawEvent, ReconnectPolicy, SourceError,
    Subscriber, SubscriptionScope,
};

// Re-export configuration
pub use config::EngineConfig;

// Re-export dispatcher types
pub use dispatch::{Dispatcher, OperationResult};

// Re-export engine types (primary entry point)
pub use engine::{Engine, EngineBuilder, EngineHandle};

// Re-export commonly used external types
pub use async_trait::async_trait;
