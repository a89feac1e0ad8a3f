//! Settle Engine - wires the subscriber, bus, lock table, and dispatcher.
//!
//! ```text
//! EventSource ──► Subscriber ──► ObservationBus ──► WaitEngine
//!                                                      ▲
//! caller ──► Dispatcher ──► LockTable ──► Backend      │
//!                 └────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use settle::{Engine, EngineConfig, MutationRequest, Operation};
//!
//! let engine = Engine::builder()
//!     .with_config(EngineConfig::from_env()?)
//!     .with_backend(backend.clone())
//!     .with_event_source(backend)
//!     .build()?;
//!
//! // Starts the event stream subscriber, the idle-lock reaper and the
//! // removed-resource pruner
//! let handle = engine.start()?;
//!
//! let result = handle
//!     .execute(MutationRequest::new("light.kitchen", Operation::TurnOff))
//!     .await;
//!
//! handle.stop().await?;
//! ```

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::bus::ObservationBus;
use crate::config::EngineConfig;
use crate::core::MutationRequest;
use crate::dispatch::{Dispatcher, OperationResult};
use crate::error::SettleError;
use crate::lock::LockTable;
use crate::retry::{Classify, DefaultClassifier};
use crate::subscriber::{ConnectionState, EventSource, Subscriber, SubscriptionScope};

// =============================================================================
// Engine
// =============================================================================

/// A fully wired engine that has not been started.
pub struct Engine {
    config: EngineConfig,
    bus: ObservationBus,
    locks: LockTable,
    subscriber: Arc<Subscriber>,
    dispatcher: Dispatcher,
}

impl Engine {
    /// Create a new engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn bus(&self) -> &ObservationBus {
        &self.bus
    }

    /// Start the subscriber, idle-lock reaper and removed-resource pruner.
    ///
    /// Returns a handle for executing requests.
    pub fn start(self) -> Result<EngineHandle, SettleError> {
        info!(
            max_queue_depth = self.config.max_queue_depth,
            default_deadline_ms = self.config.default_deadline.as_millis() as u64,
            short_circuit = self.config.short_circuit,
            "starting settle engine"
        );

        self.subscriber.start()?;

        let shutdown = CancellationToken::new();
        let reaper = self.locks.spawn_reaper(
            self.config.idle_lock_ttl,
            self.config.reap_interval,
            shutdown.clone(),
        );
        let pruner = self.bus.spawn_pruner(
            self.config.idle_lock_ttl,
            self.config.reap_interval,
            shutdown.clone(),
        );

        Ok(EngineHandle {
            dispatcher: self.dispatcher,
            subscriber: self.subscriber,
            bus: self.bus,
            locks: self.locks,
            shutdown,
            housekeeping: Mutex::new(vec![
                ("idle lock reaper", reaper),
                ("removed resource pruner", pruner),
            ]),
        })
    }
}

// =============================================================================
// Engine Handle
// =============================================================================

/// Handle to a running engine.
///
/// Requests can be executed concurrently from any number of tasks through a
/// shared reference (or a clone of [`EngineHandle::dispatcher`]).
pub struct EngineHandle {
    dispatcher: Dispatcher,
    subscriber: Arc<Subscriber>,
    bus: ObservationBus,
    locks: LockTable,
    shutdown: CancellationToken,
    housekeeping: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl EngineHandle {
    /// Execute a request to a terminal result.
    pub async fn execute(&self, request: MutationRequest) -> OperationResult {
        self.dispatcher.execute(request).await
    }

    /// Execute a request that ends with `Cancelled` if `cancel` fires first.
    pub async fn execute_with_cancel(
        &self,
        request: MutationRequest,
        cancel: &CancellationToken,
    ) -> OperationResult {
        self.dispatcher.execute_with_cancel(request, cancel).await
    }

    /// A cloneable dispatcher for spawning requests onto other tasks.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn bus(&self) -> &ObservationBus {
        &self.bus
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.subscriber.state()
    }

    /// Receiver for connection state changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.subscriber.watch_state()
    }

    /// Stop the subscriber and background tasks. Requests issued afterwards fail with
    /// `ConnectivityLost`.
    pub async fn stop(&self) -> Result<(), SettleError> {
        self.shutdown.cancel();
        let tasks = std::mem::take(
            &mut *self
                .housekeeping
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for (name, task) in tasks {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "background task ended abnormally");
            }
        }
        self.subscriber.stop().await?;
        info!("settle engine stopped");
        Ok(())
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("connection", &self.connection_state())
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Engine Builder
// =============================================================================

/// Builder for constructing an [`Engine`].
///
/// # Example
///
/// ```ignore
/// let engine = EngineBuilder::new()
///     .with_config(config)
///     .with_backend(HttpBackend::new(url))
///     .with_event_source(WebsocketFeed::new(url))
///     .with_scope(SubscriptionScope::Keys(vec!["light.kitchen".into()]))
///     .build()?;
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    backend: Option<Arc<dyn Backend>>,
    source: Option<Arc<dyn EventSource>>,
    classifier: Arc<dyn Classify>,
    scope: SubscriptionScope,
    bus: Option<ObservationBus>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            backend: None,
            source: None,
            classifier: Arc::new(DefaultClassifier),
            scope: SubscriptionScope::All,
            bus: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// The backend that receives issued commands.
    pub fn with_backend<B: Backend>(mut self, backend: B) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    /// Use an Arc-wrapped backend, e.g. one that also serves as event source.
    pub fn with_backend_arc(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// The change feed the subscriber connects to.
    pub fn with_event_source<S: EventSource>(mut self, source: S) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn with_event_source_arc(mut self, source: Arc<dyn EventSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replace the default rejection classifier.
    pub fn with_classifier<C: Classify>(mut self, classifier: C) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Limit the subscription to specific keys (default: all).
    pub fn with_scope(mut self, scope: SubscriptionScope) -> Self {
        self.scope = scope;
        self
    }

    /// Use an existing bus instead of creating one.
    pub fn with_bus(mut self, bus: ObservationBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Validate configuration and wire the components.
    pub fn build(self) -> Result<Engine, SettleError> {
        self.config.validate()?;
        let backend = self
            .backend
            .ok_or_else(|| SettleError::invalid_config("a backend is required"))?;
        let source = self
            .source
            .ok_or_else(|| SettleError::invalid_config("an event source is required"))?;

        let bus = self.bus.unwrap_or_else(|| {
            ObservationBus::with_settings(self.config.listener_capacity, self.config.max_deadline)
        });
        let locks = LockTable::new(self.config.max_queue_depth);
        let subscriber = Arc::new(Subscriber::new(
            source,
            bus.clone(),
            self.scope,
            self.config.reconnect.clone(),
        ));
        let dispatcher = Dispatcher::new(
            backend,
            self.classifier,
            bus.clone(),
            locks.clone(),
            subscriber.watch_state(),
            self.config.clone(),
        );

        Ok(Engine {
            config: self.config,
            bus,
            locks,
            subscriber,
            dispatcher,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
