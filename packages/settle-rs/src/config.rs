use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;

use crate::error::SettleError;
use crate::retry::RetryPolicy;
use crate::subscriber::ReconnectPolicy;

/// Engine configuration, loadable from `SETTLE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Waiters allowed per resource queue (excluding the holder).
    pub max_queue_depth: usize,
    /// Longest a request waits for its resource lock.
    pub max_queue_wait: Duration,
    /// Verification deadline when a request sets none.
    pub default_deadline: Duration,
    /// Ceiling applied to every request deadline.
    pub max_deadline: Duration,
    pub retry: RetryPolicy,
    /// Consecutive unchanged observations that count as settled.
    pub settle_window: usize,
    /// Largest spacing between observations within a settle window.
    pub settle_gap: Duration,
    pub idle_lock_ttl: Duration,
    pub reap_interval: Duration,
    pub listener_capacity: usize,
    /// Return `Satisfied` without issuing when the cached state already matches.
    pub short_circuit: bool,
    /// How long the feed may be down before new requests fail fast.
    pub connectivity_grace: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 16,
            max_queue_wait: Duration::from_secs(10),
            default_deadline: Duration::from_secs(10),
            max_deadline: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            settle_window: 3,
            settle_gap: Duration::from_secs(1),
            idle_lock_ttl: Duration::from_secs(300),
            reap_interval: Duration::from_secs(60),
            listener_capacity: 64,
            short_circuit: false,
            connectivity_grace: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |name: &str, default: Duration| -> Result<Duration> {
            match lookup(name) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .with_context(|| format!("{name} must be a number of milliseconds")),
                None => Ok(default),
            }
        };
        let number = |name: &str, default: u64| -> Result<u64> {
            match lookup(name) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("{name} must be a valid number")),
                None => Ok(default),
            }
        };

        let config = Self {
            max_queue_depth: number("SETTLE_MAX_QUEUE_DEPTH", defaults.max_queue_depth as u64)? as usize,
            max_queue_wait: millis("SETTLE_MAX_QUEUE_WAIT_MS", defaults.max_queue_wait)?,
            default_deadline: millis("SETTLE_DEFAULT_DEADLINE_MS", defaults.default_deadline)?,
            max_deadline: millis("SETTLE_MAX_DEADLINE_MS", defaults.max_deadline)?,
            retry: RetryPolicy {
                max_attempts: number("SETTLE_RETRY_ATTEMPTS", defaults.retry.max_attempts as u64)?
                    .try_into()
                    .context("SETTLE_RETRY_ATTEMPTS is too large")?,
                initial_backoff: millis("SETTLE_RETRY_INITIAL_BACKOFF_MS", defaults.retry.initial_backoff)?,
                multiplier: number("SETTLE_RETRY_MULTIPLIER", defaults.retry.multiplier as u64)?
                    .try_into()
                    .context("SETTLE_RETRY_MULTIPLIER is too large")?,
                max_backoff: millis("SETTLE_RETRY_MAX_BACKOFF_MS", defaults.retry.max_backoff)?,
            },
            settle_window: number("SETTLE_WINDOW", defaults.settle_window as u64)? as usize,
            settle_gap: millis("SETTLE_GAP_MS", defaults.settle_gap)?,
            idle_lock_ttl: millis("SETTLE_IDLE_LOCK_TTL_MS", defaults.idle_lock_ttl)?,
            reap_interval: millis("SETTLE_REAP_INTERVAL_MS", defaults.reap_interval)?,
            listener_capacity: number("SETTLE_LISTENER_CAPACITY", defaults.listener_capacity as u64)? as usize,
            short_circuit: match lookup("SETTLE_SHORT_CIRCUIT") {
                Some(raw) => parse_flag(&raw).context("SETTLE_SHORT_CIRCUIT must be true or false")?,
                None => defaults.short_circuit,
            },
            connectivity_grace: millis("SETTLE_CONNECTIVITY_GRACE_MS", defaults.connectivity_grace)?,
            reconnect: ReconnectPolicy {
                initial: millis("SETTLE_RECONNECT_INITIAL_MS", defaults.reconnect.initial)?,
                max: millis("SETTLE_RECONNECT_MAX_MS", defaults.reconnect.max)?,
                ..defaults.reconnect
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject zero sizes and inverted bounds.
    pub fn validate(&self) -> Result<(), SettleError> {
        let checks: [(bool, &str); 11] = [
            (self.max_queue_depth == 0, "max_queue_depth must be at least 1"),
            (self.max_queue_wait.is_zero(), "max_queue_wait must be positive"),
            (self.default_deadline.is_zero(), "default_deadline must be positive"),
            (
                self.default_deadline > self.max_deadline,
                "default_deadline must not exceed max_deadline",
            ),
            (self.retry.max_attempts == 0, "retry attempts must be at least 1"),
            (
                self.retry.initial_backoff > self.retry.max_backoff,
                "retry initial backoff must not exceed max backoff",
            ),
            (self.settle_window == 0, "settle_window must be at least 1"),
            (self.settle_gap.is_zero(), "settle_gap must be positive"),
            (self.listener_capacity == 0, "listener_capacity must be at least 1"),
            (self.reap_interval.is_zero(), "reap_interval must be positive"),
            (
                self.reconnect.initial > self.reconnect.max,
                "reconnect initial delay must not exceed the maximum",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(SettleError::invalid_config(*reason)),
            None => Ok(()),
        }
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("unrecognized flag value {other:?}")),
    }
}
