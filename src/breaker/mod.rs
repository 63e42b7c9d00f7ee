//! Circuit breaker for automatic operations.
//!
//! Scheduled snapshots and stashes should not keep hammering a disk that is
//! full or a tree that cannot be read. The breaker counts consecutive
//! failures of those automatic flows; once the count reaches the threshold
//! they skip themselves until a success, a manual reset, or until the last
//! failure is older than the reset window.
//!
//! States:
//! - Closed: fewer than `threshold` consecutive failures, operations run
//! - Open: `threshold` or more, automatic operations are skipped
//!
//! User-initiated operations never consult the breaker.

mod error;
mod store;

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

pub use error::{BreakerError, BreakerResult};
pub use store::{BreakerState, BreakerStore, FileBreakerStore, MemoryBreakerStore};

pub const DEFAULT_THRESHOLD: u32 = 3;
pub const DEFAULT_RESET_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// consecutive failures that open the breaker
    pub threshold: u32,
    /// an open breaker closes itself once the last failure is this old
    pub reset_after: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            reset_after: DEFAULT_RESET_AFTER,
        }
    }
}

/// Persistent consecutive-failure breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    store: Box<dyn BreakerStore>,
    /// serializes load-modify-save cycles
    lock: Mutex<()>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, store: Box<dyn BreakerStore>) -> BreakerResult<Self> {
        if config.threshold == 0 {
            return Err(BreakerError::InvalidConfig("threshold must be at least 1".to_string()));
        }
        Ok(Self {
            config,
            store,
            lock: Mutex::new(()),
        })
    }

    /// breaker with default thresholds and in-memory state
    pub fn in_memory() -> Self {
        Self {
            config: BreakerConfig::default(),
            store: Box::new(MemoryBreakerStore::new()),
            lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    fn window(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.reset_after).unwrap_or(TimeDelta::MAX)
    }

    fn expired(&self, state: &BreakerState, now: DateTime<Utc>) -> bool {
        match state.last_failure_at {
            Some(last) => now.signed_duration_since(last) >= self.window(),
            None => false,
        }
    }

    /// current persisted state
    pub fn state(&self) -> BreakerResult<BreakerState> {
        self.store.load()
    }

    pub fn is_open(&self) -> BreakerResult<bool> {
        self.is_open_at(Utc::now())
    }

    /// Whether automatic operations should skip at `now`.
    ///
    /// An open breaker whose last failure is older than the window is reset
    /// here.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> BreakerResult<bool> {
        let _guard = self.lock.lock();
        let state = self.store.load()?;
        if state.consecutive_failures < self.config.threshold {
            return Ok(false);
        }
        if self.expired(&state, now) {
            self.store.save(&BreakerState::default())?;
            tracing::info!(
                failures = state.consecutive_failures,
                "circuit breaker reset after quiet period"
            );
            return Ok(false);
        }
        Ok(true)
    }

    pub fn record_failure(&self, operation: &str) -> BreakerResult<BreakerState> {
        self.record_failure_at(operation, Utc::now())
    }

    /// Count one failure of an automatic operation.
    pub fn record_failure_at(&self, operation: &str, now: DateTime<Utc>) -> BreakerResult<BreakerState> {
        let _guard = self.lock.lock();
        let mut state = self.store.load()?;
        if self.expired(&state, now) {
            state = BreakerState::default();
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_at = Some(now);
        state.last_failed_operation = Some(operation.to_string());

        if state.consecutive_failures == self.config.threshold {
            state.opened_at = Some(now);
            tracing::warn!(
                operation,
                failures = state.consecutive_failures,
                "circuit breaker opened"
            );
        } else {
            tracing::debug!(
                operation,
                failures = state.consecutive_failures,
                threshold = self.config.threshold,
                "circuit breaker recorded failure"
            );
        }

        self.store.save(&state)?;
        Ok(state)
    }

    /// A successful automatic operation closes the breaker.
    pub fn record_success(&self) -> BreakerResult<()> {
        let _guard = self.lock.lock();
        let state = self.store.load()?;
        if state == BreakerState::default() {
            return Ok(());
        }
        self.store.save(&BreakerState::default())?;
        if state.consecutive_failures >= self.config.threshold {
            tracing::info!("circuit breaker closed after successful operation");
        }
        Ok(())
    }

    /// Manual reset.
    pub fn reset(&self) -> BreakerResult<()> {
        let _guard = self.lock.lock();
        self.store.save(&BreakerState::default())?;
        tracing::info!("circuit breaker reset manually");
        Ok(())
    }

    pub fn status(&self) -> BreakerResult<String> {
        self.status_at(Utc::now())
    }

    /// Human-readable breaker status.
    pub fn status_at(&self, now: DateTime<Utc>) -> BreakerResult<String> {
        let state = self.store.load()?;
        let threshold = self.config.threshold;

        if state.consecutive_failures == 0 {
            return Ok(format!("closed (0/{} failures)", threshold));
        }

        let last = match (&state.last_failed_operation, state.last_failure_at) {
            (Some(op), Some(at)) => format!("last: {} at {}", op, at.to_rfc3339()),
            (Some(op), None) => format!("last: {}", op),
            _ => "last: unknown".to_string(),
        };

        if state.consecutive_failures < threshold || self.expired(&state, now) {
            return Ok(format!(
                "closed ({}/{} failures, {})",
                state.consecutive_failures, threshold, last
            ));
        }

        let since = state.opened_at.or(state.last_failure_at);
        let mut status = format!(
            "open after {} consecutive failures ({})",
            state.consecutive_failures, last
        );
        if let Some(since) = since {
            status.push_str(&format!(", since {}", since.to_rfc3339()));
        }
        if let Some(last_at) = state.last_failure_at {
            if let Some(reset_at) = last_at.checked_add_signed(self.window()) {
                status.push_str(&format!(", auto-reset at {}", reset_at.to_rfc3339()));
            }
        }
        Ok(status)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .finish()
    }
}
