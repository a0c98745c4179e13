//! Circuit breaker shared by the publisher workers.
//!
//! Consecutive transient send failures open the circuit. While it is open,
//! workers hold back instead of hammering an unavailable broker. After
//! `reset_timeout` the circuit is half-open: the next send goes through and
//! either closes it (success) or re-opens it (failure).
//!
//! Waiting on an open circuit does not consume a delivery attempt; only
//! calls that reach the broker count against `max_attempts`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::lock::lock_ignore_poison;
use crate::{log_info, log_warn};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures before the circuit opens.
    pub failure_threshold: u32,

    /// How long the circuit stays open before a probe is allowed.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        // ---
        Self {
            failure_threshold: 10,
            reset_timeout_ms: 5_000,
        }
    }
}

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Too many failures; sends are held back.
    Open,
    /// Reset timeout elapsed; the next send probes the broker.
    HalfOpen,
}

struct Inner {
    // ---
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

pub(crate) struct CircuitBreaker {
    // ---
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    // ---
    pub(crate) fn new(config: CircuitBreakerConfig) -> Self {
        // ---
        Self {
            config,
            inner: Mutex::new(Inner {
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.config.reset_timeout_ms)
    }

    pub(crate) fn state(&self) -> CircuitState {
        // ---
        let inner = lock_ignore_poison(&self.inner);
        match inner.opened_at {
            None => CircuitState::Closed,
            Some(at) if at.elapsed() >= self.reset_timeout() => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }

    /// Time left until the circuit admits a probe, `None` if sends may
    /// proceed now.
    pub(crate) fn open_for(&self) -> Option<Duration> {
        // ---
        let inner = lock_ignore_poison(&self.inner);
        let opened_at = inner.opened_at?;
        self.reset_timeout()
            .checked_sub(opened_at.elapsed())
            .filter(|left| !left.is_zero())
    }

    /// Suspend until the circuit admits a send.
    pub(crate) async fn admit(&self) {
        // ---
        while let Some(left) = self.open_for() {
            tokio::time::sleep(left).await;
        }
    }

    pub(crate) fn record_success(&self) {
        // ---
        let mut inner = lock_ignore_poison(&self.inner);
        if inner.opened_at.take().is_some() {
            log_info!("circuit breaker closed after successful probe");
        }
        inner.consecutive_failures = 0;
    }

    pub(crate) fn record_failure(&self) {
        // ---
        let mut inner = lock_ignore_poison(&self.inner);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let half_open = inner
            .opened_at
            .is_some_and(|at| at.elapsed() >= self.reset_timeout());

        if half_open {
            // Failed probe
            inner.opened_at = Some(Instant::now());
            log_warn!("circuit breaker probe failed, re-opening");
        } else if inner.opened_at.is_none()
            && inner.consecutive_failures >= self.config.failure_threshold.max(1)
        {
            inner.opened_at = Some(Instant::now());
            log_warn!(
                "circuit breaker opened after {} consecutive failures",
                inner.consecutive_failures
            );
        }
    }
}
