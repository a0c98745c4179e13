//! Backoff configuration and delay computation.
//!
//! This module provides [`BackoffConfig`] and the delay schedule used by the
//! [`RetryingPublisher`](crate::RetryingPublisher) between attempts that
//! failed with a [`Transient`](crate::DeliveryError::Transient) error.
//!
//! # Retry Strategy
//!
//! - Exponential growth: `initial_delay * multiplier^(retry - 1)`
//! - Capped at `max_delay`
//! - Randomized jitter of `±jitter` (fraction) to prevent thundering herd
//! - The cap holds after jitter is applied

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff settings.
///
/// Durations are expressed in milliseconds so the struct can be loaded from
/// configuration files directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay_ms: u64,

    /// Multiplier applied to the delay after each retry.
    ///
    /// Example: 2.0 doubles the delay each time (exponential backoff).
    pub multiplier: f64,

    /// Maximum delay between attempts (caps exponential growth).
    pub max_delay_ms: u64,

    /// Jitter as a fraction of the delay; 0.2 means ±20%.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    /// - `initial_delay_ms`: 100
    /// - `multiplier`: 2.0
    /// - `max_delay_ms`: 30000
    /// - `jitter`: 0.2
    fn default() -> Self {
        // ---
        Self {
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    // ---
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn base_delay(&self, retry: u32) -> Duration {
        // ---
        let exponent = retry.saturating_sub(1).min(64) as i32;
        let nanos = self.initial_delay().as_nanos() as f64 * self.multiplier.powi(exponent);
        let max = self.max_delay();

        if !nanos.is_finite() || nanos >= max.as_nanos() as f64 {
            max
        } else {
            Duration::from_nanos(nanos.max(0.0).round() as u64)
        }
    }

    /// Jittered delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        // ---
        apply_jitter(self.base_delay(retry), self.jitter).min(self.max_delay())
    }
}

/// Apply `±fraction` jitter to a duration.
///
/// Uses a multiplicative jitter: `delay * (1 - fraction + random(0.0..2*fraction))`
pub(crate) fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    // ---
    let fraction = fraction.clamp(0.0, 1.0);
    if fraction == 0.0 {
        return delay;
    }

    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    // Convert to 0.0..=1.0 range
    let random_factor = (hash % 1001) as f64 / 1000.0;

    let jitter_multiplier = (1.0 - fraction) + random_factor * 2.0 * fraction;

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}
