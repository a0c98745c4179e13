//! Public, broker-agnostic delivery configuration.
//!
//! Option names follow the camelCase spelling used by host configuration
//! files (`maxAttempts`, `pollTimeoutMs`, ...). Durations are stored in
//! milliseconds and exposed as [`Duration`] through accessors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{BackoffConfig, CircuitBreakerConfig, DeliveryError, Result};

/// Delivery configuration.
///
/// # Example
///
/// ```
/// use mom_delivery::DeliveryConfig;
/// use std::time::Duration;
///
/// let config = DeliveryConfig::default()
///     .with_max_attempts(7)
///     .with_poll_timeout(Duration::from_millis(250));
///
/// assert_eq!(config.max_attempts, 7);
/// assert_eq!(config.max_handler_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryConfig {
    // ---
    /// Total send attempts per message before it is reported exhausted.
    pub max_attempts: u32,

    /// Upper bound on a single fetch wait.
    pub poll_timeout_ms: u64,

    /// Handler retries after the first failed invocation before the message
    /// is dead-lettered.
    pub max_handler_retries: u32,

    /// Time the publisher waits for in-flight attempts at shutdown.
    pub shutdown_grace_ms: u64,

    /// Number of publisher workers. Messages are routed to a fixed worker by
    /// partition hint or key, so this also bounds publish parallelism.
    pub publisher_workers: usize,

    /// Queue depth per publisher worker.
    pub queue_capacity: usize,

    /// Maximum records returned by one fetch.
    pub fetch_max_messages: usize,

    /// Pause between handler retries.
    pub handler_retry_delay_ms: u64,

    /// Send retry backoff.
    pub backoff: BackoffConfig,

    /// Circuit breaker settings; `None` disables the breaker.
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Dead-letter topic; defaults to `<topic>.dlt`.
    pub quarantine_topic: Option<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        // ---
        Self {
            max_attempts: 5,
            poll_timeout_ms: 1_000,
            max_handler_retries: 3,
            shutdown_grace_ms: 10_000,
            publisher_workers: 4,
            queue_capacity: 1_024,
            fetch_max_messages: 100,
            handler_retry_delay_ms: 100,
            backoff: BackoffConfig::default(),
            circuit_breaker: Some(CircuitBreakerConfig::default()),
            quarantine_topic: None,
        }
    }
}

impl DeliveryConfig {
    // ---
    /// Parse a JSON document; missing options take their defaults.
    ///
    /// ```
    /// # use mom_delivery::DeliveryConfig;
    /// let config = DeliveryConfig::from_json(r#"{ "maxAttempts": 2, "pollTimeoutMs": 50 }"#)?;
    /// assert_eq!(config.max_attempts, 2);
    /// assert_eq!(config.shutdown_grace_ms, 10_000);
    /// # Ok::<(), mom_delivery::DeliveryError>(())
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        // ---
        let config: Self = serde_json::from_str(json)
            .map_err(|err| DeliveryError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the delivery core cannot run with.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.max_attempts == 0 {
            return Err(DeliveryError::Config("maxAttempts must be at least 1".into()));
        }
        if self.publisher_workers == 0 {
            return Err(DeliveryError::Config(
                "publisherWorkers must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(DeliveryError::Config("queueCapacity must be at least 1".into()));
        }
        if self.fetch_max_messages == 0 {
            return Err(DeliveryError::Config(
                "fetchMaxMessages must be at least 1".into(),
            ));
        }
        if self.backoff.multiplier.is_nan() || self.backoff.multiplier < 1.0 {
            return Err(DeliveryError::Config(
                "backoff.multiplier must be >= 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(DeliveryError::Config(
                "backoff.jitter must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn handler_retry_delay(&self) -> Duration {
        Duration::from_millis(self.handler_retry_delay_ms)
    }

    /// Set the total send attempts per message.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the fetch wait bound.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set handler retries before dead-lettering.
    pub fn with_max_handler_retries(mut self, retries: u32) -> Self {
        self.max_handler_retries = retries;
        self
    }

    /// Set the shutdown drain period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_publisher_workers(mut self, workers: usize) -> Self {
        self.publisher_workers = workers;
        self
    }

    pub fn with_handler_retry_delay(mut self, delay: Duration) -> Self {
        self.handler_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Replace the send backoff settings.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace or disable (`None`) the circuit breaker.
    pub fn with_circuit_breaker(mut self, breaker: Option<CircuitBreakerConfig>) -> Self {
        self.circuit_breaker = breaker;
        self
    }

    /// Route dead letters to `topic` instead of `<topic>.dlt`.
    pub fn with_quarantine_topic(mut self, topic: impl Into<String>) -> Self {
        self.quarantine_topic = Some(topic.into());
        self
    }
}
