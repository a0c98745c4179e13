//! Delivery metrics.
//!
//! Counters and the lag gauge live on a registry owned by the
//! [`DeliveryMetrics`] instance rather than the process-global default
//! registry, so independent publishers and consumers (and parallel tests)
//! never collide. Hosts that already run a registry pass it to
//! [`DeliveryMetrics::with_registry`].

use prometheus::{Encoder, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::{DeliveryError, Result};

/// Metrics emitted by the delivery core.
///
/// Cheap to clone; clones update the same series.
#[derive(Clone)]
pub struct DeliveryMetrics {
    // ---
    registry: Registry,

    /// Messages acknowledged by the broker.
    pub messages_published: IntCounter,
    /// Handler invocations that returned successfully.
    pub messages_delivered: IntCounter,
    /// Send attempts scheduled after a transient failure.
    pub delivery_retries: IntCounter,
    /// Dead-letter records acknowledged by the quarantine topic.
    pub dead_lettered: IntCounter,
    /// `latest broker offset - committed offset`, per partition.
    pub consumer_lag: IntGaugeVec,
}

fn to_config_error(err: prometheus::Error) -> DeliveryError {
    DeliveryError::Config(format!("metrics registration failed: {err}"))
}

impl DeliveryMetrics {
    // ---
    /// Create metrics on a fresh private registry.
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered on `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Config`] if the registry already holds series
    /// with the same names.
    pub fn with_registry(registry: Registry) -> Result<Self> {
        // ---
        let messages_published = IntCounter::with_opts(Opts::new(
            "messages_published",
            "Messages acknowledged by the broker",
        ))
        .map_err(to_config_error)?;
        let messages_delivered = IntCounter::with_opts(Opts::new(
            "messages_delivered",
            "Messages handled successfully by the consumer handler",
        ))
        .map_err(to_config_error)?;
        let delivery_retries = IntCounter::with_opts(Opts::new(
            "delivery_retries",
            "Send retries after transient failures",
        ))
        .map_err(to_config_error)?;
        let dead_lettered = IntCounter::with_opts(Opts::new(
            "dead_lettered",
            "Messages routed to the quarantine topic",
        ))
        .map_err(to_config_error)?;
        let consumer_lag = IntGaugeVec::new(
            Opts::new(
                "consumer_lag",
                "Latest broker offset minus committed offset",
            ),
            &["partition"],
        )
        .map_err(to_config_error)?;

        registry
            .register(Box::new(messages_published.clone()))
            .map_err(to_config_error)?;
        registry
            .register(Box::new(messages_delivered.clone()))
            .map_err(to_config_error)?;
        registry
            .register(Box::new(delivery_retries.clone()))
            .map_err(to_config_error)?;
        registry
            .register(Box::new(dead_lettered.clone()))
            .map_err(to_config_error)?;
        registry
            .register(Box::new(consumer_lag.clone()))
            .map_err(to_config_error)?;

        Ok(Self {
            registry,
            messages_published,
            messages_delivered,
            delivery_retries,
            dead_lettered,
            consumer_lag,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the lag of `partition`.
    pub fn set_consumer_lag(&self, partition: u32, lag: i64) {
        // ---
        let label = partition.to_string();
        self.consumer_lag
            .with_label_values(&[label.as_str()])
            .set(lag);
    }

    /// Current lag of `partition` (0 if never recorded).
    pub fn consumer_lag(&self, partition: u32) -> i64 {
        // ---
        let label = partition.to_string();
        self.consumer_lag
            .with_label_values(&[label.as_str()])
            .get()
    }

    /// Render all series in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        // ---
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(to_config_error)?;
        String::from_utf8(buffer).map_err(|err| DeliveryError::Permanent(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_instances_are_isolated() {
        // ---
        let a = DeliveryMetrics::new().unwrap();
        let b = DeliveryMetrics::new().unwrap();

        a.messages_published.inc();
        assert_eq!(a.messages_published.get(), 1);
        assert_eq!(b.messages_published.get(), 0);
    }

    #[test]
    fn test_duplicate_registration_is_config_error() {
        // ---
        let registry = Registry::new();
        let _first = DeliveryMetrics::with_registry(registry.clone()).unwrap();
        let second = DeliveryMetrics::with_registry(registry);
        assert!(matches!(second, Err(DeliveryError::Config(_))));
    }

    #[test]
    fn test_encode_contains_series() {
        // ---
        let metrics = DeliveryMetrics::new().unwrap();
        metrics.dead_lettered.inc();
        metrics.set_consumer_lag(2, 7);

        let text = metrics.encode().unwrap();
        assert!(text.contains("dead_lettered 1"));
        assert!(text.contains("consumer_lag{partition=\"2\"} 7"));
        assert_eq!(metrics.consumer_lag(2), 7);
    }
}
