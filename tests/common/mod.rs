// tests/common/mod.rs

#![allow(dead_code)]

use std::time::Duration;

use mom_delivery::{BackoffConfig, DeliveryConfig};

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}

/// Short timeouts and backoff so failure paths finish quickly.
pub fn fast_config() -> DeliveryConfig {
    // ---
    DeliveryConfig::default()
        .with_poll_timeout(Duration::from_millis(20))
        .with_handler_retry_delay(Duration::from_millis(1))
        .with_shutdown_grace(Duration::from_secs(2))
        .with_backoff(BackoffConfig {
            initial_delay_ms: 1,
            max_delay_ms: 10,
            ..BackoffConfig::default()
        })
        .with_circuit_breaker(None)
}

/// Poll `condition` every 5ms until it holds; panics after 10s.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    // ---
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}
