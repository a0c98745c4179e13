//! At-least-once message delivery core.
//!
//! This crate sits between application code and a partitioned message
//! broker. It makes publishing survive transient broker failures and makes
//! consumption commit offsets only once messages are really handled:
//!
//! - [`RetryingPublisher`] sends with bounded retry, exponential backoff and
//!   a circuit breaker, preserving per-key order
//! - [`DeliveryTracker`] owns every in-flight send until its terminal outcome
//! - [`Consumer`] runs one consumption loop per partition, committing through
//!   an [`OffsetCommitCoordinator`]
//! - [`DeadLetterRouter`] quarantines messages whose handler keeps failing
//!
//! The broker itself is reached through the [`Broker`] trait.
//! [`MemoryBroker`] is the in-process implementation used by tests and demos.
//!
//! ## Example
//!
//! ```
//! use mom_delivery::{
//!     handler_fn, ConsumerBuilder, CountdownLatch, DeliveryConfig, DeliveryMetrics,
//!     MemoryBroker, Message, RetryingPublisher, Topic,
//! };
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> mom_delivery::Result<()> {
//! let broker = MemoryBroker::new();
//! let topic = Topic::from("helloworld.t");
//! let latch = CountdownLatch::new(1);
//!
//! let received = latch.clone();
//! let consumer = ConsumerBuilder::new(broker.clone(), topic.clone())
//!     .handler(handler_fn(move |record| {
//!         let received = received.clone();
//!         async move {
//!             assert_eq!(record.message.value_str(), Some("Hello Spring Kafka!"));
//!             received.count_down();
//!             Ok(())
//!         }
//!     }))
//!     .build()?;
//! let running = consumer.start(CancellationToken::new()).await?;
//!
//! let publisher = RetryingPublisher::new(
//!     broker.clone(),
//!     topic,
//!     DeliveryConfig::default(),
//!     DeliveryMetrics::new()?,
//! )?;
//! publisher.publish(Message::new("Hello Spring Kafka!")).await?;
//!
//! assert_eq!(latch.wait_timeout(Duration::from_millis(10_000)).await, 0);
//!
//! running.shutdown().await;
//! publisher.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod macros;
#[allow(unused_imports)]
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

mod lock;

mod broker;
mod circuit;
mod config;
mod consumer;
mod dead_letter;
mod domain;
mod error;
mod latch;
mod metrics;
mod offsets;
mod publisher;
mod retry;
mod tracker;

// --- public re-exports
pub use domain::{
    //
    Ack,
    Broker,
    BrokerPtr,
    Message,
    Record,
    Topic,
    MESSAGE_ID_HEADER,
};

pub use broker::MemoryBroker;

pub use circuit::{CircuitBreakerConfig, CircuitState};
pub use config::DeliveryConfig;
pub use error::{DeliveryError, ErrorKind, Result};
pub use metrics::DeliveryMetrics;
pub use retry::BackoffConfig;

pub use publisher::{RetryingPublisher, ShutdownReport};
pub use tracker::{AttemptHandle, DeliveryAttempt, DeliveryTracker, FailureOutcome, PendingAck};

pub use consumer::{
    //
    handler_fn,
    Consumer,
    ConsumerBuilder,
    ConsumerHandle,
    ConsumptionCursor,
    Deduplicate,
    FnHandler,
    HandlerPtr,
    LoopState,
    MessageHandler,
};
pub use offsets::{OffsetCommitCoordinator, PartitionOffset, NO_OFFSET};

pub use dead_letter::{
    //
    DeadLetterRecord,
    DeadLetterRouter,
    DLT_REASON_HEADER,
    DLT_SOURCE_POSITION_HEADER,
    DLT_SOURCE_TOPIC_HEADER,
};

pub use latch::CountdownLatch;
