//! Consumer supervisor.
//!
//! A [`Consumer`] runs one consumption loop per partition of its topic and
//! stops them all through a shared [`CancellationToken`]. Handler failures
//! are routed to a [`DeadLetterRouter`]; when none is supplied the consumer
//! creates its own publisher on the same broker for the quarantine topic.

mod dedup;
mod handler;
mod partition;

pub use dedup::Deduplicate;
pub use handler::{handler_fn, FnHandler, HandlerPtr, MessageHandler};
pub use partition::{ConsumptionCursor, LoopState};

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use partition::ConsumptionLoop;

use crate::{
    // ---
    log_error,
    log_info,
    BrokerPtr,
    DeadLetterRouter,
    DeliveryConfig,
    DeliveryError,
    DeliveryMetrics,
    Result,
    RetryingPublisher,
    Topic,
};

/// Builder for [`Consumer`].
///
/// # Example
///
/// ```
/// use mom_delivery::{handler_fn, ConsumerBuilder, DeliveryConfig, MemoryBroker};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> mom_delivery::Result<()> {
/// let broker = MemoryBroker::new();
///
/// let consumer = ConsumerBuilder::new(broker.clone(), "helloworld.t")
///     .handler(handler_fn(|record| async move {
///         println!("received {:?}", record.message.value_str());
///         Ok(())
///     }))
///     .config(DeliveryConfig::default().with_max_handler_retries(1))
///     .build()?;
///
/// let running = consumer.start(CancellationToken::new()).await?;
/// running.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ConsumerBuilder {
    // ---
    broker: BrokerPtr,
    topic: Topic,
    handler: Option<HandlerPtr>,
    config: DeliveryConfig,
    metrics: Option<DeliveryMetrics>,
    dead_letter_publisher: Option<RetryingPublisher>,
    partitions: Option<Vec<u32>>,
}

impl ConsumerBuilder {
    // ---
    pub fn new(broker: BrokerPtr, topic: impl Into<Topic>) -> Self {
        // ---
        Self {
            broker,
            topic: topic.into(),
            handler: None,
            config: DeliveryConfig::default(),
            metrics: None,
            dead_letter_publisher: None,
            partitions: None,
        }
    }

    /// Set the record handler (required).
    pub fn handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Delivery configuration. Default: [`DeliveryConfig::default`].
    pub fn config(mut self, config: DeliveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Metrics to update. Default: a fresh private registry.
    pub fn metrics(mut self, metrics: DeliveryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Publish dead letters through `publisher` instead of a consumer-owned
    /// one. The consumer never shuts a supplied publisher down.
    pub fn dead_letter_publisher(mut self, publisher: RetryingPublisher) -> Self {
        self.dead_letter_publisher = Some(publisher);
        self
    }

    /// Consume only `partitions`. Default: every partition of the topic.
    pub fn partitions(mut self, partitions: impl IntoIterator<Item = u32>) -> Self {
        self.partitions = Some(partitions.into_iter().collect());
        self
    }

    /// Build the consumer (consumes self).
    ///
    /// Must be called from within a tokio runtime when no dead-letter
    /// publisher was supplied.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Config`] if no handler was set or the
    /// configuration is invalid.
    pub fn build(self) -> Result<Consumer> {
        // ---
        self.config.validate()?;

        let handler = self
            .handler
            .ok_or_else(|| DeliveryError::Config("consumer requires a handler".into()))?;

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => DeliveryMetrics::new()?,
        };

        let quarantine_topic = match &self.config.quarantine_topic {
            Some(topic) => Topic::from(topic.as_str()),
            None => DeadLetterRouter::default_topic(&self.topic),
        };

        let (publisher, owned_publisher) = match self.dead_letter_publisher {
            Some(publisher) => (publisher, None),
            None => {
                let publisher = RetryingPublisher::new(
                    self.broker.clone(),
                    quarantine_topic.clone(),
                    self.config.clone(),
                    metrics.clone(),
                )?;
                (publisher.clone(), Some(publisher))
            }
        };

        Ok(Consumer {
            broker: self.broker,
            topic: self.topic,
            handler,
            dead_letter: DeadLetterRouter::new(publisher, quarantine_topic, metrics.clone()),
            owned_publisher,
            config: self.config,
            metrics,
            partitions: self.partitions,
        })
    }
}

/// A configured, not yet running consumer.
pub struct Consumer {
    // ---
    broker: BrokerPtr,
    topic: Topic,
    handler: HandlerPtr,
    dead_letter: DeadLetterRouter,
    owned_publisher: Option<RetryingPublisher>,
    config: DeliveryConfig,
    metrics: DeliveryMetrics,
    partitions: Option<Vec<u32>>,
}

impl Consumer {
    // ---
    pub fn builder(broker: BrokerPtr, topic: impl Into<Topic>) -> ConsumerBuilder {
        ConsumerBuilder::new(broker, topic)
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn metrics(&self) -> &DeliveryMetrics {
        &self.metrics
    }

    /// Connect to the broker and spawn one consumption loop per partition.
    ///
    /// Loops stop when `cancel` fires or [`ConsumerHandle::shutdown`] is
    /// called.
    pub async fn start(self, cancel: CancellationToken) -> Result<ConsumerHandle> {
        // ---
        self.broker.connect().await?;

        let partitions = match self.partitions {
            Some(partitions) => partitions,
            None => (0..self.broker.partitions(&self.topic).await?).collect(),
        };

        let mut tasks = BTreeMap::new();
        let mut states = BTreeMap::new();

        for partition in partitions {
            let (consumption, state) = ConsumptionLoop::new(
                self.broker.clone(),
                self.topic.clone(),
                partition,
                self.handler.clone(),
                self.dead_letter.clone(),
                self.config.clone(),
                self.metrics.clone(),
                cancel.clone(),
            );
            tasks.insert(partition, tokio::spawn(consumption.run()));
            states.insert(partition, state);
        }

        log_info!(
            "consumer for {} started on {} partitions",
            self.topic,
            tasks.len()
        );

        Ok(ConsumerHandle {
            topic: self.topic,
            cancel,
            tasks,
            states,
            owned_publisher: self.owned_publisher,
            metrics: self.metrics,
        })
    }
}

/// Running consumer.
pub struct ConsumerHandle {
    // ---
    topic: Topic,
    cancel: CancellationToken,
    tasks: BTreeMap<u32, JoinHandle<ConsumptionCursor>>,
    states: BTreeMap<u32, watch::Receiver<LoopState>>,
    owned_publisher: Option<RetryingPublisher>,
    metrics: DeliveryMetrics,
}

impl ConsumerHandle {
    // ---
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn partitions(&self) -> Vec<u32> {
        self.states.keys().copied().collect()
    }

    /// Current state of the loop consuming `partition`.
    pub fn state(&self, partition: u32) -> Option<LoopState> {
        self.states.get(&partition).map(|state| *state.borrow())
    }

    /// Subscribe to state changes of the loop consuming `partition`.
    pub fn watch_state(&self, partition: u32) -> Option<watch::Receiver<LoopState>> {
        self.states.get(&partition).cloned()
    }

    pub fn metrics(&self) -> &DeliveryMetrics {
        &self.metrics
    }

    /// Stop every loop at its next checkpoint and wait for them to finish.
    ///
    /// A consumer-owned dead-letter publisher is then drained within the
    /// configured grace period. Returns the final cursor of each partition.
    pub async fn shutdown(self) -> BTreeMap<u32, ConsumptionCursor> {
        // ---
        self.cancel.cancel();

        let (partitions, tasks): (Vec<u32>, Vec<_>) = self.tasks.into_iter().unzip();
        let results = futures::future::join_all(tasks).await;

        let mut cursors = BTreeMap::new();
        for (partition, result) in partitions.into_iter().zip(results) {
            match result {
                Ok(cursor) => {
                    cursors.insert(partition, cursor);
                }
                Err(_err) => {
                    log_error!(
                        "consumption loop for {}/{partition} ended abnormally: {_err}",
                        self.topic
                    );
                }
            }
        }

        if let Some(publisher) = self.owned_publisher {
            publisher.shutdown().await;
        }

        log_info!("consumer for {} shut down", self.topic);
        cursors
    }
}
