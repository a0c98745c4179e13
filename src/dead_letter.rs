//! Dead-letter routing.
//!
//! Messages whose handler keeps failing are wrapped in a
//! [`DeadLetterRecord`] and published to a quarantine topic through the
//! [`RetryingPublisher`]. Routing is best-effort and never blocks the
//! consumption loop: the publish runs on its own task and a failure is
//! only logged.
//!
//! The source offset becomes committable as soon as the quarantine task is
//! spawned. If that publish then fails (retries exhausted, publisher shut
//! down), the message is in neither the source partition's uncommitted range
//! nor the dead-letter topic; the `log_error!` line naming its
//! `topic/partition@offset` is the only trace left of it.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{
    // ---
    log_debug,
    log_error,
    DeliveryError,
    DeliveryMetrics,
    ErrorKind,
    Message,
    Record,
    Result,
    RetryingPublisher,
    Topic,
};

/// Header naming the topic the quarantined message was consumed from.
pub const DLT_SOURCE_TOPIC_HEADER: &str = "dlt-source-topic";
/// Header carrying `partition@offset` of the quarantined message.
pub const DLT_SOURCE_POSITION_HEADER: &str = "dlt-source-position";
/// Header carrying the failure kind.
pub const DLT_REASON_HEADER: &str = "dlt-reason";

/// A quarantined message and why it was quarantined.
///
/// Travels as JSON in the value of the quarantine message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original: Message,
    pub failure_reason: ErrorKind,
    /// Last error reported by the handler.
    pub detail: String,
    /// Failed handler invocations.
    pub attempts: u32,
    pub quarantined_at: SystemTime,
    pub source_topic: Topic,
    pub source_partition: u32,
    pub source_offset: i64,
}

impl DeadLetterRecord {
    // ---
    /// Build a record for `record`, which failed `attempts` times with `error`.
    pub fn new(record: &Record, error: &DeliveryError, attempts: u32) -> Self {
        // ---
        Self {
            original: record.message.clone(),
            failure_reason: error.kind(),
            detail: error.to_string(),
            attempts,
            quarantined_at: SystemTime::now(),
            source_topic: record.topic.clone(),
            source_partition: record.partition,
            source_offset: record.offset,
        }
    }

    /// Wrap this record into a quarantine message.
    ///
    /// The original key is preserved so quarantine partitioning follows the
    /// source key.
    pub fn encode(&self) -> Result<Message> {
        // ---
        let value = serde_json::to_vec(self)?;
        let mut message = Message::new(value)
            .with_header(DLT_SOURCE_TOPIC_HEADER, self.source_topic.as_str().to_owned())
            .with_header(
                DLT_SOURCE_POSITION_HEADER,
                format!("{}@{}", self.source_partition, self.source_offset),
            )
            .with_header(DLT_REASON_HEADER, format!("{:?}", self.failure_reason));

        if let Some(key) = self.original.key() {
            message = message.with_key(key.clone());
        }
        Ok(message)
    }

    /// Recover a record from a quarantine message.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Permanent`] if the value is not a
    /// dead-letter record.
    pub fn decode(message: &Message) -> Result<Self> {
        Ok(serde_json::from_slice(message.value())?)
    }
}

/// Publishes dead-letter records to the quarantine topic.
#[derive(Clone)]
pub struct DeadLetterRouter {
    // ---
    publisher: RetryingPublisher,
    topic: Topic,
    metrics: DeliveryMetrics,
}

impl DeadLetterRouter {
    // ---
    pub fn new(publisher: RetryingPublisher, topic: Topic, metrics: DeliveryMetrics) -> Self {
        Self {
            publisher,
            topic,
            metrics,
        }
    }

    /// Default quarantine topic for `source`: `<source>.dlt`.
    pub fn default_topic(source: &Topic) -> Topic {
        Topic::from(format!("{source}.dlt"))
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Route `record` to the quarantine topic.
    ///
    /// Returns immediately; the returned handle completes once the publish
    /// reached a terminal outcome. Awaiting it is optional.
    pub fn quarantine(&self, record: &Record, error: &DeliveryError, attempts: u32) -> JoinHandle<()> {
        // ---
        let dead_letter = DeadLetterRecord::new(record, error, attempts);
        let router = self.clone();

        tokio::spawn(async move {
            // ---
            let source = format!(
                "{}/{}@{}",
                dead_letter.source_topic, dead_letter.source_partition, dead_letter.source_offset
            );

            let message = match dead_letter.encode() {
                Ok(message) => message,
                Err(err) => {
                    log_error!("cannot encode dead letter for {source}: {err}");
                    return;
                }
            };

            match router.publisher.publish_to(router.topic.clone(), message).await {
                Ok(_ack) => {
                    router.metrics.dead_lettered.inc();
                    log_debug!(
                        "{source} quarantined at {}/{}@{}",
                        _ack.topic,
                        _ack.partition,
                        _ack.offset
                    );
                }
                Err(err) => {
                    log_error!("failed to quarantine {source} to {}: {err}", router.topic);
                }
            }
        })
    }
}
