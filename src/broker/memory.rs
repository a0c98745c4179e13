// src/broker/memory.rs

//! In-memory broker.
//!
//! A pure in-process implementation of the [`Broker`] trait. It is intended
//! for tests, local execution, and as the reference for broker semantics.
//!
//! ## Reference Semantics
//!
//! - Each topic has a fixed number of append-only partitions.
//! - `send()` assigns the next offset in the routed partition.
//! - `fetch()` blocks until data is available or the timeout elapses.
//! - Committed offsets are kept per topic and partition.
//!
//! ## Fault injection
//!
//! Send and commit failures can be scripted so that retry, circuit breaking
//! and commit recovery paths can be exercised deterministically. Call
//! counters record how often each primitive was invoked.
//!
//! ## Non-Goals
//!
//! Persistence, replication, consumer groups and retention.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::lock::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    Ack,
    Broker,
    DeliveryError,
    Message,
    Record,
    Result,
    Topic,
};

/// Append-only log of a single topic.
struct TopicLog {
    // ---
    partitions: Vec<Vec<Record>>,
    committed: Vec<Option<i64>>,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        // ---
        let n = partitions.max(1) as usize;
        Self {
            partitions: vec![Vec::new(); n],
            committed: vec![None; n],
        }
    }
}

/// Scripted failures.
#[derive(Default)]
struct Faults {
    // ---
    /// Errors returned by the next sends, consumed front to back.
    send_script: VecDeque<DeliveryError>,
    /// Error returned by every send once the script is empty.
    send_always: Option<DeliveryError>,
    /// Number of upcoming commits that fail transiently.
    failing_commits: u32,
}

/// In-memory broker.
///
/// Topics are created on first use with the default partition count, or
/// explicitly through [`create_topic`](Self::create_topic).
///
/// ```
/// # use mom_delivery::{Broker, MemoryBroker, Message, Topic};
/// # use std::time::Duration;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> mom_delivery::Result<()> {
/// let broker = MemoryBroker::new();
/// let topic = Topic::from("helloworld.t");
///
/// let ack = broker.send(&topic, Message::new("hi")).await?;
/// let batch = broker
///     .fetch(&topic, ack.partition, ack.offset, 10, Duration::from_millis(10))
///     .await?;
///
/// assert_eq!(batch[0].message.value_str(), Some("hi"));
/// # Ok(())
/// # }
/// ```
pub struct MemoryBroker {
    // ---
    topics: Mutex<HashMap<Topic, TopicLog>>,
    faults: Mutex<Faults>,
    appended: Notify,
    default_partitions: u32,
    max_message_bytes: Option<usize>,
    round_robin: AtomicUsize,
    send_calls: AtomicU64,
    commit_calls: AtomicU64,
}

impl MemoryBroker {
    // ---
    /// Create a broker whose topics have a single partition by default.
    pub fn new() -> Arc<Self> {
        Self::with_partitions(1)
    }

    /// Create a broker whose auto-created topics have `partitions` partitions.
    pub fn with_partitions(partitions: u32) -> Arc<Self> {
        // ---
        Arc::new(Self::build(partitions, None))
    }

    /// Create a broker that rejects messages larger than `max_bytes` with a
    /// permanent error.
    pub fn with_max_message_bytes(partitions: u32, max_bytes: usize) -> Arc<Self> {
        // ---
        Arc::new(Self::build(partitions, Some(max_bytes)))
    }

    fn build(default_partitions: u32, max_message_bytes: Option<usize>) -> Self {
        // ---
        Self {
            topics: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            appended: Notify::new(),
            default_partitions: default_partitions.max(1),
            max_message_bytes,
            round_robin: AtomicUsize::new(0),
            send_calls: AtomicU64::new(0),
            commit_calls: AtomicU64::new(0),
        }
    }

    /// Create `topic` with an explicit partition count.
    ///
    /// No-op if the topic already exists.
    pub fn create_topic(&self, topic: impl Into<Topic>, partitions: u32) {
        // ---
        let mut topics = lock_ignore_poison(&self.topics);
        topics
            .entry(topic.into())
            .or_insert_with(|| TopicLog::new(partitions));
    }

    /// Fail the next sends with the given errors, in order.
    pub fn fail_next_sends(&self, errors: impl IntoIterator<Item = DeliveryError>) {
        // ---
        let mut faults = lock_ignore_poison(&self.faults);
        faults.send_script.extend(errors);
    }

    /// Fail every send with `error` until [`heal`](Self::heal) is called.
    pub fn fail_all_sends(&self, error: DeliveryError) {
        lock_ignore_poison(&self.faults).send_always = Some(error);
    }

    /// Fail the next `count` commits with a transient error.
    pub fn fail_next_commits(&self, count: u32) {
        lock_ignore_poison(&self.faults).failing_commits = count;
    }

    /// Clear all scripted faults.
    pub fn heal(&self) {
        *lock_ignore_poison(&self.faults) = Faults::default();
    }

    /// Number of times `send()` was invoked, including failed calls.
    pub fn send_calls(&self) -> u64 {
        self.send_calls.load(Ordering::SeqCst)
    }

    /// Number of times `commit()` was invoked, including failed calls.
    pub fn commit_calls(&self) -> u64 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of every record in a partition, in offset order.
    pub fn records(&self, topic: &Topic, partition: u32) -> Vec<Record> {
        // ---
        let topics = lock_ignore_poison(&self.topics);
        topics
            .get(topic)
            .and_then(|log| log.partitions.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every record in a topic, partition by partition.
    pub fn all_records(&self, topic: &Topic) -> Vec<Record> {
        // ---
        let topics = lock_ignore_poison(&self.topics);
        topics
            .get(topic)
            .map(|log| log.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    fn next_send_fault(&self) -> Option<DeliveryError> {
        // ---
        let mut faults = lock_ignore_poison(&self.faults);
        faults
            .send_script
            .pop_front()
            .or_else(|| faults.send_always.clone())
    }

    fn take_commit_fault(&self) -> bool {
        // ---
        let mut faults = lock_ignore_poison(&self.faults);
        if faults.failing_commits > 0 {
            faults.failing_commits -= 1;
            true
        } else {
            false
        }
    }

    fn read_from(&self, topic: &Topic, partition: u32, offset: i64, max: usize) -> Vec<Record> {
        // ---
        let topics = lock_ignore_poison(&self.topics);
        let Some(log) = topics
            .get(topic)
            .and_then(|log| log.partitions.get(partition as usize))
        else {
            return Vec::new();
        };

        let start = offset.max(0) as usize;
        log.iter().skip(start).take(max).cloned().collect()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        // ---
        Self::build(1, None)
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    // ---
    async fn partitions(&self, topic: &Topic) -> Result<u32> {
        // ---
        let mut topics = lock_ignore_poison(&self.topics);
        let log = topics
            .entry(topic.clone())
            .or_insert_with(|| TopicLog::new(self.default_partitions));
        Ok(log.partitions.len() as u32)
    }

    async fn send(&self, topic: &Topic, message: Message) -> Result<Ack> {
        // ---
        self.send_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = self.next_send_fault() {
            log_debug!("memory broker: injected send failure on {topic}: {err}");
            return Err(err);
        }

        if let Some(max) = self.max_message_bytes {
            let len = message.encoded_len();
            if len > max {
                return Err(DeliveryError::Permanent(format!(
                    "message of {len} bytes exceeds limit of {max} bytes"
                )));
            }
        }

        let ack = {
            let mut topics = lock_ignore_poison(&self.topics);
            let log = topics
                .entry(topic.clone())
                .or_insert_with(|| TopicLog::new(self.default_partitions));

            let fallback = self.round_robin.fetch_add(1, Ordering::Relaxed);
            let partition = super::route(&message, log.partitions.len(), fallback);
            let records = &mut log.partitions[partition];
            let offset = records.len() as i64;

            records.push(Record {
                topic: topic.clone(),
                partition: partition as u32,
                offset,
                message,
            });

            Ack {
                topic: topic.clone(),
                partition: partition as u32,
                offset,
            }
        };

        self.appended.notify_waiters();
        Ok(ack)
    }

    async fn fetch(
        &self,
        topic: &Topic,
        partition: u32,
        offset: i64,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>> {
        // ---
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so an append between the
            // check and the wait is not missed.
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let batch = self.read_from(topic, partition, offset, max_messages);
            if !batch.is_empty() {
                return Ok(batch);
            }

            if timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&self, topic: &Topic, partition: u32, offset: i64) -> Result<()> {
        // ---
        self.commit_calls.fetch_add(1, Ordering::SeqCst);

        if self.take_commit_fault() {
            return Err(DeliveryError::Transient(
                "coordinator not available".into(),
            ));
        }

        let mut topics = lock_ignore_poison(&self.topics);
        let log = topics
            .entry(topic.clone())
            .or_insert_with(|| TopicLog::new(self.default_partitions));

        let slot = log.committed.get_mut(partition as usize).ok_or_else(|| {
            DeliveryError::Permanent(format!("unknown partition {partition} of {topic}"))
        })?;
        *slot = Some(offset);

        Ok(())
    }

    async fn committed(&self, topic: &Topic, partition: u32) -> Result<Option<i64>> {
        // ---
        let topics = lock_ignore_poison(&self.topics);
        Ok(topics
            .get(topic)
            .and_then(|log| log.committed.get(partition as usize).copied())
            .flatten())
    }

    async fn latest_offset(&self, topic: &Topic, partition: u32) -> Result<Option<i64>> {
        // ---
        let topics = lock_ignore_poison(&self.topics);
        Ok(topics
            .get(topic)
            .and_then(|log| log.partitions.get(partition as usize))
            .and_then(|records| records.last())
            .map(|record| record.offset))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_send_assigns_sequential_offsets() {
        // ---
        let broker = MemoryBroker::new();
        let topic = Topic::from("t");

        let a = broker.send(&topic, Message::new("a")).await.unwrap();
        let b = broker.send(&topic, Message::new("b")).await.unwrap();

        assert_eq!((a.partition, a.offset), (0, 0));
        assert_eq!((b.partition, b.offset), (0, 1));
        assert_eq!(broker.latest_offset(&topic, 0).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_fetch_times_out_empty() {
        // ---
        let broker = MemoryBroker::new();
        let topic = Topic::from("t");

        let batch = broker
            .fetch(&topic, 0, 0, 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_send() {
        // ---
        let broker = MemoryBroker::new();
        let topic = Topic::from("t");

        let fetcher = {
            let broker = broker.clone();
            let topic = topic.clone();
            tokio::spawn(async move {
                broker
                    .fetch(&topic, 0, 0, 10, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.send(&topic, Message::new("late")).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), fetcher)
            .await
            .expect("fetch did not wake")
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message.value_str(), Some("late"));
    }

    #[tokio::test]
    async fn test_scripted_send_faults() {
        // ---
        let broker = MemoryBroker::new();
        let topic = Topic::from("t");
        broker.fail_next_sends([DeliveryError::Transient("leader not ready".into())]);

        assert!(broker.send(&topic, Message::new("x")).await.is_err());
        assert!(broker.send(&topic, Message::new("x")).await.is_ok());
        assert_eq!(broker.send_calls(), 2);
    }

    #[tokio::test]
    async fn test_oversized_message_is_permanent() {
        // ---
        let broker = MemoryBroker::with_max_message_bytes(1, 4);
        let err = broker
            .send(&Topic::from("t"), Message::new("too large"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_commit_fault_then_success() {
        // ---
        let broker = MemoryBroker::new();
        let topic = Topic::from("t");
        broker.create_topic(topic.clone(), 2);
        broker.fail_next_commits(1);

        assert!(broker.commit(&topic, 1, 4).await.is_err());
        broker.commit(&topic, 1, 4).await.unwrap();

        assert_eq!(broker.committed(&topic, 1).await.unwrap(), Some(4));
        assert_eq!(broker.committed(&topic, 0).await.unwrap(), None);
        assert_eq!(broker.commit_calls(), 2);
    }
}
