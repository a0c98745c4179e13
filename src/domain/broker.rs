// src/domain/broker.rs

//! Broker capability interface.
//!
//! The delivery core treats the broker as an external collaborator reached
//! through this trait. It does not define wire bytes, partition placement
//! or durability; concrete adapters own those concerns.
//!
//! Offsets are per-partition positions starting at `0`. A committed offset
//! is the last offset whose processing finished; consumption resumes at
//! `committed + 1`.

use std::sync::Arc;
use std::time::Duration;

use crate::{Ack, Message, Record, Result, Topic};

/// Broker capability.
///
/// Implementations must ensure that:
/// - `send()` returns [`DeliveryError::Transient`](crate::DeliveryError::Transient)
///   for conditions that may clear on retry and
///   [`DeliveryError::Permanent`](crate::DeliveryError::Permanent) otherwise.
/// - `fetch()` suspends for at most `timeout` waiting for data and returns an
///   empty batch when none arrives.
/// - records returned by `fetch()` are in offset order.
///
/// The in-memory broker ([`MemoryBroker`](crate::MemoryBroker)) is the
/// reference implementation of these semantics.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation shows explicit
/// lifetimes and a boxed `Future`. Treat methods as normal `async fn`s.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    // ---
    /// Establish connectivity. The default is a no-op for brokers that
    /// connect lazily.
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Number of partitions of `topic`.
    async fn partitions(&self, topic: &Topic) -> Result<u32>;

    /// Send a message, resolving once the broker has acknowledged it.
    async fn send(&self, topic: &Topic, message: Message) -> Result<Ack>;

    /// Fetch up to `max_messages` records starting at `offset`.
    async fn fetch(
        &self,
        topic: &Topic,
        partition: u32,
        offset: i64,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>>;

    /// Commit `offset` as fully processed for `partition`.
    async fn commit(&self, topic: &Topic, partition: u32, offset: i64) -> Result<()>;

    /// Last committed offset, `None` if nothing was committed yet.
    async fn committed(&self, topic: &Topic, partition: u32) -> Result<Option<i64>>;

    /// Highest offset present in the partition, `None` if it is empty.
    async fn latest_offset(&self, topic: &Topic, partition: u32) -> Result<Option<i64>>;
}

/// Shared broker pointer.
///
/// `.clone()` only bumps a reference count; all clones share one connection.
pub type BrokerPtr = Arc<dyn Broker>;
