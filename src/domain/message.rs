// src/domain/message.rs

//! Message model.
//!
//! A [`Message`] is created by the caller, handed to the publisher, and is
//! never mutated afterwards. Fetched messages are wrapped in a [`Record`]
//! that carries their broker position.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Header carrying the publisher-assigned unique message id.
pub const MESSAGE_ID_HEADER: &str = "message-id";

/// A topic name.
///
/// Topics are opaque identifiers at the domain level. They are immutable,
/// cheap to clone, and safe to share across threads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(pub Arc<str>);

impl Topic {
    /// Borrow the topic name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Topic
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Topic(value.into())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable message.
///
/// Built with the consuming `with_*` methods; once handed to the publisher
/// it is only read.
///
/// ```
/// # use mom_delivery::Message;
/// let msg = Message::new("Hello Spring Kafka!")
///     .with_key("greeting")
///     .with_header("content-type", "text/plain");
///
/// assert_eq!(msg.value().as_ref(), b"Hello Spring Kafka!");
/// assert_eq!(msg.key().map(|k| k.as_ref()), Some(&b"greeting"[..]));
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    // ---
    key: Option<Bytes>,
    value: Bytes,
    partition_hint: Option<u32>,
    timestamp: SystemTime,
    headers: BTreeMap<String, Bytes>,
}

impl Message {
    // ---
    /// Create a message with the given value, stamped with the current time.
    pub fn new(value: impl Into<Bytes>) -> Self {
        // ---
        Self {
            key: None,
            value: value.into(),
            partition_hint: None,
            timestamp: SystemTime::now(),
            headers: BTreeMap::new(),
        }
    }

    /// Set the message key.
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Pin the message to a partition.
    ///
    /// Messages sharing a hint are delivered in publish order.
    pub fn with_partition_hint(mut self, partition: u32) -> Self {
        self.partition_hint = Some(partition);
        self
    }

    /// Override the creation timestamp.
    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add or replace a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn partition_hint(&self) -> Option<u32> {
        self.partition_hint
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn headers(&self) -> &BTreeMap<String, Bytes> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&Bytes> {
        self.headers.get(name)
    }

    /// The publisher-assigned message id, if present and valid UTF-8.
    pub fn message_id(&self) -> Option<&str> {
        // ---
        self.header(MESSAGE_ID_HEADER)
            .and_then(|raw| std::str::from_utf8(raw).ok())
    }

    /// Value as UTF-8 text, if it is valid UTF-8.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Total payload size in bytes (key, value and headers).
    pub fn encoded_len(&self) -> usize {
        // ---
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + value.len())
            .sum();

        self.key.as_ref().map_or(0, Bytes::len) + self.value.len() + headers
    }
}

/// A message fetched from a partition, with its broker position.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub topic: Topic,
    pub partition: u32,
    pub offset: i64,
    pub message: Message,
}

/// Broker acknowledgment of a successful send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub topic: Topic,
    pub partition: u32,
    pub offset: i64,
}
