//! Idempotent consumer layer.
//!
//! Redelivery after a crash or an uncommitted batch hands the same message to
//! the handler again. [`Deduplicate`] remembers the ids of recently handled
//! messages and skips repeats.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::lock::lock_ignore_poison;
use crate::{log_debug, MessageHandler, Record};

/// Handler wrapper that drops messages it has already handled successfully.
///
/// Messages are identified by their `message-id` header, falling back to
/// `topic/partition@offset` when the header is absent. Only the last
/// `window` ids are remembered.
pub struct Deduplicate<H> {
    // ---
    inner: H,
    window: usize,
    seen: Mutex<SeenIds>,
}

#[derive(Default)]
struct SeenIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenIds {
    fn remember(&mut self, id: String, window: usize) {
        // ---
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);

        while self.order.len() > window {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
    }
}

impl<H> Deduplicate<H> {
    // ---
    pub const DEFAULT_WINDOW: usize = 10_000;

    pub fn new(inner: H) -> Self {
        Self::with_window(inner, Self::DEFAULT_WINDOW)
    }

    pub fn with_window(inner: H, window: usize) -> Self {
        // ---
        Self {
            inner,
            window: window.max(1),
            seen: Mutex::new(SeenIds::default()),
        }
    }

    /// Number of ids currently remembered.
    pub fn remembered(&self) -> usize {
        lock_ignore_poison(&self.seen).order.len()
    }
}

fn dedup_key(record: &Record) -> String {
    // ---
    match record.message.message_id() {
        Some(id) => id.to_owned(),
        None => format!("{}/{}@{}", record.topic, record.partition, record.offset),
    }
}

#[async_trait]
impl<H> MessageHandler for Deduplicate<H>
where
    H: MessageHandler,
{
    async fn handle(&self, record: &Record) -> anyhow::Result<()> {
        // ---
        let key = dedup_key(record);

        if lock_ignore_poison(&self.seen).ids.contains(&key) {
            log_debug!(
                "skipping duplicate {key} at {}/{}@{}",
                record.topic,
                record.partition,
                record.offset
            );
            return Ok(());
        }

        self.inner.handle(record).await?;

        lock_ignore_poison(&self.seen).remember(key, self.window);
        Ok(())
    }
}
