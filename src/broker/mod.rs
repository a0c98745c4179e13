//! Broker implementations.
//!
//! Concrete implementations of the domain-level [`Broker`](crate::Broker)
//! trait. Network adapters live outside this crate; the in-memory broker is
//! always available and defines the reference semantics.

mod memory;

pub use memory::MemoryBroker;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::Message;

/// Pick a slot in `0..slots` for `message`.
///
/// Partition hint wins, then key hash; messages with neither take
/// `fallback`. The same hint or key always maps to the same slot for a
/// given slot count, which is what keeps per-key ordering intact.
pub(crate) fn route(message: &Message, slots: usize, fallback: usize) -> usize {
    // ---
    debug_assert!(slots > 0);

    if let Some(hint) = message.partition_hint() {
        return hint as usize % slots;
    }

    if let Some(key) = message.key() {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        return (hasher.finish() % slots as u64) as usize;
    }

    fallback % slots
}
