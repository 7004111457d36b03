//! Eviction ordering
//!
//! Every live entry carries a stamp from a process-wide monotonically
//! increasing clock. The entry with the smallest stamp is the next victim.
//! FIFO stamps an entry once when it is written; LRU re-stamps it on every
//! successful read as well.

use crate::storage::Key;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Victim selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Evict the oldest-written entry
    Fifo,
    /// Evict the least recently read or written entry
    #[default]
    Lru,
}

impl EvictionPolicy {
    /// Whether a successful read moves the entry to the back of the queue
    pub fn refresh_on_read(self) -> bool {
        matches!(self, Self::Lru)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Lru => "lru",
        }
    }
}

/// Monotonic counter shared by every partition of one store.
///
/// Issues eviction stamps, and CAS values when used as a CAS counter.
#[derive(Debug, Default)]
pub struct StampClock(AtomicU64);

impl StampClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Stamp-ordered set of keys
#[derive(Debug, Default)]
pub struct EvictionQueue {
    order: BTreeMap<u64, Key>,
}

impl EvictionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stamp: u64, key: Key) {
        self.order.insert(stamp, key);
    }

    /// Move the entry stamped `old` to `new`
    pub fn touch(&mut self, old: u64, new: u64) {
        if let Some(key) = self.order.remove(&old) {
            self.order.insert(new, key);
        }
    }

    pub fn remove(&mut self, stamp: u64) -> Option<Key> {
        self.order.remove(&stamp)
    }

    /// Oldest entry without removing it
    pub fn peek(&self) -> Option<(u64, &Key)> {
        self.order.first_key_value().map(|(stamp, key)| (*stamp, key))
    }

    /// Oldest entry whose key is not `skip`
    pub fn peek_except(&self, skip: &Key) -> Option<(u64, &Key)> {
        self.order
            .iter()
            .find(|(_, key)| *key != skip)
            .map(|(stamp, key)| (*stamp, key))
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
    }
}
