//! Cache engine
//!
//! Translates memcached verbs into [`CacheStorage`] operations. The engine
//! keeps the command statistics; expiry and delayed-delete holds are
//! resolved here, on read, against the wall clock. CAS values are assigned
//! by the storage when a write commits.
//!
//! Conditional verbs (`add`, `replace`, `cas`, `append`, `prepend`,
//! `incr`/`decr`, `delete`) read the current element and then swap it with
//! [`CacheStorage::replace`] or [`CacheStorage::remove_if`], which only
//! succeed if nothing changed in between. A lost race re-reads and retries.

use crate::StorageError;
use crate::config::StorageConfig;
use crate::storage::{self, CacheElement, CacheStorage, Key, current_timestamp, resolve_expiry};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace};

/// Server version reported by `version` and `stats`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Administrative statistics: name to one or more values
pub type Stats = BTreeMap<String, BTreeSet<String>>;

/// Outcome of a storage verb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResponse {
    Stored,
    NotStored,
    /// CAS value did not match
    Exists,
    NotFound,
}

/// Outcome of `delete`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResponse {
    Deleted,
    NotFound,
}

/// Gauges sampled from the storage for metrics export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub curr_items: u64,
    pub current_bytes: u64,
    pub limit_maxbytes: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cmd_get: AtomicU64,
    cmd_set: AtomicU64,
    get_hits: AtomicU64,
    get_misses: AtomicU64,
    total_items: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Memcached semantics over a storage backend
pub struct Cache {
    storage: Arc<dyn CacheStorage>,
    counters: Counters,
    started: i64,
}

impl Cache {
    pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
        Self {
            storage,
            counters: Counters::default(),
            started: current_timestamp(),
        }
    }

    /// Open the configured backend and wrap it
    pub fn open(config: &StorageConfig) -> Self {
        Self::new(storage::open(config))
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    /// Current readable element; expired or released entries are purged
    fn live(&self, key: &Key, now: i64) -> Result<Option<CacheElement>, StorageError> {
        let Some(element) = self.storage.get(key)? else {
            return Ok(None);
        };
        if element.should_purge_at(now) {
            if self.storage.remove_if(&element)? {
                trace!(key = %key, "Purged expired element");
            }
            return Ok(None);
        }
        if element.is_blocked_at(now) {
            return Ok(None);
        }
        Ok(Some(element))
    }

    /// Store only if no readable element exists under the key
    pub fn add(&self, element: CacheElement) -> Result<StoreResponse, StorageError> {
        bump(&self.counters.cmd_set);
        let now = current_timestamp();
        loop {
            let stored = match self.storage.put_if_absent(element.clone())? {
                None => true,
                Some(existing) if existing.is_live_at(now) => {
                    return Ok(StoreResponse::NotStored);
                }
                // Expired or held by a delayed delete
                Some(existing) => self.storage.replace(&existing, element.clone())?,
            };
            if stored {
                bump(&self.counters.total_items);
                return Ok(StoreResponse::Stored);
            }
        }
    }

    /// Store unconditionally
    pub fn set(&self, element: CacheElement) -> Result<StoreResponse, StorageError> {
        bump(&self.counters.cmd_set);
        self.storage.put(element)?;
        bump(&self.counters.total_items);
        Ok(StoreResponse::Stored)
    }

    /// Store only if a readable element exists under the key
    pub fn replace(&self, element: CacheElement) -> Result<StoreResponse, StorageError> {
        bump(&self.counters.cmd_set);
        let now = current_timestamp();
        loop {
            let Some(existing) = self.live(&element.key, now)? else {
                return Ok(StoreResponse::NotStored);
            };
            if self.storage.replace(&existing, element.clone())? {
                bump(&self.counters.total_items);
                return Ok(StoreResponse::Stored);
            }
        }
    }

    /// Store only if the current CAS value equals `cas_unique`
    pub fn cas(&self, element: CacheElement, cas_unique: u64) -> Result<StoreResponse, StorageError> {
        bump(&self.counters.cmd_set);
        let now = current_timestamp();
        loop {
            let Some(existing) = self.live(&element.key, now)? else {
                return Ok(StoreResponse::NotFound);
            };
            if existing.cas_unique != cas_unique {
                return Ok(StoreResponse::Exists);
            }
            if self.storage.replace(&existing, element.clone())? {
                bump(&self.counters.total_items);
                return Ok(StoreResponse::Stored);
            }
        }
    }

    /// Add `element`'s data after the existing data
    pub fn append(&self, element: CacheElement) -> Result<StoreResponse, StorageError> {
        self.concat(element, CacheElement::append)
    }

    /// Add `element`'s data before the existing data
    pub fn prepend(&self, element: CacheElement) -> Result<StoreResponse, StorageError> {
        self.concat(element, CacheElement::prepend)
    }

    fn concat(
        &self,
        element: CacheElement,
        combine: fn(&CacheElement, &CacheElement) -> CacheElement,
    ) -> Result<StoreResponse, StorageError> {
        bump(&self.counters.cmd_set);
        let now = current_timestamp();
        loop {
            let Some(existing) = self.live(&element.key, now)? else {
                return Ok(StoreResponse::NotFound);
            };
            let combined = combine(&existing, &element);
            if self.storage.replace(&existing, combined)? {
                return Ok(StoreResponse::Stored);
            }
        }
    }

    /// Delete a key. With `hold > 0` the element is blocked instead: reads
    /// miss and `add` may reuse the key, and the entry is purged once the
    /// hold (relative seconds, or absolute time past 30 days) has passed.
    pub fn delete(&self, key: &Key, hold: i64) -> Result<DeleteResponse, StorageError> {
        let now = current_timestamp();
        loop {
            let Some(existing) = self.live(key, now)? else {
                return Ok(DeleteResponse::NotFound);
            };

            let done = if hold > 0 {
                let mut blocked = existing.clone();
                blocked.block(resolve_expiry(hold, now).unwrap_or(now));
                self.storage.replace(&existing, blocked)?
            } else {
                self.storage.remove_if(&existing)?
            };
            if done {
                debug!(key = %key, hold, "Deleted");
                return Ok(DeleteResponse::Deleted);
            }
        }
    }

    /// Fetch every readable element among `keys`, in request order
    pub fn get(&self, keys: &[Key]) -> Result<Vec<CacheElement>, StorageError> {
        let now = current_timestamp();
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            bump(&self.counters.cmd_get);
            match self.live(key, now)? {
                Some(element) => {
                    bump(&self.counters.get_hits);
                    found.push(element);
                }
                None => bump(&self.counters.get_misses),
            }
        }
        Ok(found)
    }

    /// Increment (positive `delta`) or decrement (negative) a decimal value.
    ///
    /// Returns `None` if the key is absent and `NotANumber` if the stored
    /// data is not an unsigned decimal integer. The result saturates at 0
    /// and `u64::MAX`.
    pub fn get_add(&self, key: &Key, delta: i64) -> Result<Option<u64>, StorageError> {
        let now = current_timestamp();
        loop {
            let Some(existing) = self.live(key, now)? else {
                return Ok(None);
            };
            let (updated, value) = existing.add(delta)?;
            if self.storage.replace(&existing, updated)? {
                return Ok(Some(value));
            }
        }
    }

    /// Drop every element
    pub fn flush_all(&self) {
        let before = self.storage.len();
        self.storage.clear();
        info!(removed = before, "Flushed all items");
    }

    /// Administrative statistics; `"keys"` lists every stored key
    pub fn stat(&self, arg: &str) -> Stats {
        let mut stats = Stats::new();
        if arg.trim() == "keys" {
            let keys = self.storage.keys().iter().map(Key::to_string).collect();
            stats.insert("key".to_string(), keys);
            return stats;
        }

        let now = current_timestamp();
        let snapshot = self.snapshot();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed).to_string();
        let mut put = |name: &str, value: String| {
            stats.insert(name.to_string(), BTreeSet::from([value]));
        };

        put("pid", std::process::id().to_string());
        put("uptime", (now - self.started).to_string());
        put("time", now.to_string());
        put("version", VERSION.to_string());
        put("curr_items", snapshot.curr_items.to_string());
        put("limit_maxitems", self.storage.capacity().to_string());
        put("total_items", load(&self.counters.total_items));
        put("limit_maxbytes", snapshot.limit_maxbytes.to_string());
        put("current_bytes", snapshot.current_bytes.to_string());
        put("cmd_get", load(&self.counters.cmd_get));
        put("cmd_set", load(&self.counters.cmd_set));
        put("get_hits", load(&self.counters.get_hits));
        put("get_misses", load(&self.counters.get_misses));
        put("evictions", snapshot.evictions.to_string());
        stats
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            curr_items: self.storage.len() as u64,
            current_bytes: self.storage.memory_used(),
            limit_maxbytes: self.storage.memory_capacity(),
            evictions: self.storage.evictions(),
        }
    }

    /// Drop every element and release the storage
    pub fn close(&self) {
        self.storage.close();
        info!("Cache closed");
    }
}
