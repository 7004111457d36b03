//! Storage layer for ArenaCache
//!
//! Two interchangeable backends implement [`CacheStorage`]:
//!
//! - [`PartitionedIndex`]: keys routed to independently locked partitions,
//!   values serialized into block-allocated arenas
//! - [`MemoryStorage`]: a single ownership map, for small deployments and
//!   as a reference implementation in tests

mod block;
mod element;
mod eviction;
mod index;
mod key;
mod memory;
mod partition;

pub use block::{BlockStore, Region};
pub use element::{CacheElement, THIRTY_DAYS, current_timestamp, resolve_expiry};
pub use eviction::{EvictionPolicy, EvictionQueue, StampClock};
pub use index::PartitionedIndex;
pub use key::Key;
pub use memory::MemoryStorage;
pub use partition::{Clocks, Partition};

use crate::StorageError;
use crate::config::{StorageBackend, StorageConfig};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Map-like contract the cache engine runs on.
///
/// Every per-key operation is linearizable with respect to other operations
/// on the same key. Aggregate reads (`len`, `keys`, byte counts) are
/// snapshots that may mix states from different moments.
///
/// Each successful `put`, `put_if_absent` insert and `replace` stores the
/// element under a fresh `cas_unique` drawn from the backend's counter while
/// the key is locked; the value passed in is ignored. A key's CAS therefore
/// only grows across its successive writes.
pub trait CacheStorage: Send + Sync {
    fn get(&self, key: &Key) -> Result<Option<CacheElement>, StorageError>;

    /// Insert or overwrite, returning the previous value
    fn put(&self, element: CacheElement) -> Result<Option<CacheElement>, StorageError>;

    /// Insert only if the key is absent; otherwise return what is there
    fn put_if_absent(&self, element: CacheElement) -> Result<Option<CacheElement>, StorageError>;

    /// Swap in `element` only if the stored value equals `expected`
    fn replace(&self, expected: &CacheElement, element: CacheElement) -> Result<bool, StorageError>;

    fn remove(&self, key: &Key) -> Result<Option<CacheElement>, StorageError>;

    /// Remove only if the stored value equals `expected`
    fn remove_if(&self, expected: &CacheElement) -> Result<bool, StorageError>;

    fn contains_key(&self, key: &Key) -> bool;

    /// Number of live entries
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live key; a full scan, for administrative use
    fn keys(&self) -> HashSet<Key>;

    fn clear(&self);

    /// Drop all entries and release the backing memory
    fn close(&self);

    /// Maximum number of items
    fn capacity(&self) -> usize;

    /// Bytes available for values
    fn memory_capacity(&self) -> u64;

    /// Bytes currently holding values
    fn memory_used(&self) -> u64;

    /// Entries removed to respect the item or byte limits
    fn evictions(&self) -> u64;
}

/// Build the backend selected by the configuration
pub fn open(config: &StorageConfig) -> Arc<dyn CacheStorage> {
    match config.backend {
        StorageBackend::Block => {
            info!(
                partitions = config.partitions,
                buckets = config.buckets_per_partition,
                block_size = config.block_size,
                max_mb = config.max_bytes / (1024 * 1024),
                max_items = config.max_items,
                eviction = config.eviction.as_str(),
                "Opening block storage"
            );
            Arc::new(PartitionedIndex::new(config))
        }
        StorageBackend::Memory => {
            info!(
                max_mb = config.max_bytes / (1024 * 1024),
                max_items = config.max_items,
                eviction = config.eviction.as_str(),
                "Opening memory storage"
            );
            Arc::new(MemoryStorage::new(
                config.max_items,
                config.max_bytes,
                config.eviction,
            ))
        }
    }
}
