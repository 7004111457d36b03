//! Partitioned, block-allocated index
//!
//! ```text
//!                 hash(key) % partitions
//!   key ──────────────────┬──────────────────────────────┐
//!                         ▼                              ▼
//!              ┌──────────────────────┐       ┌──────────────────────┐
//!              │ Partition 0          │  ...  │ Partition N-1        │
//!              │  RwLock              │       │  RwLock              │
//!              │  buckets[hash & m]   │       │  buckets[hash & m]   │
//!              │   └─ (key, region)…  │       │   └─ (key, region)…  │
//!              │  BlockStore arena    │       │  BlockStore arena    │
//!              └──────────────────────┘       └──────────────────────┘
//! ```
//!
//! Item-count eviction is global: the victim is the entry with the smallest
//! stamp across all partitions. Byte-ceiling and out-of-space eviction stay
//! inside the partition being written, since only its arena matters.
//!
//! The index owns the CAS counter for every element it stores. Partitions
//! draw from it under their write lock.

use crate::StorageError;
use crate::config::StorageConfig;
use crate::storage::eviction::EvictionPolicy;
use crate::storage::partition::{Clocks, Partition};
use crate::storage::{CacheElement, CacheStorage, Key};
use std::collections::HashSet;
use tracing::{debug, trace};

pub struct PartitionedIndex {
    partitions: Box<[Partition]>,
    policy: EvictionPolicy,
    max_items: usize,
    clocks: Clocks,
}

impl PartitionedIndex {
    pub fn new(config: &StorageConfig) -> Self {
        let count = config.partitions.max(1);
        let arena_bytes = usize::try_from(config.partition_bytes()).unwrap_or(usize::MAX);
        let ceiling = usize::try_from(config.ceiling_bytes).unwrap_or(usize::MAX);

        let partitions = (0..count)
            .map(|id| {
                Partition::new(
                    id,
                    config.buckets_per_partition,
                    arena_bytes,
                    config.block_size,
                    ceiling,
                )
            })
            .collect();

        Self {
            partitions,
            policy: config.eviction,
            max_items: config.max_items,
            clocks: Clocks::new(),
        }
    }

    fn route(&self, key: &Key) -> &Partition {
        let index = key.hash_code() % self.partitions.len() as u64;
        &self.partitions[index as usize]
    }

    /// Evict globally oldest entries until the item limit holds
    fn enforce_item_limit(&self) -> Result<(), StorageError> {
        while self.len() > self.max_items {
            let victim = self
                .partitions
                .iter()
                .filter_map(|p| p.oldest_stamp().map(|stamp| (stamp, p)))
                .min_by_key(|(stamp, _)| *stamp);

            let Some((_, partition)) = victim else {
                break;
            };
            if let Some(key) = partition.evict_oldest()? {
                trace!(key = %key, partition = partition.id(), "Evicted for item limit");
            }
        }
        Ok(())
    }

    fn after_insert<T>(&self, result: T) -> Result<T, StorageError> {
        self.enforce_item_limit()?;
        Ok(result)
    }
}

impl CacheStorage for PartitionedIndex {
    fn get(&self, key: &Key) -> Result<Option<CacheElement>, StorageError> {
        let touch = self.policy.refresh_on_read().then_some(&self.clocks.stamps);
        self.route(key).get(key, touch)
    }

    fn put(&self, element: CacheElement) -> Result<Option<CacheElement>, StorageError> {
        let old = self.route(&element.key).put(element, &self.clocks)?;
        self.after_insert(old)
    }

    fn put_if_absent(&self, element: CacheElement) -> Result<Option<CacheElement>, StorageError> {
        let existing = self.route(&element.key).put_if_absent(element, &self.clocks)?;
        if existing.is_some() {
            return Ok(existing);
        }
        self.after_insert(None)
    }

    fn replace(&self, expected: &CacheElement, element: CacheElement) -> Result<bool, StorageError> {
        if expected.key != element.key {
            return Ok(false);
        }
        self.route(&element.key)
            .replace_if(expected, element, &self.clocks)
    }

    fn remove(&self, key: &Key) -> Result<Option<CacheElement>, StorageError> {
        self.route(key).remove(key)
    }

    fn remove_if(&self, expected: &CacheElement) -> Result<bool, StorageError> {
        self.route(&expected.key).remove_if(expected)
    }

    fn contains_key(&self, key: &Key) -> bool {
        self.route(key).contains_key(key)
    }

    fn len(&self) -> usize {
        self.partitions.iter().map(Partition::len).sum()
    }

    fn keys(&self) -> HashSet<Key> {
        self.partitions.iter().flat_map(Partition::keys).collect()
    }

    fn clear(&self) {
        let removed: usize = self.partitions.iter().map(Partition::clear).sum();
        debug!(removed, "Index cleared");
    }

    fn close(&self) {
        for partition in &self.partitions {
            partition.close();
        }
        debug!(partitions = self.partitions.len(), "Index closed");
    }

    fn capacity(&self) -> usize {
        self.max_items
    }

    fn memory_capacity(&self) -> u64 {
        self.partitions
            .iter()
            .map(|p| p.store_size_bytes() as u64)
            .sum()
    }

    fn memory_used(&self) -> u64 {
        self.partitions.iter().map(|p| p.used_bytes() as u64).sum()
    }

    fn evictions(&self) -> u64 {
        self.partitions.iter().map(Partition::evictions).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(partitions: usize, max_items: usize, eviction: EvictionPolicy) -> StorageConfig {
        StorageConfig {
            partitions,
            buckets_per_partition: 64,
            block_size: 8,
            max_bytes: partitions as u64 * 64 * 1024,
            ceiling_bytes: 0,
            max_items,
            eviction,
            ..StorageConfig::default()
        }
    }

    fn element(key: &str, data: &str) -> CacheElement {
        CacheElement::new(key, 0, 0, data.as_bytes())
    }

    #[test]
    fn test_routing_is_deterministic() {
        let index = PartitionedIndex::new(&config(8, 100, EvictionPolicy::Fifo));
        let key = Key::from("route-me");
        assert_eq!(index.route(&key).id(), index.route(&key).id());
    }

    #[test]
    fn test_basic_map_contract() {
        let index = PartitionedIndex::new(&config(4, 100, EvictionPolicy::Lru));
        assert!(index.put(element("a", "1")).unwrap().is_none());
        assert!(index.contains_key(&Key::from("a")));
        assert_eq!(index.get(&Key::from("a")).unwrap().unwrap().data, b"1");
        assert_eq!(index.put(element("a", "2")).unwrap().unwrap().data, b"1");
        assert_eq!(index.len(), 1);
        assert_eq!(index.remove(&Key::from("a")).unwrap().unwrap().data, b"2");
        assert!(index.is_empty());
        assert_eq!(index.memory_used(), 0);
    }

    #[test]
    fn test_fifo_evicts_earliest_inserted() {
        let index = PartitionedIndex::new(&config(4, 999, EvictionPolicy::Fifo));
        for i in 0..1000 {
            index.put(element(&format!("key{i}"), "v")).unwrap();
            // Reads do not change FIFO order
            index.get(&Key::from("key0")).unwrap();
        }
        assert_eq!(index.len(), 999);
        assert!(!index.contains_key(&Key::from("key0")));
        assert!(index.contains_key(&Key::from("key1")));
        assert!(index.contains_key(&Key::from("key999")));
        assert_eq!(index.evictions(), 1);
    }

    #[test]
    fn test_lru_evicts_least_recently_read() {
        let index = PartitionedIndex::new(&config(4, 3, EvictionPolicy::Lru));
        index.put(element("a", "1")).unwrap();
        index.put(element("b", "2")).unwrap();
        index.put(element("c", "3")).unwrap();
        index.get(&Key::from("a")).unwrap();

        index.put(element("d", "4")).unwrap();
        assert_eq!(index.len(), 3);
        assert!(index.contains_key(&Key::from("a")));
        assert!(!index.contains_key(&Key::from("b")));
    }

    #[test]
    fn test_put_if_absent_respects_limit() {
        let index = PartitionedIndex::new(&config(2, 2, EvictionPolicy::Fifo));
        index.put_if_absent(element("a", "1")).unwrap();
        index.put_if_absent(element("b", "2")).unwrap();
        index.put_if_absent(element("c", "3")).unwrap();
        assert_eq!(index.len(), 2);
        assert!(!index.contains_key(&Key::from("a")));
    }

    #[test]
    fn test_replace_requires_matching_key() {
        let index = PartitionedIndex::new(&config(2, 10, EvictionPolicy::Fifo));
        index.put(element("a", "1")).unwrap();
        let current = index.get(&Key::from("a")).unwrap().unwrap();
        assert!(!index.replace(&current, element("b", "2")).unwrap());
        assert!(index.replace(&current, element("a", "2")).unwrap());
    }

    #[test]
    fn test_keys_clear_close() {
        let index = PartitionedIndex::new(&config(4, 100, EvictionPolicy::Fifo));
        for i in 0..20 {
            index.put(element(&format!("k{i}"), "v")).unwrap();
        }
        assert_eq!(index.keys().len(), 20);
        assert_eq!(index.memory_capacity(), 4 * 64 * 1024);

        index.clear();
        assert!(index.is_empty());
        assert_eq!(index.memory_used(), 0);

        index.put(element("again", "v")).unwrap();
        index.close();
        assert!(index.is_empty());
        assert_eq!(index.memory_capacity(), 0);
    }

    #[test]
    fn test_byte_accounting_per_partition() {
        let index = PartitionedIndex::new(&config(4, 10_000, EvictionPolicy::Lru));
        for i in 0..500 {
            index.put(element(&format!("k{i}"), &"x".repeat(i % 97))).unwrap();
            if i % 3 == 0 {
                index.remove(&Key::from(format!("k{}", i / 2).as_str())).unwrap();
            }
        }
        for partition in index.partitions.iter() {
            assert_eq!(
                partition.used_bytes() + partition.free_bytes(),
                partition.store_size_bytes()
            );
        }
    }
}
