//! One independently locked shard of the block-allocated index
//!
//! A partition owns a [`BlockStore`] and a fixed array of hash buckets. Each
//! bucket is a chain of `(key, region)` records scanned with full key
//! comparison. Deleting rebuilds the affected chain without the removed
//! record, so chains never carry tombstones.
//!
//! Locking: reads take the read lock; every find-then-mutate sequence runs
//! under a single write-lock acquisition. The eviction queue sits behind its
//! own mutex so LRU reads can re-stamp entries while holding only the read
//! lock. Lock order is always state before queue.
//!
//! CAS values and eviction stamps are drawn only once the locks that order
//! the write are held, so a key's CAS grows in commit order and the queue
//! order matches the order in which entries were actually touched.

use crate::StorageError;
use crate::storage::block::{BlockStore, Region};
use crate::storage::element::CacheElement;
use crate::storage::eviction::{EvictionQueue, StampClock};
use crate::storage::Key;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, trace};

/// Counters shared by every partition of one index
#[derive(Debug, Default)]
pub struct Clocks {
    /// Eviction order
    pub stamps: StampClock,
    /// CAS values handed to stored elements
    pub cas: StampClock,
}

impl Clocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `element` the next CAS value and encode it
    fn seal(&self, element: &mut CacheElement) -> Vec<u8> {
        element.cas_unique = self.cas.next();
        element.encode()
    }
}

struct ChainEntry {
    key: Key,
    region: Region,
    stamp: AtomicU64,
}

struct PartitionState {
    store: BlockStore,
    buckets: Vec<Vec<ChainEntry>>,
    len: usize,
    evictions: u64,
}

/// Shard of the partitioned index
pub struct Partition {
    id: usize,
    ceiling_bytes: usize,
    state: RwLock<PartitionState>,
    queue: Mutex<EvictionQueue>,
}

impl PartitionState {
    fn bucket_of(&self, key: &Key) -> usize {
        // High half of the hash; the low half routes to the partition
        (key.hash_code().rotate_right(32) as usize) & (self.buckets.len() - 1)
    }

    fn find(&self, key: &Key) -> Option<&ChainEntry> {
        self.buckets[self.bucket_of(key)]
            .iter()
            .find(|entry| entry.key == *key)
    }

    fn read(&self, entry: &ChainEntry) -> Result<CacheElement, StorageError> {
        CacheElement::decode(entry.key.clone(), self.store.get(&entry.region)?)
    }

    fn lookup(&self, key: &Key) -> Result<Option<CacheElement>, StorageError> {
        self.find(key).map(|entry| self.read(entry)).transpose()
    }

    fn check_fits(&self, len: usize) -> Result<(), StorageError> {
        if len > self.store.store_size_bytes() {
            return Err(StorageError::OutOfSpace {
                requested: len,
                available: self.store.free_bytes(),
            });
        }
        Ok(())
    }

    /// Rebuild the key's chain without its record and free the region
    fn unlink(&mut self, key: &Key, queue: &mut EvictionQueue) -> Result<bool, StorageError> {
        let bucket = self.bucket_of(key);
        let chain = std::mem::take(&mut self.buckets[bucket]);
        let mut kept = Vec::with_capacity(chain.len().saturating_sub(1));
        let mut removed = None;
        for entry in chain {
            if removed.is_none() && entry.key == *key {
                removed = Some(entry);
            } else {
                kept.push(entry);
            }
        }
        self.buckets[bucket] = kept;

        let Some(entry) = removed else {
            return Ok(false);
        };
        self.len -= 1;
        queue.remove(entry.stamp.load(Ordering::Relaxed));
        self.store.free(&entry.region)?;
        Ok(true)
    }

    /// Remove the key and return the value it held
    fn detach(
        &mut self,
        key: &Key,
        queue: &mut EvictionQueue,
    ) -> Result<Option<CacheElement>, StorageError> {
        let old = self.lookup(key)?;
        if old.is_some() {
            self.unlink(key, queue)?;
        }
        Ok(old)
    }

    /// Store an encoded element, evicting the oldest entries of this
    /// partition while the arena cannot fit it.
    fn insert(
        &mut self,
        key: &Key,
        encoded: &[u8],
        stamp: u64,
        queue: &mut EvictionQueue,
    ) -> Result<(), StorageError> {
        let region = loop {
            match self.store.alloc(encoded.len()) {
                Ok(region) => break region,
                Err(StorageError::OutOfSpace { .. }) if !queue.is_empty() => {
                    self.evict_one(queue, None)?;
                }
                Err(e) => return Err(e),
            }
        };
        self.store.write(&region, encoded)?;

        let bucket = self.bucket_of(key);
        self.buckets[bucket].push(ChainEntry {
            key: key.clone(),
            region,
            stamp: AtomicU64::new(stamp),
        });
        self.len += 1;
        queue.push(stamp, key.clone());
        Ok(())
    }

    /// Write a key that is not currently linked, then restore the ceiling
    fn store_new(
        &mut self,
        key: &Key,
        encoded: &[u8],
        stamp: u64,
        ceiling: usize,
        queue: &mut EvictionQueue,
    ) -> Result<(), StorageError> {
        self.insert(key, encoded, stamp, queue)?;
        self.enforce_ceiling(ceiling, key, queue)
    }

    /// Unlink whatever the key holds and write the new encoding in its place
    fn overwrite(
        &mut self,
        key: &Key,
        encoded: &[u8],
        stamp: u64,
        ceiling: usize,
        queue: &mut EvictionQueue,
    ) -> Result<Option<CacheElement>, StorageError> {
        let old = self.detach(key, queue)?;
        self.store_new(key, encoded, stamp, ceiling, queue)?;
        Ok(old)
    }

    /// Evict while free space is below the ceiling, never the entry just written
    fn enforce_ceiling(
        &mut self,
        ceiling: usize,
        written: &Key,
        queue: &mut EvictionQueue,
    ) -> Result<(), StorageError> {
        while self.store.free_bytes() < ceiling {
            if self.evict_one(queue, Some(written))?.is_none() {
                break;
            }
        }
        Ok(())
    }

    fn evict_one(
        &mut self,
        queue: &mut EvictionQueue,
        skip: Option<&Key>,
    ) -> Result<Option<Key>, StorageError> {
        let victim = match skip {
            Some(skip) => queue.peek_except(skip),
            None => queue.peek(),
        }
        .map(|(stamp, key)| (stamp, key.clone()));

        let Some((stamp, victim)) = victim else {
            return Ok(None);
        };
        if !self.unlink(&victim, queue)? {
            queue.remove(stamp);
            return Err(StorageError::InvalidRegion(format!(
                "eviction queue names unlinked key {victim}"
            )));
        }
        self.evictions += 1;
        trace!(key = %victim, "Evicted entry");
        Ok(Some(victim))
    }
}

impl Partition {
    /// Create a partition over a fresh arena
    pub fn new(
        id: usize,
        bucket_count: usize,
        arena_bytes: usize,
        block_size: usize,
        ceiling_bytes: usize,
    ) -> Self {
        let bucket_count = bucket_count.max(1).next_power_of_two();
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, Vec::new);

        Self {
            id,
            ceiling_bytes,
            state: RwLock::new(PartitionState {
                store: BlockStore::new(arena_bytes, block_size),
                buckets,
                len: 0,
                evictions: 0,
            }),
            queue: Mutex::new(EvictionQueue::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Read a value; `touch` re-stamps the entry for LRU ordering
    pub fn get(
        &self,
        key: &Key,
        touch: Option<&StampClock>,
    ) -> Result<Option<CacheElement>, StorageError> {
        let state = self.state.read();
        let Some(entry) = state.find(key) else {
            return Ok(None);
        };
        let element = state.read(entry).inspect_err(|e| self.report(e))?;

        if let Some(clock) = touch {
            let mut queue = self.queue.lock();
            let stamp = clock.next();
            let old = entry.stamp.swap(stamp, Ordering::Relaxed);
            queue.touch(old, stamp);
        }
        Ok(Some(element))
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.state.read().find(key).is_some()
    }

    /// Insert or overwrite, returning the previous value
    pub fn put(
        &self,
        mut element: CacheElement,
        clocks: &Clocks,
    ) -> Result<Option<CacheElement>, StorageError> {
        let mut state = self.state.write();
        state.check_fits(element.encoded_len())?;
        let mut queue = self.queue.lock();
        let encoded = clocks.seal(&mut element);
        let stamp = clocks.stamps.next();
        state
            .overwrite(&element.key, &encoded, stamp, self.ceiling_bytes, &mut queue)
            .inspect_err(|e| self.report(e))
    }

    /// Insert only when absent; returns the existing value otherwise
    pub fn put_if_absent(
        &self,
        mut element: CacheElement,
        clocks: &Clocks,
    ) -> Result<Option<CacheElement>, StorageError> {
        let mut state = self.state.write();
        if let Some(existing) = state.lookup(&element.key).inspect_err(|e| self.report(e))? {
            return Ok(Some(existing));
        }
        state.check_fits(element.encoded_len())?;
        let mut queue = self.queue.lock();
        let encoded = clocks.seal(&mut element);
        let stamp = clocks.stamps.next();
        state
            .store_new(&element.key, &encoded, stamp, self.ceiling_bytes, &mut queue)
            .inspect_err(|e| self.report(e))?;
        Ok(None)
    }

    /// Swap in `element` only if the current value equals `expected`
    pub fn replace_if(
        &self,
        expected: &CacheElement,
        mut element: CacheElement,
        clocks: &Clocks,
    ) -> Result<bool, StorageError> {
        let mut state = self.state.write();
        match state.lookup(&element.key).inspect_err(|e| self.report(e))? {
            Some(current) if current == *expected => {}
            _ => return Ok(false),
        }
        state.check_fits(element.encoded_len())?;
        let mut queue = self.queue.lock();
        let encoded = clocks.seal(&mut element);
        let stamp = clocks.stamps.next();
        state
            .overwrite(&element.key, &encoded, stamp, self.ceiling_bytes, &mut queue)
            .inspect_err(|e| self.report(e))?;
        Ok(true)
    }

    pub fn remove(&self, key: &Key) -> Result<Option<CacheElement>, StorageError> {
        let mut state = self.state.write();
        let mut queue = self.queue.lock();
        state.detach(key, &mut queue).inspect_err(|e| self.report(e))
    }

    /// Remove only if the current value equals `expected`
    pub fn remove_if(&self, expected: &CacheElement) -> Result<bool, StorageError> {
        let mut state = self.state.write();
        match state.lookup(&expected.key).inspect_err(|e| self.report(e))? {
            Some(current) if current == *expected => {}
            _ => return Ok(false),
        }
        let mut queue = self.queue.lock();
        state
            .unlink(&expected.key, &mut queue)
            .inspect_err(|e| self.report(e))
    }

    /// Stamp of the next victim, if any
    pub fn oldest_stamp(&self) -> Option<u64> {
        self.queue.lock().peek().map(|(stamp, _)| stamp)
    }

    /// Evict the oldest entry of this partition
    pub fn evict_oldest(&self) -> Result<Option<Key>, StorageError> {
        let mut state = self.state.write();
        let mut queue = self.queue.lock();
        state
            .evict_one(&mut queue, None)
            .inspect_err(|e| self.report(e))
    }

    pub fn len(&self) -> usize {
        self.state.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live key; a full scan of all buckets
    pub fn keys(&self) -> HashSet<Key> {
        let state = self.state.read();
        state
            .buckets
            .iter()
            .flat_map(|chain| chain.iter().map(|entry| entry.key.clone()))
            .collect()
    }

    /// Empty every bucket and reset the arena; returns the number removed
    pub fn clear(&self) -> usize {
        let mut state = self.state.write();
        let mut queue = self.queue.lock();
        let removed = state.len;
        for chain in &mut state.buckets {
            chain.clear();
        }
        state.store.clear();
        state.len = 0;
        queue.clear();
        debug!(partition = self.id, removed, "Partition cleared");
        removed
    }

    pub fn close(&self) {
        self.clear();
        self.state.write().store.close();
    }

    pub fn store_size_bytes(&self) -> usize {
        self.state.read().store.store_size_bytes()
    }

    pub fn free_bytes(&self) -> usize {
        self.state.read().store.free_bytes()
    }

    pub fn used_bytes(&self) -> usize {
        self.state.read().store.used_bytes()
    }

    pub fn evictions(&self) -> u64 {
        self.state.read().evictions
    }

    fn report(&self, e: &StorageError) {
        match e {
            StorageError::InvalidRegion(msg) => {
                error!(partition = self.id, "Allocator invariant violated: {}", msg);
            }
            StorageError::Decoding(msg) => {
                error!(partition = self.id, "Corrupt element in arena: {}", msg);
            }
            _ => debug!(partition = self.id, error = %e, "Partition operation failed"),
        }
    }
}
