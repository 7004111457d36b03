//! Map-backed storage
//!
//! Elements are owned directly by a `HashMap` behind one lock. Byte usage is
//! the sum of key and encoded element lengths, so limits behave like the
//! block backend without the block rounding. CAS values are assigned under
//! the write lock, in commit order.

use crate::StorageError;
use crate::storage::eviction::{EvictionPolicy, EvictionQueue, StampClock};
use crate::storage::{CacheElement, CacheStorage, Key};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

struct MemoryEntry {
    element: CacheElement,
    stamp: u64,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<Key, MemoryEntry>,
    queue: EvictionQueue,
    bytes: u64,
    evictions: u64,
    closed: bool,
}

fn weight(element: &CacheElement) -> u64 {
    (element.key.len() + element.encoded_len()) as u64
}

impl MemoryState {
    fn detach(&mut self, key: &Key) -> Option<CacheElement> {
        let entry = self.entries.remove(key)?;
        self.queue.remove(entry.stamp);
        self.bytes -= weight(&entry.element);
        Some(entry.element)
    }

    fn attach(&mut self, element: CacheElement, stamp: u64) {
        self.bytes += weight(&element);
        self.queue.push(stamp, element.key.clone());
        self.entries
            .insert(element.key.clone(), MemoryEntry { element, stamp });
    }

    /// Evict oldest entries other than `written` until both limits hold
    fn enforce_limits(&mut self, written: &Key, max_items: usize, max_bytes: u64) {
        while self.entries.len() > max_items || self.bytes > max_bytes {
            let Some(victim) = self.queue.peek_except(written).map(|(_, key)| key.clone()) else {
                break;
            };
            self.detach(&victim);
            self.evictions += 1;
            trace!(key = %victim, "Evicted entry");
        }
    }
}

/// Single-lock map implementation of [`CacheStorage`]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
    policy: EvictionPolicy,
    max_items: usize,
    max_bytes: u64,
    clock: StampClock,
    cas: StampClock,
}

impl MemoryStorage {
    pub fn new(max_items: usize, max_bytes: u64, policy: EvictionPolicy) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            policy,
            max_items,
            max_bytes,
            clock: StampClock::new(),
            cas: StampClock::new(),
        }
    }

    fn check_fits(&self, state: &MemoryState, element: &CacheElement) -> Result<(), StorageError> {
        let requested = weight(element);
        if state.closed || requested > self.max_bytes {
            return Err(StorageError::OutOfSpace {
                requested: requested as usize,
                available: if state.closed {
                    0
                } else {
                    self.max_bytes.saturating_sub(state.bytes) as usize
                },
            });
        }
        Ok(())
    }

    fn store(&self, state: &mut MemoryState, mut element: CacheElement) -> Option<CacheElement> {
        element.cas_unique = self.cas.next();
        let key = element.key.clone();
        let old = state.detach(&key);
        state.attach(element, self.clock.next());
        state.enforce_limits(&key, self.max_items, self.max_bytes);
        old
    }
}

impl CacheStorage for MemoryStorage {
    fn get(&self, key: &Key) -> Result<Option<CacheElement>, StorageError> {
        if !self.policy.refresh_on_read() {
            let state = self.state.read();
            return Ok(state.entries.get(key).map(|entry| entry.element.clone()));
        }

        let mut state = self.state.write();
        let state = &mut *state;
        let Some(entry) = state.entries.get_mut(key) else {
            return Ok(None);
        };
        let stamp = self.clock.next();
        state.queue.touch(entry.stamp, stamp);
        entry.stamp = stamp;
        Ok(Some(entry.element.clone()))
    }

    fn put(&self, element: CacheElement) -> Result<Option<CacheElement>, StorageError> {
        let mut state = self.state.write();
        self.check_fits(&state, &element)?;
        Ok(self.store(&mut state, element))
    }

    fn put_if_absent(&self, element: CacheElement) -> Result<Option<CacheElement>, StorageError> {
        let mut state = self.state.write();
        if let Some(entry) = state.entries.get(&element.key) {
            return Ok(Some(entry.element.clone()));
        }
        self.check_fits(&state, &element)?;
        self.store(&mut state, element);
        Ok(None)
    }

    fn replace(&self, expected: &CacheElement, element: CacheElement) -> Result<bool, StorageError> {
        if expected.key != element.key {
            return Ok(false);
        }
        let mut state = self.state.write();
        match state.entries.get(&element.key) {
            Some(entry) if entry.element == *expected => {}
            _ => return Ok(false),
        }
        self.check_fits(&state, &element)?;
        self.store(&mut state, element);
        Ok(true)
    }

    fn remove(&self, key: &Key) -> Result<Option<CacheElement>, StorageError> {
        Ok(self.state.write().detach(key))
    }

    fn remove_if(&self, expected: &CacheElement) -> Result<bool, StorageError> {
        let mut state = self.state.write();
        match state.entries.get(&expected.key) {
            Some(entry) if entry.element == *expected => {}
            _ => return Ok(false),
        }
        state.detach(&expected.key);
        Ok(true)
    }

    fn contains_key(&self, key: &Key) -> bool {
        self.state.read().entries.contains_key(key)
    }

    fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    fn keys(&self) -> HashSet<Key> {
        self.state.read().entries.keys().cloned().collect()
    }

    fn clear(&self) {
        let mut state = self.state.write();
        let removed = state.entries.len();
        state.entries.clear();
        state.queue.clear();
        state.bytes = 0;
        debug!(removed, "Memory storage cleared");
    }

    fn close(&self) {
        self.clear();
        self.state.write().closed = true;
    }

    fn capacity(&self) -> usize {
        self.max_items
    }

    fn memory_capacity(&self) -> u64 {
        if self.state.read().closed {
            0
        } else {
            self.max_bytes
        }
    }

    fn memory_used(&self) -> u64 {
        self.state.read().bytes
    }

    fn evictions(&self) -> u64 {
        self.state.read().evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(key: &str, data: &str) -> CacheElement {
        CacheElement::new(key, 0, 0, data.as_bytes())
    }

    #[test]
    fn test_put_get_remove() {
        let storage = MemoryStorage::new(10, 1 << 20, EvictionPolicy::Lru);
        assert!(storage.put(element("a", "1")).unwrap().is_none());
        assert_eq!(storage.get(&Key::from("a")).unwrap().unwrap().data, b"1");
        assert_eq!(storage.put(element("a", "2")).unwrap().unwrap().data, b"1");
        assert_eq!(storage.len(), 1);
        assert!(storage.memory_used() > 0);

        assert_eq!(storage.remove(&Key::from("a")).unwrap().unwrap().data, b"2");
        assert_eq!(storage.memory_used(), 0);
    }

    #[test]
    fn test_fifo_item_limit() {
        let storage = MemoryStorage::new(999, 1 << 24, EvictionPolicy::Fifo);
        for i in 0..1000 {
            storage.put(element(&format!("key{i}"), "v")).unwrap();
        }
        assert_eq!(storage.len(), 999);
        assert!(!storage.contains_key(&Key::from("key0")));
        assert!(storage.contains_key(&Key::from("key999")));
        assert_eq!(storage.evictions(), 1);
    }

    #[test]
    fn test_lru_read_protects_entry() {
        let storage = MemoryStorage::new(2, 1 << 20, EvictionPolicy::Lru);
        storage.put(element("a", "1")).unwrap();
        storage.put(element("b", "2")).unwrap();
        storage.get(&Key::from("a")).unwrap();
        storage.put(element("c", "3")).unwrap();
        assert!(storage.contains_key(&Key::from("a")));
        assert!(!storage.contains_key(&Key::from("b")));
    }

    #[test]
    fn test_byte_limit_keeps_new_entry() {
        let one = weight(&element("a", &"x".repeat(50)));
        let storage = MemoryStorage::new(100, one * 2, EvictionPolicy::Fifo);
        storage.put(element("a", &"x".repeat(50))).unwrap();
        storage.put(element("b", &"x".repeat(50))).unwrap();
        storage.put(element("c", &"x".repeat(50))).unwrap();
        assert_eq!(storage.len(), 2);
        assert!(!storage.contains_key(&Key::from("a")));
        assert!(storage.memory_used() <= one * 2);
    }

    #[test]
    fn test_too_large_is_out_of_space() {
        let storage = MemoryStorage::new(100, 64, EvictionPolicy::Fifo);
        let err = storage.put(element("big", &"x".repeat(100))).unwrap_err();
        assert!(matches!(err, StorageError::OutOfSpace { .. }));
    }

    #[test]
    fn test_conditional_operations() {
        let storage = MemoryStorage::new(10, 1 << 20, EvictionPolicy::Fifo);
        assert!(storage.put_if_absent(element("a", "1")).unwrap().is_none());
        assert!(storage.put_if_absent(element("a", "2")).unwrap().is_some());

        let current = storage.get(&Key::from("a")).unwrap().unwrap();
        assert_eq!(current.cas_unique, 1);
        assert!(storage.replace(&current, element("a", "3")).unwrap());
        assert_eq!(storage.get(&Key::from("a")).unwrap().unwrap().cas_unique, 2);
        assert!(!storage.replace(&current, element("a", "4")).unwrap());
        assert!(!storage.remove_if(&current).unwrap());

        let current = storage.get(&Key::from("a")).unwrap().unwrap();
        assert!(storage.remove_if(&current).unwrap());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_close_rejects_writes() {
        let storage = MemoryStorage::new(10, 1 << 20, EvictionPolicy::Fifo);
        storage.put(element("a", "1")).unwrap();
        storage.close();
        assert!(storage.is_empty());
        assert_eq!(storage.memory_capacity(), 0);
        assert!(storage.put(element("a", "1")).is_err());
    }
}
