use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use lru::LruCache;

use crate::listener::Artifact;

struct Entry<V> {
    value: Arc<V>,
    /// The [`Artifact::byte_size`] at insertion time.
    size: u64,
}

/// An in-memory LRU cache bounded by the total byte size of its artifacts.
///
/// Every [`put`](Self::put) evicts least recently used entries until the resident artifacts fit
/// into the capacity again. This includes the entry that was just inserted, so an artifact larger
/// than the whole capacity is never retained, and inserting it flushes the cache.
///
/// The cache itself is not synchronized, the [`Loader`](crate::Loader) guards it together with its
/// [`TaskRegistry`](crate::TaskRegistry).
pub struct SizedCache<K, V> {
    entries: LruCache<K, Entry<V>>,
    capacity: u64,
    total_size: u64,
}

impl<K: Hash + Eq, V: Artifact> SizedCache<K, V> {
    /// Creates an empty cache holding at most `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity,
            total_size: 0,
        }
    }

    /// Looks up `key` and marks it as most recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|entry| Arc::clone(&entry.value))
    }

    /// Inserts or replaces the artifact for `key` and trims the cache back to its capacity.
    ///
    /// Returns the number of evicted entries. A replaced entry is not counted as evicted.
    pub fn put(&mut self, key: K, value: Arc<V>) -> usize {
        let size = value.byte_size();
        if let Some(previous) = self.entries.put(key, Entry { value, size }) {
            self.total_size -= previous.size;
        }
        self.total_size += size;
        self.trim()
    }

    /// Drops all entries.
    pub fn evict_all(&mut self) {
        self.entries.clear();
        self.total_size = 0;
    }

    /// The number of resident entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The sum of the sizes of all resident entries.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// The maximum accumulated size of resident entries.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn trim(&mut self) -> usize {
        let mut evicted = 0;
        while self.total_size > self.capacity {
            let Some((_, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.total_size -= entry.size;
            evicted += 1;
        }
        evicted
    }
}

impl<K: Hash + Eq, V> fmt::Debug for SizedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizedCache")
            .field("entries", &self.entries.len())
            .field("total_size", &self.total_size)
            .field("capacity", &self.capacity)
            .finish()
    }
}
