//! Async LRU cache for metadata clusters.
//!
//! Entries are loaded through a [`CacheLoader`] on a miss.  Metadata is written through to the
//! image whenever it changes, so entries are never dirty and evicting one just drops it.

use crate::error::Result;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::trace;

/// Loads cache entries from the image.
pub(crate) trait CacheLoader: Send + Sync {
    /// Identifies an entry, e.g. by the cluster it is stored in.
    type Key: Copy + Debug + Eq + Hash + Send + Sync;

    /// What is cached.
    type Value: Send + Sync;

    /// Read the object stored under `key`.
    #[allow(async_fn_in_trait)] // No need for Send
    async fn load(&self, key: Self::Key) -> Result<Self::Value>;
}

/// One cached object.
struct Slot<V> {
    /// The object; shared with users.
    value: Arc<V>,

    /// Clock value of the last access.
    used_at: AtomicU64,
}

/// Keeps up to `capacity` recently used objects.
///
/// Objects still held outside the cache are never evicted.  If all of them are held, the cache
/// grows beyond its capacity until some are released.
pub(crate) struct AsyncLruCache<L: CacheLoader> {
    /// Loads objects on misses.
    loader: L,

    /// Cached objects.
    slots: RwLock<HashMap<L::Key, Slot<L::Value>>>,

    /// Logical clock, advanced on every access.
    clock: AtomicU64,

    /// Number of objects to keep.
    capacity: usize,
}

impl<L: CacheLoader> AsyncLruCache<L> {
    /// Empty cache keeping up to `capacity` objects loaded by `loader`.
    pub fn new(loader: L, capacity: usize) -> Self {
        AsyncLruCache {
            loader,
            slots: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            capacity,
        }
    }

    #[cfg(test)]
    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Return the cached object for `key` and mark it as used.
    fn hit(&self, slots: &HashMap<L::Key, Slot<L::Value>>, key: L::Key) -> Option<Arc<L::Value>> {
        let slot = slots.get(&key)?;
        slot.used_at
            .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        Some(Arc::clone(&slot.value))
    }

    /// The object for `key`, loaded if not cached.
    pub async fn get_or_insert(&self, key: L::Key) -> Result<Arc<L::Value>> {
        if let Some(value) = self.hit(&*self.slots.read().await, key) {
            return Ok(value);
        }

        // Loading under the write lock keeps concurrent misses from loading twice
        let mut slots = self.slots.write().await;
        if let Some(value) = self.hit(&slots, key) {
            return Ok(value);
        }
        let value = Arc::new(self.loader.load(key).await?);
        self.put(&mut slots, key, Arc::clone(&value));
        Ok(value)
    }

    /// Cache `value` under `key`, replacing what was there.
    pub async fn insert(&self, key: L::Key, value: Arc<L::Value>) {
        let mut slots = self.slots.write().await;
        self.put(&mut slots, key, value);
    }

    /// Drop the object for `key`, if cached.
    pub async fn remove(&self, key: L::Key) -> Option<Arc<L::Value>> {
        self.slots.write().await.remove(&key).map(|slot| slot.value)
    }

    /// Drop everything.
    pub async fn clear(&self) {
        self.slots.write().await.clear();
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Store `value`, evicting if the cache is full.
    fn put(&self, slots: &mut HashMap<L::Key, Slot<L::Value>>, key: L::Key, value: Arc<L::Value>) {
        if !slots.contains_key(&key) {
            self.make_room(slots);
        }
        let used_at = AtomicU64::new(self.clock.fetch_add(1, Ordering::Relaxed));
        slots.insert(key, Slot { value, used_at });
    }

    /// Evict least recently used objects until one more fits.
    fn make_room(&self, slots: &mut HashMap<L::Key, Slot<L::Value>>) {
        while slots.len() >= self.capacity {
            let victim = slots
                .iter()
                .filter(|(_, slot)| Arc::strong_count(&slot.value) == 1)
                .min_by_key(|(_, slot)| slot.used_at.load(Ordering::Relaxed))
                .map(|(key, _)| *key);

            match victim {
                Some(key) => {
                    trace!("Evicting {key:?} from cache");
                    slots.remove(&key);
                }
                None => {
                    trace!("All {} cached objects in use, going over capacity", slots.len());
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Returns the key doubled, counting loads.
    #[derive(Default)]
    struct Doubler {
        loads: AtomicU64,
    }

    impl Doubler {
        fn loads(&self) -> u64 {
            self.loads.load(Ordering::Relaxed)
        }
    }

    impl CacheLoader for Doubler {
        type Key = u64;
        type Value = u64;

        async fn load(&self, key: u64) -> Result<u64> {
            self.loads.fetch_add(1, Ordering::Relaxed);
            Ok(key * 2)
        }
    }

    #[tokio::test]
    async fn hits_do_not_reload() {
        let cache = AsyncLruCache::new(Doubler::default(), 4);
        assert_eq!(*cache.get_or_insert(3).await.unwrap(), 6);
        assert_eq!(*cache.get_or_insert(3).await.unwrap(), 6);
        assert_eq!(cache.loader().loads(), 1);
    }

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let cache = AsyncLruCache::new(Doubler::default(), 2);
        cache.get_or_insert(1).await.unwrap();
        cache.get_or_insert(2).await.unwrap();
        // 2 is older than 1 now
        cache.get_or_insert(1).await.unwrap();
        cache.get_or_insert(3).await.unwrap();
        assert_eq!(cache.len().await, 2);

        let loads = cache.loader().loads();
        cache.get_or_insert(1).await.unwrap();
        assert_eq!(cache.loader().loads(), loads);
        cache.get_or_insert(2).await.unwrap();
        assert_eq!(cache.loader().loads(), loads + 1);
    }

    #[tokio::test]
    async fn held_objects_stay() {
        let cache = AsyncLruCache::new(Doubler::default(), 1);
        let held = cache.get_or_insert(1).await.unwrap();
        cache.get_or_insert(2).await.unwrap();
        assert_eq!(cache.len().await, 2);
        drop(held);
        cache.get_or_insert(3).await.unwrap();
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn insert_replaces() {
        let cache = AsyncLruCache::new(Doubler::default(), 2);
        cache.insert(5, Arc::new(42)).await;
        assert_eq!(*cache.get_or_insert(5).await.unwrap(), 42);
        cache.insert(5, Arc::new(43)).await;
        assert_eq!(*cache.get_or_insert(5).await.unwrap(), 43);
        assert_eq!(cache.loader().loads(), 0);
        cache.clear().await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn removed_entries_are_reloaded() {
        let cache = AsyncLruCache::new(Doubler::default(), 4);
        cache.insert(7, Arc::new(1)).await;
        assert_eq!(cache.remove(7).await.map(|v| *v), Some(1));
        assert!(cache.remove(7).await.is_none());
        assert_eq!(*cache.get_or_insert(7).await.unwrap(), 14);
        assert_eq!(cache.loader().loads(), 1);
    }
}
