// Copyright 2025 permafrost Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt::Debug, hash::Hash, ops::Deref, sync::Arc};

use ahash::RandomState;
use equivalent::Equivalent;
use parking_lot::Mutex;
use permafrost_common::{code::HashBuilder, strict_assert, strict_assert_eq};

use crate::{
    eviction::Eviction,
    indexer::HashTableIndexer,
    record::{Data, Record},
};

/// The bounded servant cache.
///
/// A single-monitor cache: one mutex guards the indexer, the eviction lists and the usage
/// accounting, which is the exact concurrency model the evictor needs for its pinning invariant.
/// The capacity is a soft cap: eviction stops early when only pinned records remain, so the cache
/// may temporarily hold more than `capacity` records while every resident record is checked out.
///
/// Holding a [`CacheEntry`] pins the underlying record; eviction never removes a pinned record.
/// Deallocation of evicted records happens outside the monitor.
pub struct Cache<E, S = RandomState>
where
    E: Eviction,
    S: HashBuilder,
{
    inner: Arc<CacheInner<E, S>>,
}

struct CacheShard<E>
where
    E: Eviction,
{
    eviction: E,
    indexer: HashTableIndexer<E::Key, E::Value>,

    usage: usize,
    capacity: usize,
}

struct CacheInner<E, S>
where
    E: Eviction,
    S: HashBuilder,
{
    shard: Mutex<CacheShard<E>>,
    hash_builder: S,
}

impl<E, S> Clone for Cache<E, S>
where
    E: Eviction,
    S: HashBuilder,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E, S> Debug for Cache<E, S>
where
    E: Eviction,
    S: HashBuilder,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").finish()
    }
}

impl<E> Cache<E, RandomState>
where
    E: Eviction,
{
    /// Create a cache with the given target capacity and the default hash builder.
    pub fn new(capacity: usize) -> Self {
        Self::with_hash_builder(capacity, RandomState::default())
    }
}

impl<E, S> Cache<E, S>
where
    E: Eviction,
    S: HashBuilder,
{
    /// Create a cache with the given target capacity and hash builder.
    pub fn with_hash_builder(capacity: usize, hash_builder: S) -> Self {
        let inner = CacheInner {
            shard: Mutex::new(CacheShard {
                eviction: E::default(),
                indexer: HashTableIndexer::default(),
                usage: 0,
                capacity,
            }),
            hash_builder,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Insert a record, returning a pinned handle to it.
    ///
    /// An existing record of the same key is replaced; handles over the replaced record stay
    /// usable but the record is no longer resident.
    pub fn insert(&self, key: E::Key, value: E::Value) -> CacheEntry<E, S> {
        let hash = self.inner.hash_builder.hash_one(&key);
        let record = Arc::new(Record::new(Data { key, value, hash }));

        let mut garbage = vec![];

        {
            let mut shard = self.inner.shard.lock();

            let target = shard.capacity.saturating_sub(1);
            Self::evict(&mut shard, target, &mut garbage);

            if let Some(old) = shard.indexer.insert(record.clone()) {
                strict_assert!(!old.is_in_indexer());
                if old.is_in_eviction() {
                    shard.eviction.remove(&old);
                }
                shard.usage -= 1;
                tracing::trace!(hash, "[cache]: replace record");
                garbage.push(old);
            }
            strict_assert!(record.is_in_indexer());

            shard.eviction.push(record.clone());
            shard.usage += 1;

            // The handle is created within the monitor so the refcount and the pin stay in step.
            record.inc_refs(1);
            shard.eviction.acquire(&record);
        }

        // Deallocate data out of the monitor.
        drop(garbage);

        CacheEntry {
            inner: self.inner.clone(),
            record,
        }
    }

    /// Look up a record, returning a pinned handle on hit.
    pub fn get<Q>(&self, key: &Q) -> Option<CacheEntry<E, S>>
    where
        Q: Hash + Equivalent<E::Key> + ?Sized,
    {
        let hash = self.inner.hash_builder.hash_one(key);

        let record = {
            let mut shard = self.inner.shard.lock();
            let record = shard.indexer.get(hash, key).cloned()?;
            record.inc_refs(1);
            shard.eviction.acquire(&record);
            record
        };

        Some(CacheEntry {
            inner: self.inner.clone(),
            record,
        })
    }

    /// Drop a record from the cache, regardless of pinning.
    ///
    /// Outstanding handles keep the record alive but it is no longer resident; the next lookup
    /// misses. Returns a handle over the removed record, if it was resident.
    pub fn remove<Q>(&self, key: &Q) -> Option<CacheEntry<E, S>>
    where
        Q: Hash + Equivalent<E::Key> + ?Sized,
    {
        let hash = self.inner.hash_builder.hash_one(key);

        let mut shard = self.inner.shard.lock();

        let record = shard.indexer.remove(hash, key)?;
        if record.is_in_eviction() {
            shard.eviction.remove(&record);
        }
        strict_assert!(!record.is_in_indexer());
        strict_assert!(!record.is_in_eviction());
        shard.usage -= 1;

        record.inc_refs(1);
        tracing::trace!(hash, "[cache]: remove record");

        Some(CacheEntry {
            inner: self.inner.clone(),
            record,
        })
    }

    /// Whether a record for the key is resident.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: Hash + Equivalent<E::Key> + ?Sized,
    {
        let hash = self.inner.hash_builder.hash_one(key);
        self.inner.shard.lock().indexer.get(hash, key).is_some()
    }

    /// Update the target capacity and evict down to it where possible.
    pub fn resize(&self, capacity: usize) {
        let mut garbage = vec![];
        {
            let mut shard = self.inner.shard.lock();
            shard.capacity = capacity;
            Self::evict(&mut shard, capacity, &mut garbage);
        }
        drop(garbage);
    }

    /// Drop every resident record.
    pub fn clear(&self) {
        let mut garbage = vec![];
        {
            let mut shard = self.inner.shard.lock();
            garbage.extend(shard.indexer.drain());
            shard.eviction.clear();
            shard.usage = 0;
        }
        drop(garbage);
    }

    /// The current resident record count.
    pub fn usage(&self) -> usize {
        self.inner.shard.lock().usage
    }

    /// The target capacity.
    pub fn capacity(&self) -> usize {
        self.inner.shard.lock().capacity
    }

    fn evict(shard: &mut CacheShard<E>, target: usize, garbage: &mut Vec<Arc<Record<E::Key, E::Value>>>) {
        // Evict overflow records. Stops early when only pinned records remain.
        while shard.usage > target {
            let evicted = match shard.eviction.pop() {
                Some(evicted) => evicted,
                None => break,
            };

            let e = shard.indexer.remove(evicted.hash(), evicted.key()).unwrap();
            strict_assert_eq!(Arc::as_ptr(&evicted), Arc::as_ptr(&e));

            strict_assert!(!evicted.is_in_indexer());
            strict_assert!(!evicted.is_in_eviction());

            shard.usage -= 1;
            tracing::trace!(hash = evicted.hash(), "[cache]: evict record");

            garbage.push(evicted);
        }
    }
}

/// A handle over a resident record.
///
/// The record stays pinned (ineligible for eviction) for as long as any handle over it exists;
/// dropping the last handle returns the record to the eviction order at the most-recently-used
/// position.
pub struct CacheEntry<E, S = RandomState>
where
    E: Eviction,
    S: HashBuilder,
{
    inner: Arc<CacheInner<E, S>>,
    record: Arc<Record<E::Key, E::Value>>,
}

impl<E, S> Debug for CacheEntry<E, S>
where
    E: Eviction,
    S: HashBuilder,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry").field("record", &self.record).finish()
    }
}

impl<E, S> Drop for CacheEntry<E, S>
where
    E: Eviction,
    S: HashBuilder,
{
    fn drop(&mut self) {
        if self.record.dec_refs(1) == 0 {
            let mut shard = self.inner.shard.lock();
            // A concurrent lookup may have revived the record between the decrement and the
            // monitor acquisition; the recheck keeps "handle exists => pinned" exact.
            if self.record.refs() == 0 {
                shard.eviction.release(&self.record);
            }
        }
    }
}

impl<E, S> Clone for CacheEntry<E, S>
where
    E: Eviction,
    S: HashBuilder,
{
    fn clone(&self) -> Self {
        self.record.inc_refs(1);
        Self {
            inner: self.inner.clone(),
            record: self.record.clone(),
        }
    }
}

impl<E, S> Deref for CacheEntry<E, S>
where
    E: Eviction,
    S: HashBuilder,
{
    type Target = E::Value;

    fn deref(&self) -> &Self::Target {
        self.value()
    }
}

impl<E, S> CacheEntry<E, S>
where
    E: Eviction,
    S: HashBuilder,
{
    /// The record hash.
    pub fn hash(&self) -> u64 {
        self.record.hash()
    }

    /// The record key.
    pub fn key(&self) -> &E::Key {
        self.record.key()
    }

    /// The record value.
    pub fn value(&self) -> &E::Value {
        self.record.value()
    }

    /// The handle count over the record.
    pub fn refs(&self) -> usize {
        self.record.refs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::lru::Lru;

    type TestCache = Cache<Lru<u64, u64>>;

    #[test]
    fn test_insert_get_remove() {
        let cache: TestCache = Cache::new(4);

        let e1 = cache.insert(1, 10);
        assert_eq!(*e1.value(), 10);
        assert_eq!(cache.usage(), 1);
        drop(e1);

        let e1 = cache.get(&1).expect("resident");
        assert_eq!(*e1, 10);
        drop(e1);

        let removed = cache.remove(&1).expect("resident");
        assert_eq!(*removed.value(), 10);
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.usage(), 0);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache: TestCache = Cache::new(3);

        drop(cache.insert(1, 1));
        drop(cache.insert(2, 2));
        drop(cache.insert(3, 3));

        // Touch 1 so 2 becomes the LRU victim.
        drop(cache.get(&1));

        drop(cache.insert(4, 4));
        assert_eq!(cache.usage(), 3);
        assert!(cache.get(&2).is_none());
        assert!(cache.get(&1).is_some());
        assert!(cache.get(&3).is_some());
        assert!(cache.get(&4).is_some());
    }

    #[test]
    fn test_pinned_records_survive_eviction() {
        let cache: TestCache = Cache::new(1);

        let e1 = cache.insert(1, 1);

        // Capacity pressure cannot evict the pinned record; the cache overshoots instead.
        let e2 = cache.insert(2, 2);
        assert_eq!(cache.usage(), 2);
        assert!(cache.get(&1).is_some());

        // Releasing makes them evictable again.
        drop(e1);
        drop(e2);
        drop(cache.insert(3, 3));
        assert_eq!(cache.usage(), 1);
        assert!(cache.get(&1).is_none());
        assert!(cache.get(&2).is_none());
    }

    #[test]
    fn test_remove_pinned() {
        let cache: TestCache = Cache::new(4);

        let e1 = cache.insert(1, 1);
        let removed = cache.remove(&1).expect("resident");

        // The record is gone from the cache but the outstanding handle still reads it.
        assert!(cache.get(&1).is_none());
        assert_eq!(*e1.value(), 1);
        assert_eq!(cache.usage(), 0);

        drop(removed);
        drop(e1);
    }

    #[test]
    fn test_replace() {
        let cache: TestCache = Cache::new(4);

        let old = cache.insert(1, 1);
        let new = cache.insert(1, 100);

        assert_eq!(cache.usage(), 1);
        assert_eq!(*old.value(), 1);
        assert_eq!(*new.value(), 100);
        assert_eq!(cache.get(&1).map(|e| *e.value()), Some(100));
    }

    #[test]
    fn test_resize() {
        let cache: TestCache = Cache::new(4);
        for i in 0..4 {
            drop(cache.insert(i, i));
        }
        assert_eq!(cache.usage(), 4);

        cache.resize(2);
        assert_eq!(cache.capacity(), 2);
        assert_eq!(cache.usage(), 2);
        assert!(cache.get(&0).is_none());
        assert!(cache.get(&1).is_none());
        assert!(cache.get(&2).is_some());
        assert!(cache.get(&3).is_some());
    }

    #[test]
    fn test_clear() {
        let cache: TestCache = Cache::new(4);
        let pinned = cache.insert(1, 1);
        drop(cache.insert(2, 2));

        cache.clear();
        assert_eq!(cache.usage(), 0);
        assert!(cache.get(&1).is_none());
        assert_eq!(*pinned.value(), 1);
    }

    #[test_log::test]
    fn test_concurrent_handles() {
        let cache: TestCache = Cache::new(2);
        let cache2 = cache.clone();

        let e = cache.insert(1, 1);
        let handles = (0..8)
            .map(|_| {
                let c = cache2.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(e) = c.get(&1) {
                            assert_eq!(*e.value(), 1);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        drop(e);
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.get(&1).is_some());
    }
}
