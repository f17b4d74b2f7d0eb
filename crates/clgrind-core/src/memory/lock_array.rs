//! Fixed-size hash-bucketed locks keyed by address.
//!
//! Shared simulator state (atomic read-modify-write on global memory, the
//! race detector's kernel-wide access table) is guarded by a bounded array of
//! locks instead of one global lock. Two addresses contend only when they hash
//! to the same bucket.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::hash::Hash;

/// Default number of buckets.
pub const DEFAULT_BUCKETS: usize = 256;

/// Map an address to a bucket. Addresses within the same 8-byte word share
/// a bucket so that every byte of a word-sized access takes the same lock.
#[inline]
fn bucket_of(address: u64, buckets: usize) -> usize {
    let word = address >> 3;
    // Fibonacci hashing spreads consecutive words across buckets
    (word.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize % buckets
}

pub struct LockArray {
    locks: Box<[Mutex<()>]>,
}

impl LockArray {
    pub fn new(buckets: usize) -> Self {
        let buckets = buckets.max(1);
        Self {
            locks: (0..buckets).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Lock the bucket owning `address`.
    pub fn lock(&self, address: u64) -> MutexGuard<'_, ()> {
        self.locks[bucket_of(address, self.locks.len())].lock()
    }
}

impl Default for LockArray {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKETS)
    }
}

impl std::fmt::Debug for LockArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockArray").field("buckets", &self.locks.len()).finish()
    }
}

/// Keys that can be routed to a [`ShardedMap`] bucket.
pub trait ShardKey: Hash + Eq {
    fn shard_address(&self) -> u64;
}

impl ShardKey for u64 {
    fn shard_address(&self) -> u64 {
        *self
    }
}

impl<T: Hash + Eq> ShardKey for (T, u64) {
    fn shard_address(&self) -> u64 {
        self.1
    }
}

/// Concurrent map split into address-hashed shards, each behind its own lock.
pub struct ShardedMap<K, V> {
    shards: Box<[Mutex<HashMap<K, V>>]>,
}

impl<K: ShardKey, V> ShardedMap<K, V> {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Lock the shard owning `key`.
    pub fn shard(&self, key: &K) -> MutexGuard<'_, HashMap<K, V>> {
        self.shards[bucket_of(key.shard_address(), self.shards.len())].lock()
    }

    /// Run `f` on the entry for `key`, creating it with `init` if absent.
    pub fn with_entry<R>(&self, key: K, init: impl FnOnce() -> V, f: impl FnOnce(&mut V) -> R) -> R {
        let mut shard = self.shard(&key);
        f(shard.entry(key).or_insert_with(init))
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.lock().clear();
        }
    }

    /// Remove every entry for which `keep` returns false.
    pub fn retain(&self, mut keep: impl FnMut(&K, &mut V) -> bool) {
        for shard in self.shards.iter() {
            shard.lock().retain(|k, v| keep(k, v));
        }
    }
}

impl<K: ShardKey, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKETS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_same_word_same_bucket() {
        for base in [0u64, 8, 0x1_0000_0000, 0xFFF8] {
            let first = bucket_of(base, DEFAULT_BUCKETS);
            for offset in 1..8 {
                assert_eq!(bucket_of(base + offset, DEFAULT_BUCKETS), first);
            }
        }
    }

    #[test]
    fn test_lock_array_serializes_counter() {
        let locks = Arc::new(LockArray::new(4));
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = locks.lock(64);
                        let v = counter.load(std::sync::atomic::Ordering::Relaxed);
                        counter.store(v + 1, std::sync::atomic::Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 4000);
    }

    #[test]
    fn test_sharded_map_entries() {
        let map: ShardedMap<(u32, u64), u32> = ShardedMap::new(8);
        for addr in 0..100u64 {
            map.with_entry((1, addr), || 0, |v| *v += 1);
        }
        map.with_entry((1, 5), || 0, |v| *v += 1);
        assert_eq!(map.len(), 100);
        assert_eq!(map.shard(&(1, 5)).get(&(1, 5)), Some(&2));
        map.retain(|k, _| k.1 < 10);
        assert_eq!(map.len(), 10);
        map.clear();
        assert!(map.is_empty());
    }
}
