//! Extendible hash table for the buffer pool page directory.

use log::debug;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// A thread-safe extendible hash table.
///
/// The directory holds `2^global_depth` slots, each referencing a bucket
/// with a local depth `d <= global_depth`. All slots whose low `d` index
/// bits agree reference the same bucket. A full bucket splits on insert;
/// when its local depth equals the global depth, the directory doubles
/// first.
pub struct ExtendibleHashTable<K, V> {
    bucket_size: usize,
    state: Mutex<TableState<K, V>>,
}

struct TableState<K, V> {
    global_depth: u32,
    num_buckets: usize,
    /// Directory slot -> index into `buckets`.
    dir: Vec<usize>,
    /// Bucket arena; splits append, nothing is ever removed.
    buckets: Vec<Bucket<K, V>>,
}

struct Bucket<K, V> {
    depth: u32,
    items: Vec<(K, V)>,
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates a table whose buckets hold up to `bucket_size` entries.
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size > 0, "bucket_size must be > 0");
        Self {
            bucket_size,
            state: Mutex::new(TableState {
                global_depth: 0,
                num_buckets: 1,
                dir: vec![0],
                buckets: vec![Bucket {
                    depth: 0,
                    items: Vec::new(),
                }],
            }),
        }
    }

    fn hash_of(key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Inserts a key-value pair, overwriting any existing value for the key.
    pub fn insert(&self, key: K, value: V) {
        let hash = Self::hash_of(&key);
        let mut state = self.state.lock();

        loop {
            let slot = (hash as usize) & ((1usize << state.global_depth) - 1);
            let bucket_idx = state.dir[slot];

            {
                let bucket = &mut state.buckets[bucket_idx];
                if let Some(item) = bucket.items.iter_mut().find(|(k, _)| *k == key) {
                    item.1 = value;
                    return;
                }
                if bucket.items.len() < self.bucket_size {
                    bucket.items.push((key, value));
                    return;
                }
            }

            // Full bucket: double the directory if it is at maximum depth,
            // then split it and retry.
            if state.buckets[bucket_idx].depth == state.global_depth {
                let old_size = state.dir.len();
                for i in 0..old_size {
                    let target = state.dir[i];
                    state.dir.push(target);
                }
                state.global_depth += 1;
                debug!("hash directory doubled to depth {}", state.global_depth);
            }

            state.split_bucket(bucket_idx, |k| Self::hash_of(k));
        }
    }

    /// Looks up the value stored for a key.
    pub fn find(&self, key: &K) -> Option<V> {
        let hash = Self::hash_of(key);
        let state = self.state.lock();
        let slot = (hash as usize) & ((1usize << state.global_depth) - 1);
        let bucket = &state.buckets[state.dir[slot]];
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Removes a key. Returns true if it was present.
    pub fn remove(&self, key: &K) -> bool {
        let hash = Self::hash_of(key);
        let mut state = self.state.lock();
        let slot = (hash as usize) & ((1usize << state.global_depth) - 1);
        let bucket_idx = state.dir[slot];
        let bucket = &mut state.buckets[bucket_idx];
        if let Some(pos) = bucket.items.iter().position(|(k, _)| k == key) {
            bucket.items.remove(pos);
            true
        } else {
            false
        }
    }

    /// Returns the global depth of the directory.
    pub fn global_depth(&self) -> u32 {
        self.state.lock().global_depth
    }

    /// Returns the local depth of the bucket referenced by directory slot `dir_index`.
    pub fn local_depth(&self, dir_index: usize) -> u32 {
        let state = self.state.lock();
        state.buckets[state.dir[dir_index]].depth
    }

    /// Returns the number of buckets in use.
    pub fn num_buckets(&self) -> usize {
        self.state.lock().num_buckets
    }
}

impl<K, V> TableState<K, V> {
    /// Splits a full bucket, redistributing its entries by the new
    /// discriminating hash bit and repointing the affected directory slots.
    fn split_bucket(&mut self, bucket_idx: usize, hash_of: impl Fn(&K) -> u64) {
        self.buckets[bucket_idx].depth += 1;
        let depth = self.buckets[bucket_idx].depth;
        let split_mask = 1u64 << (depth - 1);

        let items = std::mem::take(&mut self.buckets[bucket_idx].items);
        let (upper, lower): (Vec<_>, Vec<_>) = items
            .into_iter()
            .partition(|(k, _)| hash_of(k) & split_mask != 0);

        self.buckets[bucket_idx].items = lower;
        let new_idx = self.buckets.len();
        self.buckets.push(Bucket {
            depth,
            items: upper,
        });

        for slot in 0..self.dir.len() {
            if self.dir[slot] == bucket_idx && (slot as u64) & split_mask != 0 {
                self.dir[slot] = new_idx;
            }
        }
        self.num_buckets += 1;
    }
}
