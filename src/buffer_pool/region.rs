use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use super::bh::{BufferHeader, PageKey};

/// `{mutex, dirty_count, priority_hint, bh_list}`. A page is placed in
/// bucket `H(fileid, pgno) mod buckets_per_region`.
pub struct HashBucket {
    pub dirty_count: u32,
    pub bh_list: HashMap<PageKey, Arc<Mutex<BufferHeader>>>,
}

impl HashBucket {
    fn new() -> Self {
        Self {
            dirty_count: 0,
            bh_list: HashMap::new(),
        }
    }
}

/// `{hash_table, global_lru_chain, stats, allocator}`. The pool is
/// split into N independently-locked regions; each page maps
/// deterministically to exactly one region.
pub struct CacheRegion {
    pub buckets: Vec<Mutex<HashBucket>>,
    /// Approximate global LRU chain: a round-robin queue of keys,
    /// walked by the eviction scan. Not authoritative (a key may be
    /// stale if its BH was already evicted by another thread), which
    /// matches the "rough round-robin" the design calls for.
    pub lru: Mutex<VecDeque<PageKey>>,
    pub max_buffers: usize,
    pub buffer_count: Mutex<usize>,
}

impl CacheRegion {
    pub fn new(num_buckets: usize, max_buffers: usize) -> Self {
        let mut buckets = Vec::with_capacity(num_buckets);
        for _ in 0..num_buckets {
            buckets.push(Mutex::new(HashBucket::new()));
        }
        Self {
            buckets,
            lru: Mutex::new(VecDeque::new()),
            max_buffers,
            buffer_count: Mutex::new(0),
        }
    }

    pub fn bucket_index(&self, key: &PageKey) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        use std::hash::{Hash, Hasher};
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.buckets.len()
    }

    pub fn touch_lru(&self, key: PageKey) {
        let mut lru = self.lru.lock().unwrap();
        lru.push_back(key);
    }
}
