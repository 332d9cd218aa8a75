//! # Extended-Key Cache
//!
//! Keys longer than the node's inline capacity keep a prefix in the slot
//! and overflow into a blob. Comparing such a key means reassembling prefix
//! and overflow, which costs a device read; this cache maps the overflow
//! blob id to the materialized full key so repeated comparisons on the same
//! key (binary searches revisit the same separators constantly) hit memory.
//!
//! Entries are invalidated whenever their blob is freed — the blob id may
//! be reused by a later allocation, and a stale entry would then alias a
//! different key.

use hashbrown::HashMap;

#[derive(Debug, Default)]
pub struct ExtKeyCache {
    map: HashMap<u64, Vec<u8>>,
    hits: u64,
    misses: u64,
}

impl ExtKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the full key bytes for `blob_id`.
    pub fn insert(&mut self, blob_id: u64, key: Vec<u8>) {
        debug_assert!(blob_id != 0, "extended blob id must not be zero");
        self.map.insert(blob_id, key);
    }

    pub fn get(&mut self, blob_id: u64) -> Option<&[u8]> {
        match self.map.get(&blob_id) {
            Some(key) => {
                self.hits += 1;
                Some(key.as_slice())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Drops the entry for a freed blob.
    pub fn remove(&mut self, blob_id: u64) {
        self.map.remove(&blob_id);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn hit_rate(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut cache = ExtKeyCache::new();
        cache.insert(4096, b"a long key that overflowed".to_vec());

        assert_eq!(cache.get(4096), Some(&b"a long key that overflowed"[..]));
        assert_eq!(cache.get(8192), None);

        cache.remove(4096);
        assert_eq!(cache.get(4096), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let mut cache = ExtKeyCache::new();
        cache.insert(4096, vec![1, 2, 3]);
        cache.get(4096);
        cache.get(4096);
        cache.get(5000);
        assert_eq!(cache.hit_rate(), (2, 1));
    }
}
