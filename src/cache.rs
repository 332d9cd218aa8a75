//! # Page Cache
//!
//! Keeps recently used pages in memory and decides which page to drop when
//! the cache is over capacity. Eviction uses the SIEVE policy: each entry
//! has a `visited` flag set on access, and a "hand" sweeps the entries,
//! clearing flags and evicting the first unvisited entry it finds. Pages
//! that are accessed repeatedly get a second chance; pages touched once by
//! a scan are dropped quickly.
//!
//! ## Ownership
//!
//! The cache owns page lifetimes. Everything above it borrows pages via
//! `Rc` clones that must not outlive the current operation; a coupled
//! cursor does *not* extend a page's lifetime. Before a page is evicted the
//! database uncouples every cursor registered on it and flushes it if
//! dirty — that sequencing lives in [`crate::Database::purge_cache`], since
//! it needs the device and the key codec. The cache itself only picks
//! victims: an entry whose `Rc` is currently shared (strong count > 1) is
//! treated as pinned and skipped.
//!
//! ## Thread Safety
//!
//! None. One cache per database handle.

use hashbrown::HashMap;
use tracing::trace;

use crate::page::PageRc;

#[derive(Debug)]
struct CacheEntry {
    address: u64,
    visited: bool,
    page: PageRc,
}

#[derive(Debug)]
pub struct PageCache {
    entries: Vec<CacheEntry>,
    index: HashMap<u64, usize>,
    hand: usize,
    capacity: usize,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
            capacity,
        }
    }

    /// Looks up a cached page and marks it visited.
    pub fn get(&mut self, address: u64) -> Option<PageRc> {
        let idx = *self.index.get(&address)?;
        let entry = &mut self.entries[idx];
        entry.visited = true;
        Some(entry.page.clone())
    }

    /// Looks up a cached page without touching the eviction state. Used by
    /// the purge path so inspecting a victim does not grant it a second
    /// chance.
    pub fn peek(&self, address: u64) -> Option<PageRc> {
        let idx = *self.index.get(&address)?;
        Some(self.entries[idx].page.clone())
    }

    pub fn insert(&mut self, address: u64, page: PageRc) {
        debug_assert!(!self.index.contains_key(&address));
        let idx = self.entries.len();
        self.entries.push(CacheEntry {
            address,
            visited: false,
            page,
        });
        self.index.insert(address, idx);
    }

    /// Removes a page from the cache, returning it to the caller.
    pub fn remove(&mut self, address: u64) -> Option<PageRc> {
        let idx = self.index.remove(&address)?;
        let entry = self.entries.swap_remove(idx);

        if idx < self.entries.len() {
            let moved = self.entries[idx].address;
            self.index.insert(moved, idx);
        }
        if self.hand >= self.entries.len() {
            self.hand = 0;
        }
        Some(entry.page)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_over_capacity(&self) -> bool {
        self.entries.len() > self.capacity
    }

    /// SIEVE sweep: returns the address of the next eviction victim, or
    /// `None` when every entry is pinned. Entries whose `Rc` is shared
    /// outside the cache are pinned.
    pub fn evict_candidate(&mut self) -> Option<u64> {
        if self.entries.is_empty() {
            return None;
        }

        let mut scanned = 0;
        let limit = self.entries.len() * 2;

        loop {
            if scanned >= limit {
                return None;
            }
            scanned += 1;

            let len = self.entries.len();
            let entry = &mut self.entries[self.hand];

            if std::rc::Rc::strong_count(&entry.page) > 1 {
                self.hand = (self.hand + 1) % len;
                continue;
            }
            if entry.visited {
                entry.visited = false;
                self.hand = (self.hand + 1) % len;
                continue;
            }

            trace!(address = entry.address, "eviction candidate");
            return Some(entry.address);
        }
    }

    /// All cached pages, for flush-everything paths.
    pub fn pages(&self) -> impl Iterator<Item = &PageRc> {
        self.entries.iter().map(|e| &e.page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn page(address: u64) -> PageRc {
        let mut p = Page::new(128);
        p.data_mut().address = address;
        Rc::new(RefCell::new(p))
    }

    #[test]
    fn insert_get_remove() {
        let mut cache = PageCache::new(4);
        cache.insert(0, page(0));
        cache.insert(128, page(128));

        assert!(cache.get(0).is_some());
        assert!(cache.get(999).is_none());
        assert_eq!(cache.len(), 2);

        let removed = cache.remove(0).unwrap();
        assert_eq!(removed.borrow().address(), 0);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(0).is_none());
        // The survivor is still indexed correctly after the swap_remove.
        assert!(cache.get(128).is_some());
    }

    #[test]
    fn visited_pages_get_second_chance() {
        let mut cache = PageCache::new(2);
        cache.insert(0, page(0));
        cache.insert(128, page(128));
        cache.insert(256, page(256));

        // Touch 0 so the sweep passes over it once.
        cache.get(0);

        let victim = cache.evict_candidate().unwrap();
        assert_ne!(victim, 0);
    }

    #[test]
    fn pinned_pages_are_skipped() {
        let mut cache = PageCache::new(1);
        cache.insert(0, page(0));
        cache.insert(128, page(128));

        let pinned = cache.get(0).unwrap();
        // 0 is pinned by the outstanding Rc; 128 was just inserted and
        // unvisited.
        let victim = cache.evict_candidate().unwrap();
        assert_eq!(victim, 128);
        drop(pinned);
    }

    #[test]
    fn all_pinned_yields_no_candidate() {
        let mut cache = PageCache::new(1);
        cache.insert(0, page(0));
        let _pin = cache.get(0).unwrap();
        assert_eq!(cache.evict_candidate(), None);
    }
}
