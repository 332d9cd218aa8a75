//! # Descent and Slot Selection
//!
//! Key location in three layers:
//!
//! - `get_slot`: binary search within one node for the slot holding the
//!   largest key not greater than the search key (-1 when the search key
//!   precedes slot 0; an exact hit returns its own slot)
//! - `traverse_tree`: the internal-node variant, mapping that slot to the
//!   child page to descend into
//! - `find_leaf` / `find`: full root-to-leaf descent and point lookup
//!
//! Comparisons are delegated to the database's configured comparator.
//! When a slot key is extended, it is transparently materialized — first
//! from the extended-key cache, then by reassembling the inline prefix with
//! the overflow blob (which also warms the cache).

use std::cmp::Ordering;

use eyre::{ensure, Result};

use crate::db::Database;
use crate::error::{corruption, DbError};
use crate::memory::ByteArena;
use crate::page::PageRc;

use super::key::KeyRef;
use super::node::NodeRef;

impl Database {
    /// Reassembles the full logical key from raw slot bytes, resolving the
    /// extended blob through the cache when needed.
    pub(crate) fn materialize_slot_bytes(&mut self, slot_bytes: &[u8]) -> Result<Vec<u8>> {
        let key = KeyRef::new(slot_bytes);
        if !key.is_extended() {
            return Ok(key.inline_key().to_vec());
        }

        let size = key.size();
        let ext_id = key.extended_id();
        if ext_id == 0 {
            return Err(corruption("extended key with a zero blob id"));
        }
        if let Some(full) = self.extkeys.get(ext_id) {
            return Ok(full.to_vec());
        }

        let mut full = Vec::with_capacity(size);
        full.extend_from_slice(key.inline_key());

        let mut arena = ByteArena::new();
        let overflow_len = self.blobs.read(&mut self.device, ext_id, &mut arena)?;
        full.extend_from_slice(&arena.as_slice()[..overflow_len]);
        ensure!(
            full.len() == size,
            "extended key {} reassembled to {} bytes, slot says {}",
            ext_id,
            full.len(),
            size
        );

        self.extkeys.insert(ext_id, full.clone());
        Ok(full)
    }

    /// Full logical key of a slot in a page.
    pub(crate) fn materialize_slot_key(&mut self, page: &PageRc, slot: usize) -> Result<Vec<u8>> {
        let slot_bytes: Vec<u8> = {
            let p = page.borrow();
            let node = NodeRef::new(p.payload(), self.config.key_size);
            node.slot_bytes(slot).to_vec()
        };
        self.materialize_slot_bytes(&slot_bytes)
    }

    /// Orders `search` relative to the key at `slot`.
    pub(crate) fn compare_slot_key(
        &mut self,
        page: &PageRc,
        slot: usize,
        search: &[u8],
    ) -> Result<Ordering> {
        {
            let p = page.borrow();
            let node = NodeRef::new(p.payload(), self.config.key_size);
            let key = node.key(slot);
            if !key.is_extended() {
                return Ok(self.comparator.compare(search, key.inline_key()));
            }
        }
        let full = self.materialize_slot_key(page, slot)?;
        Ok(self.comparator.compare(search, &full))
    }

    /// Returns the slot whose key is the largest not greater than `key`,
    /// or -1 when `key` precedes slot 0. Exact hits return their slot.
    pub(crate) fn get_slot(&mut self, page: &PageRc, key: &[u8]) -> Result<i32> {
        let count = {
            let p = page.borrow();
            NodeRef::new(p.payload(), self.config.key_size).count()
        } as i32;
        if count == 0 {
            return Ok(-1);
        }

        // Invariant: key(lo) <= key < key(hi).
        let mut lo: i32 = -1;
        let mut hi: i32 = count;
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            match self.compare_slot_key(page, mid as usize, key)? {
                Ordering::Less => hi = mid,
                _ => lo = mid,
            }
        }
        Ok(lo)
    }

    /// Picks the descent slot in an internal node and loads the child it
    /// points to.
    pub(crate) fn traverse_tree(&mut self, page: &PageRc, key: &[u8]) -> Result<(PageRc, i32)> {
        let slot = self.get_slot(page, key)?;
        let child_address = {
            let p = page.borrow();
            let node = NodeRef::new(p.payload(), self.config.key_size);
            if slot == -1 {
                node.ptr_left()
            } else {
                node.key(slot as usize).rid()
            }
        };
        if child_address == 0 {
            return Err(corruption(format!(
                "internal node {} has a zero child pointer at slot {}",
                page.borrow().address(),
                slot
            )));
        }
        Ok((self.fetch_page(child_address)?, slot))
    }

    /// Descends from the root to the leaf covering `key`.
    pub(crate) fn find_leaf(&mut self, key: &[u8]) -> Result<PageRc> {
        if self.root_address == 0 {
            return Err(DbError::KeyNotFound.into());
        }
        let mut page = self.fetch_page(self.root_address)?;
        for _ in 0..64 {
            let is_leaf = {
                let p = page.borrow();
                NodeRef::new(p.payload(), self.config.key_size).is_leaf()
            };
            if is_leaf {
                return Ok(page);
            }
            page = self.traverse_tree(&page, key)?.0;
        }
        Err(corruption("tree deeper than 64 levels"))
    }

    /// Point lookup: materializes the record of `key` into `arena` and
    /// returns its length.
    pub fn find(&mut self, key: &[u8], arena: &mut ByteArena) -> Result<usize> {
        let leaf = self.find_leaf(key)?;
        let slot = self.get_slot(&leaf, key)?;
        if slot < 0 || self.compare_slot_key(&leaf, slot as usize, key)? != Ordering::Equal {
            return Err(DbError::KeyNotFound.into());
        }
        let len = self.read_record_at(&leaf, slot as usize, arena)?;
        self.purge_cache()?;
        Ok(len)
    }

    /// Leftmost leaf of the tree.
    pub(crate) fn leftmost_leaf(&mut self) -> Result<PageRc> {
        if self.root_address == 0 {
            return Err(DbError::KeyNotFound.into());
        }
        let mut page = self.fetch_page(self.root_address)?;
        for _ in 0..64 {
            let (is_leaf, ptr_left) = {
                let p = page.borrow();
                let node = NodeRef::new(p.payload(), self.config.key_size);
                (node.is_leaf(), node.ptr_left())
            };
            if is_leaf {
                return Ok(page);
            }
            ensure!(ptr_left != 0, "internal node lost ptr_left");
            page = self.fetch_page(ptr_left)?;
        }
        Err(corruption("tree deeper than 64 levels"))
    }

    /// Rightmost leaf of the tree.
    pub(crate) fn rightmost_leaf(&mut self) -> Result<PageRc> {
        if self.root_address == 0 {
            return Err(DbError::KeyNotFound.into());
        }
        let mut page = self.fetch_page(self.root_address)?;
        for _ in 0..64 {
            let (is_leaf, count, last_child) = {
                let p = page.borrow();
                let node = NodeRef::new(p.payload(), self.config.key_size);
                let count = node.count();
                let last = if count > 0 {
                    node.key(count - 1).rid()
                } else {
                    node.ptr_left()
                };
                (node.is_leaf(), count, last)
            };
            if is_leaf {
                return Ok(page);
            }
            ensure!(
                count > 0 || last_child != 0,
                "empty internal node on the rightmost path"
            );
            page = self.fetch_page(last_child)?;
        }
        Err(corruption("tree deeper than 64 levels"))
    }

    /// The slot after `slot` in leaf order, crossing to the right sibling
    /// at page boundaries.
    pub(crate) fn leaf_successor(
        &mut self,
        page: &PageRc,
        slot: i32,
    ) -> Result<Option<(PageRc, usize)>> {
        let (count, right) = {
            let p = page.borrow();
            let node = NodeRef::new(p.payload(), self.config.key_size);
            (node.count() as i32, node.right())
        };
        if slot + 1 < count {
            return Ok(Some((page.clone(), (slot + 1) as usize)));
        }
        if right == 0 {
            return Ok(None);
        }
        let sibling = self.fetch_page(right)?;
        let sib_count = {
            let p = sibling.borrow();
            NodeRef::new(p.payload(), self.config.key_size).count()
        };
        ensure!(sib_count > 0, "empty leaf on the sibling chain");
        Ok(Some((sibling, 0)))
    }

    /// The slot before `slot` in leaf order, crossing to the left sibling
    /// at page boundaries. `slot == -1` means "before slot 0".
    pub(crate) fn leaf_predecessor(
        &mut self,
        page: &PageRc,
        slot: i32,
    ) -> Result<Option<(PageRc, usize)>> {
        if slot > 0 {
            return Ok(Some((page.clone(), (slot - 1) as usize)));
        }
        let left = {
            let p = page.borrow();
            NodeRef::new(p.payload(), self.config.key_size).left()
        };
        if left == 0 {
            return Ok(None);
        }
        let sibling = self.fetch_page(left)?;
        let sib_count = {
            let p = sibling.borrow();
            NodeRef::new(p.payload(), self.config.key_size).count()
        };
        ensure!(sib_count > 0, "empty leaf on the sibling chain");
        Ok(Some((sibling, sib_count - 1)))
    }
}
