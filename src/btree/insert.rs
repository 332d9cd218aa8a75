//! # Insert with Split
//!
//! Recursive descent to the target leaf, slot insertion, and split
//! propagation back up the call stack:
//!
//! ```text
//! 1. Descend to the leaf covering the key.
//! 2. Exact hit: overwrite the record (OVERWRITE) or fail with KeyExists.
//! 3. Room in the leaf: uncouple affected cursors, open a gap, write the
//!    slot.
//! 4. Full leaf: redistribute all slots plus the new one across the page
//!    and a fresh right sibling. The new sibling's smallest key is copied
//!    upward as the separator (leaf keys stay put; an extended separator
//!    gets its own blob).
//! 5. Full internal node: same redistribution, except the middle key moves
//!    up instead of being copied — its record id seeds the new sibling's
//!    ptr_left.
//! 6. A split reaching the top grows a new root whose ptr_left is the old
//!    root.
//! ```
//!
//! Separators written into internal nodes have the leaf-only record flags
//! stripped and their record-id field overwritten with the child address.

use std::cmp::Ordering;

use eyre::Result;
use tracing::debug;

use crate::db::Database;
use crate::error::{corruption, DbError};
use crate::page::{PageType, PageRc};

use super::key::{
    pack_inline_record, slot_stride, KeyMut, KeyRef, KEY_IS_EXTENDED, KEY_LEAF_ONLY_FLAGS,
};
use super::node::{NodeMut, NodeRef};

/// Replace the record when the key already exists.
pub const OVERWRITE: u32 = 0x0001;
/// Reserved for duplicate-key trees; not supported by this engine.
pub const DUPLICATE: u32 = 0x0002;

/// Separator travelling up the recursion after a split.
pub(crate) struct SplitInfo {
    /// Raw slot bytes of the separator key.
    pub slot_bytes: Vec<u8>,
    /// Its full logical key, for slot selection in the parent.
    pub full_key: Vec<u8>,
    /// Address of the page created by the split.
    pub new_page: u64,
    /// True when the separator is a copy of a key that stayed in a leaf;
    /// its extended blob (if any) must then be duplicated, never aliased.
    pub needs_blob_copy: bool,
}

impl Database {
    pub fn insert(&mut self, key: &[u8], record: &[u8], flags: u32) -> Result<()> {
        if key.len() > u16::MAX as usize {
            return Err(DbError::InvalidArgument("key exceeds 65535 bytes").into());
        }
        if flags & DUPLICATE != 0 {
            return Err(DbError::InvalidArgument("duplicate records are not supported").into());
        }

        if self.root_address == 0 {
            let root = self.alloc_tree_page(PageType::BtreeRoot, true)?;
            self.root_address = root.borrow().address();
            self.header_dirty = true;
        }

        let root = self.fetch_page(self.root_address)?;
        if let Some(split) = self.insert_recursive(&root, key, record, flags)? {
            // The root split: grow the tree by one level.
            let old_root_address = self.root_address;
            let new_root = self.alloc_tree_page(PageType::BtreeRoot, false)?;
            let sep = self.prepare_separator_slot(&split)?;
            {
                let mut p = new_root.borrow_mut();
                let mut node = NodeMut::new(p.payload_mut(), self.config.key_size);
                node.set_ptr_left(old_root_address);
                node.write_slot(0, &sep);
                node.set_count(1);
                p.set_dirty();
            }
            root.borrow_mut().set_page_type(PageType::BtreeIndex)?;
            self.root_address = new_root.borrow().address();
            self.header_dirty = true;
            debug!(new_root = self.root_address, "root split");
        }

        self.purge_cache()?;
        Ok(())
    }

    fn insert_recursive(
        &mut self,
        page: &PageRc,
        key: &[u8],
        record: &[u8],
        flags: u32,
    ) -> Result<Option<SplitInfo>> {
        let is_leaf = {
            let p = page.borrow();
            NodeRef::new(p.payload(), self.config.key_size).is_leaf()
        };
        if is_leaf {
            return self.insert_in_leaf(page, key, record, flags);
        }

        let (child, _) = self.traverse_tree(page, key)?;
        match self.insert_recursive(&child, key, record, flags)? {
            None => Ok(None),
            Some(split) => self.insert_separator(page, split),
        }
    }

    fn insert_in_leaf(
        &mut self,
        page: &PageRc,
        key: &[u8],
        record: &[u8],
        flags: u32,
    ) -> Result<Option<SplitInfo>> {
        let slot = self.get_slot(page, key)?;
        if slot >= 0 && self.compare_slot_key(page, slot as usize, key)? == Ordering::Equal {
            if flags & OVERWRITE != 0 {
                self.overwrite_record(page, slot as usize, record)?;
                return Ok(None);
            }
            return Err(DbError::KeyExists.into());
        }

        let pos = (slot + 1) as usize;
        let slot_bytes = self.build_leaf_slot(key, record)?;
        let count = {
            let p = page.borrow();
            NodeRef::new(p.payload(), self.config.key_size).count()
        };

        if count < self.max_keys as usize {
            self.uncouple_all_cursors(page, pos)?;
            self.insert_slot_raw(page, pos, &slot_bytes)?;
            Ok(None)
        } else {
            self.split_and_insert(page, pos, slot_bytes).map(Some)
        }
    }

    /// Builds the slot for a fresh leaf entry, allocating the extended-key
    /// and record blobs as needed.
    fn build_leaf_slot(&mut self, key: &[u8], record: &[u8]) -> Result<Vec<u8>> {
        let key_size = self.config.key_size as usize;
        let mut buf = vec![0u8; slot_stride(self.config.key_size)];
        let mut flags = 0u8;

        if key.len() <= key_size {
            KeyMut::new(&mut buf).data_mut()[..key.len()].copy_from_slice(key);
        } else {
            let prefix_len = key_size - super::key::EXTENDED_ID_SIZE;
            let blob_id = self.blobs.allocate(&mut self.device, &key[prefix_len..])?;
            let mut slot = KeyMut::new(&mut buf);
            slot.data_mut()[..prefix_len].copy_from_slice(&key[..prefix_len]);
            slot.set_extended_id(blob_id);
            flags |= KEY_IS_EXTENDED;
            self.extkeys.insert(blob_id, key.to_vec());
        }

        let mut rid = [0u8; 8];
        match pack_inline_record(record, &mut rid) {
            Some(record_flags) => flags |= record_flags,
            None => {
                let blob_id = self.blobs.allocate(&mut self.device, record)?;
                rid = blob_id.to_le_bytes();
            }
        }

        let mut slot = KeyMut::new(&mut buf);
        slot.set_flags(flags);
        slot.set_size(key.len());
        slot.set_rid_bytes(&rid);
        Ok(buf)
    }

    /// Turns a propagated separator into writable slot bytes: child address
    /// in the record-id field, leaf-only flags stripped, extended blob
    /// duplicated when the original key stayed in a leaf.
    fn prepare_separator_slot(&mut self, split: &SplitInfo) -> Result<Vec<u8>> {
        let mut sep = split.slot_bytes.clone();
        {
            let mut slot = KeyMut::new(&mut sep);
            let flags = slot.as_ref().flags() & !KEY_LEAF_ONLY_FLAGS;
            slot.set_flags(flags);
            slot.set_rid(split.new_page);
        }

        if split.needs_blob_copy && KeyRef::new(&sep).is_extended() {
            let old_id = KeyRef::new(&sep).extended_id();
            if old_id == 0 {
                return Err(corruption("extended separator with a zero blob id"));
            }
            let new_id = self.deep_copy_blob(old_id)?;
            KeyMut::new(&mut sep).set_extended_id(new_id);
            self.extkeys.insert(new_id, split.full_key.clone());
        }
        Ok(sep)
    }

    fn insert_separator(
        &mut self,
        page: &PageRc,
        split: SplitInfo,
    ) -> Result<Option<SplitInfo>> {
        let sep = self.prepare_separator_slot(&split)?;
        let slot = self.get_slot(page, &split.full_key)?;
        let pos = (slot + 1) as usize;
        let count = {
            let p = page.borrow();
            NodeRef::new(p.payload(), self.config.key_size).count()
        };

        if count < self.max_keys as usize {
            self.uncouple_all_cursors(page, pos)?;
            self.insert_slot_raw(page, pos, &sep)?;
            Ok(None)
        } else {
            self.split_and_insert(page, pos, sep).map(Some)
        }
    }

    /// Gap-insert of prepared slot bytes at `pos`.
    fn insert_slot_raw(&mut self, page: &PageRc, pos: usize, bytes: &[u8]) -> Result<()> {
        let mut p = page.borrow_mut();
        let mut node = NodeMut::new(p.payload_mut(), self.config.key_size);
        let count = node.count();
        node.open_gap(pos);
        node.write_slot(pos, bytes);
        node.set_count(count + 1);
        p.set_dirty();
        Ok(())
    }

    /// Splits a full node, inserting `slot_bytes` at logical position `pos`
    /// as part of the redistribution, and returns the separator for the
    /// parent.
    fn split_and_insert(
        &mut self,
        page: &PageRc,
        pos: usize,
        slot_bytes: Vec<u8>,
    ) -> Result<SplitInfo> {
        self.uncouple_all_cursors(page, 0)?;

        let key_size = self.config.key_size;
        let (mut entries, is_leaf, old_right, page_address) = {
            let p = page.borrow();
            let node = NodeRef::new(p.payload(), key_size);
            let entries: Vec<Vec<u8>> = (0..node.count())
                .map(|i| node.slot_bytes(i).to_vec())
                .collect();
            (entries, node.is_leaf(), node.right(), p.address())
        };
        entries.insert(pos, slot_bytes);

        let new_page = self.alloc_tree_page(PageType::BtreeIndex, is_leaf)?;
        let new_address = new_page.borrow().address();
        let mid = entries.len() / 2;

        let (sep_bytes, needs_blob_copy) = if is_leaf {
            // Left keeps [..mid], right takes [mid..]; the separator is a
            // copy of the right page's smallest key.
            {
                let mut p = page.borrow_mut();
                let mut node = NodeMut::new(p.payload_mut(), key_size);
                node.set_count(mid);
                p.set_dirty();
            }
            {
                let mut np = new_page.borrow_mut();
                let mut node = NodeMut::new(np.payload_mut(), key_size);
                for (i, bytes) in entries[mid..].iter().enumerate() {
                    node.write_slot(i, bytes);
                }
                node.set_count(entries.len() - mid);
                np.set_dirty();
            }
            (entries[mid].clone(), true)
        } else {
            // The middle key moves up; its child pointer seeds the new
            // sibling's ptr_left.
            let promoted = entries[mid].clone();
            {
                let mut p = page.borrow_mut();
                let mut node = NodeMut::new(p.payload_mut(), key_size);
                node.set_count(mid);
                p.set_dirty();
            }
            {
                let mut np = new_page.borrow_mut();
                let mut node = NodeMut::new(np.payload_mut(), key_size);
                node.set_ptr_left(KeyRef::new(&promoted).rid());
                for (i, bytes) in entries[mid + 1..].iter().enumerate() {
                    node.write_slot(i, bytes);
                }
                node.set_count(entries.len() - mid - 1);
                np.set_dirty();
            }
            (promoted, false)
        };

        // Splice the new page into the sibling list.
        {
            let mut p = page.borrow_mut();
            let mut np = new_page.borrow_mut();
            let mut node = NodeMut::new(p.payload_mut(), key_size);
            let mut new_node = NodeMut::new(np.payload_mut(), key_size);
            new_node.set_left(page_address);
            new_node.set_right(old_right);
            node.set_right(new_address);
        }
        if old_right != 0 {
            let right_page = self.fetch_page(old_right)?;
            let mut rp = right_page.borrow_mut();
            let mut node = NodeMut::new(rp.payload_mut(), key_size);
            node.set_left(new_address);
            rp.set_dirty();
        }

        // Rewrite the left page's surviving slots (pos may have landed in
        // either half).
        {
            let mut p = page.borrow_mut();
            let mut node = NodeMut::new(p.payload_mut(), key_size);
            for (i, bytes) in entries[..mid].iter().enumerate() {
                node.write_slot(i, bytes);
            }
        }

        let full_key = self.materialize_slot_bytes(&sep_bytes)?;
        debug!(
            page = page_address,
            new_page = new_address,
            leaf = is_leaf,
            "split node"
        );

        Ok(SplitInfo {
            slot_bytes: sep_bytes,
            full_key,
            new_page: new_address,
            needs_blob_copy,
        })
    }
}
