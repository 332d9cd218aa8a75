//! # Erase with Rebalance
//!
//! Deletion is structured as a recursive descent that records rebalance
//! context on the way down and repairs the tree on the way back up:
//!
//! ```text
//! erase_recursive(page, left, right, lanchor, ranchor, parent)
//! ```
//!
//! `left`/`right` are the page addresses of the search-path siblings at the
//! current level; `lanchor`/`ranchor` are the internal nodes holding the
//! separators bounding this subtree on each side.
//!
//! ## The mergepage
//!
//! On the way down, each node updates the scratchpad: a node with more than
//! the minimum key count clears the recorded `mergepage`; an under-full
//! node records itself if nothing deeper has claimed the slot. After the
//! recursion, `mergepage` names the topmost page of the deepest under-full
//! suffix of the search path — the page whose repair the unwind is
//! obligated to arrange.
//!
//! ## Repair selection
//!
//! With both siblings loaded (where present), `rebalance` picks:
//!
//! - no siblings: nothing for a leaf; for an internal node the tree height
//!   shrinks — the `ptr_left` child is returned as the new root candidate
//! - both missing-or-under-full: merge with the sibling whose separator
//!   lives in the *current* parent, so the unwinding parent's
//!   `remove_entry` drops exactly the separator of the page that vanished
//! - one side under-full: merge into it if this page is the recorded
//!   mergepage and the other anchor is not the parent; otherwise shift
//!   from the healthy side
//! - both healthy, same anchor: shift from the larger sibling
//! - both healthy, different anchors: shift across the boundary whose
//!   anchor is the parent (the more local edit)
//!
//! Merges return the freed page up the stack; the parent removes the
//! separator pointing at it and then runs its own rebalance. A root left
//! with a single child collapses: the child is promoted, retyped as the
//! root page, and the old root is freed.
//!
//! Every structural primitive uncouples the cursors registered on the
//! pages it is about to renumber, and propagates any failure doing so.

use std::cmp::Ordering;

use eyre::{ensure, Result};
use tracing::debug;

use crate::db::Database;
use crate::error::{corruption, DbError};
use crate::page::{PageRc, PageType};

use super::key::{unpack_record, InlineRecord, KeyRef, KEY_IS_EXTENDED, KEY_LEAF_ONLY_FLAGS};
use super::node::{copy_slots, min_keys, NodeMut, NodeRef};

/// Per-erase transient state carried through the recursion.
struct ErasePad<'a> {
    /// The key being erased.
    key: &'a [u8],
    /// Topmost page observed under-full on the current path (0 = none).
    mergepage: u64,
    /// Record-id field of the removed key, for record disposal.
    rid: [u8; 8],
    /// Flags of the removed key.
    key_flags: u8,
    /// Flags of the erase call itself (reserved).
    #[allow(dead_code)]
    flags: u32,
}

/// Plain header facts about a node, read in one borrow.
struct NodeFacts {
    address: u64,
    count: usize,
    is_leaf: bool,
    ptr_left: u64,
    left: u64,
    right: u64,
}

impl Database {
    fn facts(&self, page: &PageRc) -> NodeFacts {
        let p = page.borrow();
        let node = NodeRef::new(p.payload(), self.config.key_size);
        NodeFacts {
            address: p.address(),
            count: node.count(),
            is_leaf: node.is_leaf(),
            ptr_left: node.ptr_left(),
            left: node.left(),
            right: node.right(),
        }
    }

    fn slot_bytes_of(&self, page: &PageRc, slot: usize) -> Vec<u8> {
        let p = page.borrow();
        NodeRef::new(p.payload(), self.config.key_size)
            .slot_bytes(slot)
            .to_vec()
    }

    /// Erases `key` from the tree. The removed key's record blob (if any)
    /// is freed as well.
    pub fn erase(&mut self, key: &[u8]) -> Result<()> {
        self.erase_with_flags(key, 0)
    }

    pub fn erase_with_flags(&mut self, key: &[u8], flags: u32) -> Result<()> {
        if self.root_address == 0 {
            return Err(DbError::KeyNotFound.into());
        }
        let root = self.fetch_page(self.root_address)?;
        let mut pad = ErasePad {
            key,
            mergepage: 0,
            rid: [0; 8],
            key_flags: 0,
            flags,
        };

        let new_root = self.erase_recursive(&root, 0, 0, 0, 0, None, &mut pad)?;
        if let Some(promoted) = new_root {
            self.collapse_root(&promoted)?;
            self.free_page(&root)?;
        }

        // Dispose of the record the key owned.
        if let InlineRecord::Blob(record_id) = unpack_record(pad.key_flags, &pad.rid) {
            if record_id != 0 {
                self.blobs.free(&mut self.device, record_id)?;
            }
        }

        self.purge_cache()?;
        Ok(())
    }

    /// Recursively descends to the key, deletes it, and rebalances on the
    /// way back up. Returns the page deleted at this level, if any.
    fn erase_recursive(
        &mut self,
        page: &PageRc,
        left: u64,
        right: u64,
        lanchor: u64,
        ranchor: u64,
        parent: Option<&PageRc>,
        pad: &mut ErasePad<'_>,
    ) -> Result<Option<PageRc>> {
        let facts = self.facts(page);

        // An empty node can only be the empty root.
        if facts.count == 0 {
            return Err(DbError::KeyNotFound.into());
        }

        // Mark the nodes which may need rebalancing.
        let isfew = if facts.address == self.root_address {
            facts.count > 1
        } else {
            facts.count > min_keys(self.max_keys) as usize
        };
        if isfew {
            pad.mergepage = 0;
        } else if pad.mergepage == 0 {
            pad.mergepage = facts.address;
        }

        if !facts.is_leaf {
            let (child, slot) = self.traverse_tree(page, pad.key)?;

            // Compute the next level's search-path neighbors and anchors.
            let (next_left, next_lanchor) = if slot == -1 {
                let nl = if left == 0 {
                    0
                } else {
                    let sibling = self.fetch_page(left)?;
                    let sf = self.facts(&sibling);
                    ensure!(sf.count > 0, "empty internal node at {}", sf.address);
                    let p = sibling.borrow();
                    NodeRef::new(p.payload(), self.config.key_size)
                        .key(sf.count - 1)
                        .rid()
                };
                (nl, lanchor)
            } else if slot == 0 {
                (facts.ptr_left, facts.address)
            } else {
                let p = page.borrow();
                let rid = NodeRef::new(p.payload(), self.config.key_size)
                    .key(slot as usize - 1)
                    .rid();
                drop(p);
                (rid, facts.address)
            };

            let (next_right, next_ranchor) = if slot == facts.count as i32 - 1 {
                let nr = if right == 0 {
                    0
                } else {
                    let sibling = self.fetch_page(right)?;
                    let p = sibling.borrow();
                    NodeRef::new(p.payload(), self.config.key_size).key(0).rid()
                };
                (nr, ranchor)
            } else {
                let p = page.borrow();
                let rid = NodeRef::new(p.payload(), self.config.key_size)
                    .key(slot as usize + 1)
                    .rid();
                drop(p);
                (rid, facts.address)
            };

            let deleted = self.erase_recursive(
                &child,
                next_left,
                next_right,
                next_lanchor,
                next_ranchor,
                Some(page),
                pad,
            )?;

            if deleted.is_some() {
                let entry = if slot == -1 { 0 } else { slot as usize };
                self.remove_entry(page, entry)?;
            }
            self.rebalance(page, left, right, lanchor, ranchor, parent, pad)
        } else {
            // Leaf: check that the key really exists, then delete it.
            let slot = self.get_slot(page, pad.key)?;
            if slot == -1 {
                pad.mergepage = 0;
                return Err(DbError::KeyNotFound.into());
            }
            if self.compare_slot_key(page, slot as usize, pad.key)? != Ordering::Equal {
                return Err(DbError::KeyNotFound.into());
            }

            {
                let p = page.borrow();
                let node = NodeRef::new(p.payload(), self.config.key_size);
                let k = node.key(slot as usize);
                pad.rid = k.rid_bytes();
                pad.key_flags = k.flags();
            }

            self.remove_entry(page, slot as usize)?;
            self.rebalance(page, left, right, lanchor, ranchor, parent, pad)
        }
    }

    /// Promotes `new_root` to be the tree's root.
    fn collapse_root(&mut self, new_root: &PageRc) -> Result<()> {
        let address = new_root.borrow().address();
        self.root_address = address;
        self.header_dirty = true;
        new_root.borrow_mut().set_page_type(PageType::BtreeRoot)?;
        debug!(new_root = address, "collapsed root");
        Ok(())
    }

    /// Decides whether and how to repair the tree at this level. Returns
    /// the page deleted by a merge, or the new root candidate when an
    /// internal root ran empty.
    fn rebalance(
        &mut self,
        page: &PageRc,
        left: u64,
        right: u64,
        lanchor: u64,
        ranchor: u64,
        parent: Option<&PageRc>,
        pad: &mut ErasePad<'_>,
    ) -> Result<Option<PageRc>> {
        if pad.mergepage == 0 {
            return Ok(None);
        }

        let facts = self.facts(page);
        let parent_address = match parent {
            Some(p) => p.borrow().address(),
            None => 0,
        };
        let minkeys = min_keys(self.max_keys) as usize;

        let leftpage = if left != 0 && facts.left != 0 {
            Some(self.fetch_page(facts.left)?)
        } else {
            None
        };
        let rightpage = if right != 0 && facts.right != 0 {
            Some(self.fetch_page(facts.right)?)
        } else {
            None
        };
        let fewleft = leftpage
            .as_ref()
            .map(|p| self.facts(p).count <= minkeys)
            .unwrap_or(false);
        let fewright = rightpage
            .as_ref()
            .map(|p| self.facts(p).count <= minkeys)
            .unwrap_or(false);

        // No siblings at all: this is the root level.
        if leftpage.is_none() && rightpage.is_none() {
            if facts.is_leaf {
                return Ok(None);
            }
            return Ok(Some(self.fetch_page(facts.ptr_left)?));
        }

        // A missing or starved sibling on both sides forces a merge; pick
        // the pair whose separator lives in the parent.
        if (leftpage.is_none() || fewleft) && (rightpage.is_none() || fewright) {
            return if lanchor != parent_address {
                let sib = rightpage
                    .ok_or_else(|| corruption("merge target missing on the right"))?;
                self.merge_pages(page, &sib, ranchor, pad).map(Some)
            } else {
                let sib = leftpage
                    .ok_or_else(|| corruption("merge target missing on the left"))?;
                self.merge_pages(&sib, page, lanchor, pad).map(Some)
            };
        }

        // One starved side: merge into it only when this page is the one
        // recorded for repair and the healthy side's anchor is remote;
        // otherwise borrow from the healthy side.
        if leftpage.is_some() && fewleft && rightpage.is_some() && !fewright {
            return if ranchor != parent_address && facts.address == pad.mergepage {
                let sib = leftpage.ok_or_else(|| corruption("left sibling vanished"))?;
                self.merge_pages(&sib, page, lanchor, pad).map(Some)
            } else {
                let sib = rightpage.ok_or_else(|| corruption("right sibling vanished"))?;
                self.shift_pages(page, &sib, ranchor, pad).map(|_| None)
            };
        }

        if leftpage.is_some() && !fewleft && rightpage.is_some() && fewright {
            return if lanchor != parent_address && facts.address == pad.mergepage {
                let sib = rightpage.ok_or_else(|| corruption("right sibling vanished"))?;
                self.merge_pages(page, &sib, ranchor, pad).map(Some)
            } else {
                let sib = leftpage.ok_or_else(|| corruption("left sibling vanished"))?;
                self.shift_pages(&sib, page, lanchor, pad).map(|_| None)
            };
        }

        // Both sides healthy: prefer the more effective, then the more
        // local shift.
        if lanchor == ranchor {
            let left_count = leftpage.as_ref().map(|p| self.facts(p).count).unwrap_or(0);
            let right_count = rightpage.as_ref().map(|p| self.facts(p).count).unwrap_or(0);
            if left_count <= right_count {
                let sib = rightpage.ok_or_else(|| corruption("right sibling vanished"))?;
                return self.shift_pages(page, &sib, ranchor, pad).map(|_| None);
            }
            let sib = leftpage.ok_or_else(|| corruption("left sibling vanished"))?;
            return self.shift_pages(&sib, page, lanchor, pad).map(|_| None);
        }

        if lanchor == parent_address {
            if let Some(sib) = leftpage {
                return self.shift_pages(&sib, page, lanchor, pad).map(|_| None);
            }
        }
        let sib = rightpage.ok_or_else(|| corruption("right sibling vanished"))?;
        self.shift_pages(page, &sib, ranchor, pad).map(|_| None)
    }

    /// Merges `sibpage` (the right page of the pair) into `page`. Returns
    /// the freed sibling so the caller can drop its separator.
    fn merge_pages(
        &mut self,
        page: &PageRc,
        sibpage: &PageRc,
        anchor: u64,
        pad: &mut ErasePad<'_>,
    ) -> Result<PageRc> {
        let key_size = self.config.key_size;
        let ancpage = if anchor != 0 {
            Some(self.fetch_page(anchor)?)
        } else {
            None
        };

        self.uncouple_all_cursors(page, 0)?;
        self.uncouple_all_cursors(sibpage, 0)?;
        if let Some(anc) = &ancpage {
            self.uncouple_all_cursors(anc, 0)?;
        }

        let facts = self.facts(page);
        let sib_facts = self.facts(sibpage);

        // Internal nodes: pull the separator down from the anchor first,
        // re-attaching the sibling's leftmost child to it.
        if !facts.is_leaf {
            let anc = ancpage
                .as_ref()
                .ok_or_else(|| corruption("internal merge without an anchor"))?;
            let sib_key0 = self.materialize_slot_key(sibpage, 0)?;
            let slot = self.get_slot(anc, &sib_key0)?;
            ensure!(slot >= 0, "anchor separator not found during merge");
            let anc_bytes = self.slot_bytes_of(anc, slot as usize);

            self.copy_key_into(page, facts.count, &anc_bytes)?;
            let mut p = page.borrow_mut();
            let mut node = NodeMut::new(p.payload_mut(), key_size);
            node.key_mut(facts.count).set_rid(sib_facts.ptr_left);
            node.set_count(facts.count + 1);
            p.set_dirty();
        }

        // Bulk-move the sibling's slots; ownership of any extended blobs
        // moves with the bytes.
        {
            let mut p = page.borrow_mut();
            let sp = sibpage.borrow();
            let mut dst = NodeMut::new(p.payload_mut(), key_size);
            let src = NodeRef::new(sp.payload(), key_size);
            let at = dst.count();
            let n = src.count();
            copy_slots(&mut dst, at, &src, 0, n);
            dst.set_count(at + n);
            p.set_dirty();
        }
        {
            let mut sp = sibpage.borrow_mut();
            let mut node = NodeMut::new(sp.payload_mut(), key_size);
            node.set_count(0);
            sp.set_dirty();
        }

        // Unlink the sibling from the doubly-linked page list.
        if facts.left == sib_facts.address {
            if sib_facts.left != 0 {
                let neighbor = self.fetch_page(sib_facts.left)?;
                let mut np = neighbor.borrow_mut();
                let mut node = NodeMut::new(np.payload_mut(), key_size);
                node.set_right(sib_facts.right);
                np.set_dirty();
                drop(np);
                let mut p = page.borrow_mut();
                let mut node = NodeMut::new(p.payload_mut(), key_size);
                node.set_left(sib_facts.left);
                p.set_dirty();
            } else {
                let mut p = page.borrow_mut();
                let mut node = NodeMut::new(p.payload_mut(), key_size);
                node.set_left(0);
                p.set_dirty();
            }
        } else if facts.right == sib_facts.address {
            if sib_facts.right != 0 {
                let neighbor = self.fetch_page(sib_facts.right)?;
                let mut p = page.borrow_mut();
                let mut node = NodeMut::new(p.payload_mut(), key_size);
                node.set_right(sib_facts.right);
                p.set_dirty();
                drop(p);
                let mut np = neighbor.borrow_mut();
                let mut node = NodeMut::new(np.payload_mut(), key_size);
                node.set_left(sib_facts.left);
                np.set_dirty();
            } else {
                let mut p = page.borrow_mut();
                let mut node = NodeMut::new(p.payload_mut(), key_size);
                node.set_right(0);
                p.set_dirty();
            }
        }

        if pad.mergepage == facts.address || pad.mergepage == sib_facts.address {
            pad.mergepage = 0;
        }

        self.free_page(sibpage)?;
        debug!(
            page = facts.address,
            freed = sib_facts.address,
            "merged sibling pages"
        );
        Ok(sibpage.clone())
    }

    /// Moves slots between `page` and its right-hand sibling until the pair
    /// is balanced. Internal nodes rotate keys through the anchor.
    fn shift_pages(
        &mut self,
        page: &PageRc,
        sibpage: &PageRc,
        anchor: u64,
        pad: &mut ErasePad<'_>,
    ) -> Result<()> {
        let key_size = self.config.key_size;
        let facts = self.facts(page);
        let sib_facts = self.facts(sibpage);
        if facts.count == sib_facts.count {
            return Ok(());
        }
        ensure!(anchor != 0, "shift without an anchor page");
        let ancpage = self.fetch_page(anchor)?;
        let intern = !facts.is_leaf;

        self.uncouple_all_cursors(page, 0)?;
        self.uncouple_all_cursors(sibpage, 0)?;
        self.uncouple_all_cursors(&ancpage, 0)?;

        if sib_facts.count >= facts.count {
            // Borrow from the sibling into this page.
            let mut anc_slot: i32 = -1;
            if intern {
                // Rotate one key through the anchor: the separator comes
                // down to this page, the sibling's head goes up.
                let sib_key0 = self.materialize_slot_key(sibpage, 0)?;
                anc_slot = self.get_slot(&ancpage, &sib_key0)?;
                ensure!(anc_slot >= 0, "anchor separator not found during shift");
                let anc_bytes = self.slot_bytes_of(&ancpage, anc_slot as usize);

                let count = self.facts(page).count;
                self.copy_key_into(page, count, &anc_bytes)?;
                let sib_head = self.slot_bytes_of(sibpage, 0);
                let sib_ptr_left = self.facts(sibpage).ptr_left;
                {
                    let mut p = page.borrow_mut();
                    let mut node = NodeMut::new(p.payload_mut(), key_size);
                    node.key_mut(count).set_rid(sib_ptr_left);
                    node.set_count(count + 1);
                    p.set_dirty();
                }
                self.replace_key(&ancpage, anc_slot as usize, &sib_head, true)?;
                // The promoted key was copied into the anchor; its original
                // slot (and blob) leaves the sibling now.
                self.free_ext_blob_of_slot(&sib_head)?;
                {
                    let mut sp = sibpage.borrow_mut();
                    let mut node = NodeMut::new(sp.payload_mut(), key_size);
                    node.set_ptr_left(KeyRef::new(&sib_head).rid());
                    let sc = node.count();
                    node.move_slots(1, 0, sc - 1);
                    node.set_count(sc - 1);
                    sp.set_dirty();
                }
            }

            let page_count = self.facts(page).count;
            let sib_count = self.facts(sibpage).count;
            let c0 = (sib_count - page_count) / 2;
            if c0 > 0 {
                let c = if intern { c0 - 1 } else { c0 };

                if intern {
                    // Pull the current separator down as well.
                    let anc_bytes = self.slot_bytes_of(&ancpage, anc_slot as usize);
                    let count = self.facts(page).count;
                    self.copy_key_into(page, count, &anc_bytes)?;
                    let sib_ptr_left = self.facts(sibpage).ptr_left;
                    let mut p = page.borrow_mut();
                    let mut node = NodeMut::new(p.payload_mut(), key_size);
                    node.key_mut(count).set_rid(sib_ptr_left);
                    node.set_count(count + 1);
                    p.set_dirty();
                }

                // Move `c` slots from the sibling's head to this page's
                // tail.
                {
                    let mut p = page.borrow_mut();
                    let sp = sibpage.borrow();
                    let mut dst = NodeMut::new(p.payload_mut(), key_size);
                    let src = NodeRef::new(sp.payload(), key_size);
                    let at = dst.count();
                    copy_slots(&mut dst, at, &src, 0, c);
                    dst.set_count(at + c);
                    p.set_dirty();
                }
                {
                    let mut sp = sibpage.borrow_mut();
                    let mut node = NodeMut::new(sp.payload_mut(), key_size);
                    let sc = node.count();
                    node.move_slots(c, 0, sc - c);
                    node.set_count(sc - c);
                    sp.set_dirty();
                }

                if intern {
                    // Promote the sibling's new head into the anchor and
                    // drop it from the sibling.
                    let sib_head = self.slot_bytes_of(sibpage, 0);
                    {
                        let mut sp = sibpage.borrow_mut();
                        let mut node = NodeMut::new(sp.payload_mut(), key_size);
                        node.set_ptr_left(KeyRef::new(&sib_head).rid());
                    }
                    let sib_key0 = self.materialize_slot_bytes(&sib_head)?;
                    let slot = self.get_slot(&ancpage, &sib_key0)?;
                    self.replace_anchor_key(&ancpage, slot, &sib_head)?;
                    self.free_ext_blob_of_slot(&sib_head)?;
                    let mut sp = sibpage.borrow_mut();
                    let mut node = NodeMut::new(sp.payload_mut(), key_size);
                    let sc = node.count();
                    node.move_slots(1, 0, sc - 1);
                    node.set_count(sc - 1);
                    sp.set_dirty();
                } else {
                    // Leaf: the anchor reflects the sibling's new smallest
                    // key.
                    let sib_head = self.slot_bytes_of(sibpage, 0);
                    let sib_key0 = self.materialize_slot_bytes(&sib_head)?;
                    let slot = self.get_slot(&ancpage, &sib_key0)?;
                    self.replace_anchor_key(&ancpage, slot, &sib_head)?;
                }
            }
        } else {
            // Give to the sibling from this page.
            let mut anc_slot: i32 = -1;
            if intern {
                let sib_key0 = self.materialize_slot_key(sibpage, 0)?;
                anc_slot = self.get_slot(&ancpage, &sib_key0)?;
                ensure!(anc_slot >= 0, "anchor separator not found during shift");
                let anc_bytes = self.slot_bytes_of(&ancpage, anc_slot as usize);

                // The separator comes down to the sibling's head; this
                // page's last key goes up.
                let sib_count = self.facts(sibpage).count;
                let sib_ptr_left = self.facts(sibpage).ptr_left;
                {
                    let mut sp = sibpage.borrow_mut();
                    let mut node = NodeMut::new(sp.payload_mut(), key_size);
                    node.move_slots(0, 1, sib_count);
                }
                self.copy_key_into(sibpage, 0, &anc_bytes)?;
                {
                    let mut sp = sibpage.borrow_mut();
                    let mut node = NodeMut::new(sp.payload_mut(), key_size);
                    node.key_mut(0).set_rid(sib_ptr_left);
                    node.set_count(sib_count + 1);
                    sp.set_dirty();
                }

                let page_count = self.facts(page).count;
                let page_last = self.slot_bytes_of(page, page_count - 1);
                {
                    let mut sp = sibpage.borrow_mut();
                    let mut node = NodeMut::new(sp.payload_mut(), key_size);
                    node.set_ptr_left(KeyRef::new(&page_last).rid());
                }
                self.replace_key(&ancpage, anc_slot as usize, &page_last, true)?;
                self.free_ext_blob_of_slot(&page_last)?;
                {
                    let mut p = page.borrow_mut();
                    let mut node = NodeMut::new(p.payload_mut(), key_size);
                    node.set_count(page_count - 1);
                    p.set_dirty();
                }
            }

            let page_count = self.facts(page).count;
            let sib_count = self.facts(sibpage).count;
            let c0 = (page_count - sib_count) / 2;
            if c0 > 0 {
                let c = if intern { c0 - 1 } else { c0 };

                if intern {
                    // Bring the current separator down into the sibling's
                    // head.
                    let anc_bytes = self.slot_bytes_of(&ancpage, anc_slot as usize);
                    let sc = self.facts(sibpage).count;
                    let sib_ptr_left = self.facts(sibpage).ptr_left;
                    {
                        let mut sp = sibpage.borrow_mut();
                        let mut node = NodeMut::new(sp.payload_mut(), key_size);
                        node.move_slots(0, 1, sc);
                    }
                    self.copy_key_into(sibpage, 0, &anc_bytes)?;
                    let mut sp = sibpage.borrow_mut();
                    let mut node = NodeMut::new(sp.payload_mut(), key_size);
                    node.key_mut(0).set_rid(sib_ptr_left);
                    node.set_count(sc + 1);
                    sp.set_dirty();
                }

                let page_count = self.facts(page).count;
                let split_at = page_count - c - 1;

                // Make room at the sibling's head and move this page's top
                // `c` slots across.
                {
                    let mut sp = sibpage.borrow_mut();
                    let mut node = NodeMut::new(sp.payload_mut(), key_size);
                    let sc = node.count();
                    node.move_slots(0, c, sc);
                }
                {
                    let pp = page.borrow();
                    let mut sp = sibpage.borrow_mut();
                    let src = NodeRef::new(pp.payload(), key_size);
                    let mut dst = NodeMut::new(sp.payload_mut(), key_size);
                    let sc = dst.count();
                    copy_slots(&mut dst, 0, &src, split_at + 1, c);
                    dst.set_count(sc + c);
                    sp.set_dirty();
                }
                {
                    let mut p = page.borrow_mut();
                    let mut node = NodeMut::new(p.payload_mut(), key_size);
                    node.set_count(page_count - c);
                    p.set_dirty();
                }

                if intern {
                    // This page's new last key is promoted: its child
                    // pointer becomes the sibling's ptr_left, its key
                    // replaces the old anchor separator, and the slot is
                    // trimmed away.
                    let promoted = self.slot_bytes_of(page, split_at);
                    {
                        let mut sp = sibpage.borrow_mut();
                        let mut node = NodeMut::new(sp.payload_mut(), key_size);
                        node.set_ptr_left(KeyRef::new(&promoted).rid());
                        sp.set_dirty();
                    }
                    let promoted_key = self.materialize_slot_bytes(&promoted)?;
                    let slot = self.get_slot(&ancpage, &promoted_key)?;
                    self.replace_anchor_key(&ancpage, slot + 1, &promoted)?;
                    self.free_ext_blob_of_slot(&promoted)?;
                    let mut p = page.borrow_mut();
                    let mut node = NodeMut::new(p.payload_mut(), key_size);
                    node.set_count(split_at);
                    p.set_dirty();
                } else {
                    let sib_head = self.slot_bytes_of(sibpage, 0);
                    let sib_key0 = self.materialize_slot_bytes(&sib_head)?;
                    let slot = self.get_slot(&ancpage, &sib_key0)?;
                    self.replace_anchor_key(&ancpage, slot + 1, &sib_head)?;
                }
            }
        }

        // All three pages took edits.
        page.borrow_mut().set_dirty();
        sibpage.borrow_mut().set_dirty();
        ancpage.borrow_mut().set_dirty();
        pad.mergepage = 0;

        debug!(
            page = facts.address,
            sibling = sib_facts.address,
            anchor,
            "shifted slots between siblings"
        );
        Ok(())
    }

    /// Removes the key at `slot`, freeing its extended blob and closing the
    /// slot-array gap.
    pub(crate) fn remove_entry(&mut self, page: &PageRc, slot: usize) -> Result<()> {
        self.uncouple_all_cursors(page, 0)?;

        let facts = self.facts(page);
        ensure!(
            slot < facts.count,
            "slot {} out of range in node {} (count {})",
            slot,
            facts.address,
            facts.count
        );

        let bytes = self.slot_bytes_of(page, slot);
        self.free_ext_blob_of_slot(&bytes)?;

        let mut p = page.borrow_mut();
        let mut node = NodeMut::new(p.payload_mut(), self.config.key_size);
        node.close_gap(slot);
        node.set_count(facts.count - 1);
        p.set_dirty();
        Ok(())
    }

    /// Overwrites the key at `slot` with `src` slot bytes: flags, inline
    /// bytes, and logical size — the record-id field is left alone. The
    /// destination's old extended blob is freed; an extended source gets a
    /// fresh blob copy (allocated before anything is released, so a failed
    /// allocation leaves the old key intact).
    pub(crate) fn replace_key(
        &mut self,
        page: &PageRc,
        slot: usize,
        src: &[u8],
        internal: bool,
    ) -> Result<()> {
        self.uncouple_all_cursors(page, 0)?;

        let src_key = KeyRef::new(src);
        let new_blob = if src_key.is_extended() {
            let src_id = src_key.extended_id();
            if src_id == 0 {
                return Err(corruption("extended key with a zero blob id"));
            }
            Some(self.deep_copy_blob(src_id)?)
        } else {
            None
        };

        let old = self.slot_bytes_of(page, slot);
        self.free_ext_blob_of_slot(&old)?;

        let mut flags = src_key.flags();
        if internal {
            flags &= !KEY_LEAF_ONLY_FLAGS;
        }

        let mut p = page.borrow_mut();
        let mut node = NodeMut::new(p.payload_mut(), self.config.key_size);
        let mut dst = node.key_mut(slot);
        dst.set_flags(flags);
        dst.data_mut().copy_from_slice(KeyRef::new(src).data());
        if let Some(blob_id) = new_blob {
            dst.set_extended_id(blob_id);
        }
        dst.set_size(src_key.size());
        p.set_dirty();
        Ok(())
    }

    /// `replace_key` onto an anchor separator, tolerating a slot that fell
    /// off the end of the anchor's key range (possible when the shifted
    /// keys sort past every separator): that case is a no-op.
    fn replace_anchor_key(&mut self, ancpage: &PageRc, slot: i32, src: &[u8]) -> Result<()> {
        if slot < 0 {
            return Ok(());
        }
        let count = self.facts(ancpage).count;
        if slot as usize >= count {
            return Ok(());
        }
        self.replace_key(ancpage, slot as usize, src, true)
    }

    /// Writes `src` slot bytes verbatim into `page` at `slot` (no gap
    /// management), deep-copying an extended source's blob so ids are never
    /// aliased.
    pub(crate) fn copy_key_into(&mut self, page: &PageRc, slot: usize, src: &[u8]) -> Result<()> {
        let src_key = KeyRef::new(src);
        let new_blob = if src_key.is_extended() {
            let src_id = src_key.extended_id();
            if src_id == 0 {
                return Err(corruption("extended key with a zero blob id"));
            }
            Some(self.deep_copy_blob(src_id)?)
        } else {
            None
        };

        let mut p = page.borrow_mut();
        let mut node = NodeMut::new(p.payload_mut(), self.config.key_size);
        node.write_slot(slot, src);
        if let Some(blob_id) = new_blob {
            node.key_mut(slot).set_extended_id(blob_id);
        }
        p.set_dirty();
        Ok(())
    }

    /// Frees the extended blob referenced by a slot, if any, and drops its
    /// cache entry.
    pub(crate) fn free_ext_blob_of_slot(&mut self, slot_bytes: &[u8]) -> Result<()> {
        let key = KeyRef::new(slot_bytes);
        if key.flags() & KEY_IS_EXTENDED == 0 {
            return Ok(());
        }
        let blob_id = key.extended_id();
        if blob_id == 0 {
            return Err(corruption("extended key with a zero blob id"));
        }
        self.extkeys.remove(blob_id);
        self.blobs.free(&mut self.device, blob_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::key::{slot_stride, KeyMut};

    fn db4() -> Database {
        Database::builder()
            .in_memory()
            .page_size(144)
            .key_size(16)
            .create()
            .unwrap()
    }

    fn one_byte_slot(byte: u8) -> Vec<u8> {
        let mut src = vec![0u8; slot_stride(16)];
        let mut key = KeyMut::new(&mut src);
        key.set_size(1);
        key.data_mut()[0] = byte;
        drop(key);
        src
    }

    /// An anchor-replacement slot past the anchor's key range must be
    /// tolerated as a no-op, not crash or clobber a neighbor.
    #[test]
    fn anchor_replacement_past_the_key_range_is_a_no_op() {
        let mut db = db4();
        for k in 1u8..=8 {
            db.insert(&[k], &[k], 0).unwrap();
        }
        let root_address = db.root_address;
        let root = db.fetch_page(root_address).unwrap();
        let count = db.facts(&root).count;
        assert!(count >= 1, "seed did not produce an internal root");

        let src = one_byte_slot(99);
        let before = db.node_snapshot(root_address).unwrap().keys;

        db.replace_anchor_key(&root, count as i32, &src).unwrap();
        db.replace_anchor_key(&root, count as i32 + 3, &src).unwrap();
        db.replace_anchor_key(&root, -1, &src).unwrap();
        assert_eq!(db.node_snapshot(root_address).unwrap().keys, before);

        // In range, the replacement goes through.
        db.replace_anchor_key(&root, 0, &src).unwrap();
        assert_eq!(db.node_snapshot(root_address).unwrap().keys[0], vec![99]);
    }

    /// Copying an extended key duplicates its blob: the copy holds a
    /// different blob id, and freeing the source leaves it intact.
    #[test]
    fn copied_extended_keys_get_their_own_blob() {
        let mut db = db4();
        let long = b"a-key-well-beyond-the-inline-area".to_vec();
        db.insert(&long, b"r", 0).unwrap();

        let leaf = db.fetch_page(db.root_address).unwrap();
        let src = db.slot_bytes_of(&leaf, 0);
        assert!(KeyRef::new(&src).is_extended());
        let src_id = KeyRef::new(&src).extended_id();

        let scratch = db.alloc_tree_page(PageType::BtreeIndex, true).unwrap();
        db.copy_key_into(&scratch, 0, &src).unwrap();
        let copy = db.slot_bytes_of(&scratch, 0);
        let copy_id = KeyRef::new(&copy).extended_id();
        assert_ne!(copy_id, src_id);
        assert_ne!(copy_id, 0);

        db.free_ext_blob_of_slot(&src).unwrap();
        assert_eq!(db.materialize_slot_bytes(&copy).unwrap(), long);
    }

    /// The replaced separator keeps its child pointer: only flags, key
    /// bytes, and size change.
    #[test]
    fn replace_key_preserves_the_child_pointer() {
        let mut db = db4();
        for k in 1u8..=8 {
            db.insert(&[k], &[k], 0).unwrap();
        }
        let root_address = db.root_address;
        let root = db.fetch_page(root_address).unwrap();
        let child_before = db.node_snapshot(root_address).unwrap().children[1];

        db.replace_key(&root, 0, &one_byte_slot(42), true).unwrap();

        let snap = db.node_snapshot(root_address).unwrap();
        assert_eq!(snap.keys[0], vec![42]);
        assert_eq!(snap.children[1], child_before);
    }
}
