//! # B+Tree Engine
//!
//! The mutation and traversal machinery for the disk-resident B+tree. All
//! values live in leaves; internal nodes hold separator keys and child
//! pointers; leaves (and internals) are chained into doubly-linked sibling
//! lists for sequential scans.
//!
//! ```text
//!                [root: internal]
//!               /       |        \
//!        [leaf A] <-> [leaf B] <-> [leaf C]
//! ```
//!
//! ## Module Map
//!
//! - `key`: fixed-stride slot codec (flags, logical size, record id,
//!   inline bytes, extended-blob tail)
//! - `node`: node view over a page payload, slot-array surgery
//! - `find`: descent, slot selection, key materialization and comparison
//! - `insert`: insert with split, root growth
//! - `erase`: recursive erase with merge/shift/root-collapse
//! - `cursor`: the nil/coupled/uncoupled cursor state machine
//!
//! ## Descent and Slot Selection
//!
//! `get_slot` returns the slot holding the largest key not greater than the
//! search key, or -1 when the search key precedes slot 0. An internal
//! node's child for slot `s` is `s == -1 ? ptr_left : slot[s].record_id`,
//! so the subtree under slot `s` holds keys `k` with
//! `key[s] <= k < key[s + 1]` — a separator equals the smallest key that
//! ever lived in its right subtree, and stays behind as a lower bound when
//! that key is erased.
//!
//! ## Structural Changes and Cursors
//!
//! Any edit that renumbers slots (insert shift, remove, split, merge,
//! shift-between-siblings) first uncouples every cursor registered on the
//! affected pages. That single rule is what keeps cursors valid across
//! cache evictions and page splits.
//!
//! ## Thread Safety
//!
//! None. The engine is single-threaded cooperative; no operation suspends.

pub mod cursor;
pub mod key;
pub mod node;

mod erase;
mod find;
mod insert;

pub use cursor::{
    Cursor, CursorState, CURSOR_FIRST, CURSOR_LAST, CURSOR_NEXT, CURSOR_ONLY_DUPLICATES,
    CURSOR_PREVIOUS, CURSOR_SKIP_DUPLICATES, FIND_EXACT_MATCH, FIND_GE_MATCH, FIND_GT_MATCH,
    FIND_LE_MATCH, FIND_LT_MATCH,
};
pub use insert::{DUPLICATE, OVERWRITE};
pub use node::{max_keys, min_keys};

use eyre::{ensure, Result};

use crate::db::Database;
use crate::error::corruption;
use node::NodeRef;

/// A tree needs room for at least this many slots per node; fewer cannot
/// split or rebalance meaningfully.
pub const MIN_USABLE_KEYS: u16 = 4;

/// Read-only dump of one node, for diagnostics and structural tests.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub address: u64,
    pub is_leaf: bool,
    pub count: usize,
    /// Fully materialized keys, in slot order.
    pub keys: Vec<Vec<u8>>,
    /// Child addresses (`ptr_left` first); empty for leaves.
    pub children: Vec<u64>,
    pub ptr_left: u64,
    pub left: u64,
    pub right: u64,
}

impl Database {
    /// Materialized view of the node at `address`.
    pub fn node_snapshot(&mut self, address: u64) -> Result<NodeSnapshot> {
        let page = self.fetch_page(address)?;
        let (is_leaf, count, ptr_left, left, right, rids) = {
            let p = page.borrow();
            let node = NodeRef::new(p.payload(), self.config.key_size);
            let rids: Vec<u64> = (0..node.count()).map(|i| node.key(i).rid()).collect();
            (
                node.is_leaf(),
                node.count(),
                node.ptr_left(),
                node.left(),
                node.right(),
                rids,
            )
        };

        let mut keys = Vec::with_capacity(count);
        for slot in 0..count {
            keys.push(self.materialize_slot_key(&page, slot)?);
        }

        let children = if is_leaf {
            Vec::new()
        } else {
            std::iter::once(ptr_left).chain(rids).collect()
        };

        Ok(NodeSnapshot {
            address,
            is_leaf,
            count,
            keys,
            children,
            ptr_left,
            left,
            right,
        })
    }

    /// Walks the whole tree and verifies its structural invariants: count
    /// bounds, sibling-chain consistency, separator ordering, leaf depth,
    /// and extended-blob resolvability. Cheap enough for tests to call
    /// after every mutation.
    pub fn check_integrity(&mut self) -> Result<()> {
        if self.root_address == 0 {
            return Ok(());
        }
        let mut levels: Vec<Vec<u64>> = Vec::new();
        let mut leaf_depth: Option<usize> = None;
        self.verify_node(
            self.root_address,
            0,
            None,
            None,
            &mut levels,
            &mut leaf_depth,
        )?;

        for level in &levels {
            let mut prev: Option<u64> = None;
            for (i, &addr) in level.iter().enumerate() {
                let snap = self.node_snapshot(addr)?;
                ensure!(
                    snap.left == prev.unwrap_or(0),
                    "node {} has left sibling {}, expected {}",
                    addr,
                    snap.left,
                    prev.unwrap_or(0)
                );
                let expected_right = level.get(i + 1).copied().unwrap_or(0);
                ensure!(
                    snap.right == expected_right,
                    "node {} has right sibling {}, expected {}",
                    addr,
                    snap.right,
                    expected_right
                );
                prev = Some(addr);
            }
        }
        Ok(())
    }

    fn verify_node(
        &mut self,
        address: u64,
        depth: usize,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        levels: &mut Vec<Vec<u64>>,
        leaf_depth: &mut Option<usize>,
    ) -> Result<()> {
        ensure!(depth < 64, "tree deeper than 64 levels at page {}", address);
        if levels.len() <= depth {
            levels.push(Vec::new());
        }
        levels[depth].push(address);

        let snap = self.node_snapshot(address)?;
        let is_root = address == self.root_address;
        let max = self.max_keys as usize;
        let min = min_keys(self.max_keys) as usize;

        ensure!(
            snap.count <= max,
            "node {} holds {} keys, limit is {}",
            address,
            snap.count,
            max
        );
        if is_root {
            if !snap.is_leaf {
                ensure!(snap.count >= 1, "internal root {} is empty", address);
            }
        } else {
            ensure!(
                snap.count >= min,
                "node {} holds {} keys, below the rebalance threshold {}",
                address,
                snap.count,
                min
            );
        }

        if snap.is_leaf {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(d) => ensure!(
                    d == depth,
                    "leaf {} at depth {}, expected {}",
                    address,
                    depth,
                    d
                ),
            }
        }

        // Key ordering within the node, leaf-only flags, blob reachability.
        let page = self.fetch_page(address)?;
        for slot in 0..snap.count {
            let (flags, ext_id) = {
                let p = page.borrow();
                let node = NodeRef::new(p.payload(), self.config.key_size);
                let k = node.key(slot);
                (k.flags(), if k.is_extended() { k.extended_id() } else { 0 })
            };
            if !snap.is_leaf {
                ensure!(
                    flags & key::KEY_LEAF_ONLY_FLAGS == 0,
                    "internal node {} slot {} carries leaf-only flags {:#04x}",
                    address,
                    slot,
                    flags
                );
            }
            if flags & key::KEY_IS_EXTENDED != 0 {
                if ext_id == 0 {
                    return Err(corruption(format!(
                        "extended key in node {address} slot {slot} has a zero blob id"
                    )));
                }
                self.blobs.size(&mut self.device, ext_id)?;
            }

            if slot + 1 < snap.count {
                ensure!(
                    self.comparator
                        .compare(&snap.keys[slot], &snap.keys[slot + 1])
                        == std::cmp::Ordering::Less,
                    "keys out of order in node {} at slot {}",
                    address,
                    slot
                );
            }
            if let Some(lo) = lower {
                ensure!(
                    self.comparator.compare(lo, &snap.keys[slot]) != std::cmp::Ordering::Greater,
                    "key below the subtree lower bound in node {} slot {}",
                    address,
                    slot
                );
            }
            if let Some(hi) = upper {
                ensure!(
                    self.comparator.compare(&snap.keys[slot], hi) == std::cmp::Ordering::Less,
                    "key at or above the subtree upper bound in node {} slot {}",
                    address,
                    slot
                );
            }
        }

        if !snap.is_leaf {
            ensure!(snap.ptr_left != 0, "internal node {} lost ptr_left", address);
            for (i, &child) in snap.children.iter().enumerate() {
                ensure!(
                    child != 0,
                    "internal node {} has a zero child pointer at {}",
                    address,
                    i
                );
                // children[0] is ptr_left, bounded by (lower, key[0]);
                // children[i] covers [key[i-1], key[i]).
                let child_lower = if i == 0 { lower } else { Some(snap.keys[i - 1].as_slice()) };
                let child_upper = if i < snap.count {
                    Some(snap.keys[i].as_slice())
                } else {
                    upper
                };
                self.verify_node(child, depth + 1, child_lower, child_upper, levels, leaf_depth)?;
            }
        }
        Ok(())
    }
}
