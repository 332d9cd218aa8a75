//! # Node View
//!
//! Interprets a page's payload as a B+tree node. The view borrows the page
//! bytes and is reconstructed on demand; nothing caches a view across
//! operations, so a page's buffer can be swapped (shadow copies, eviction)
//! without invalidating dangling interpretations.
//!
//! ## Node Layout (within the page payload)
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  ----------------------------------------
//! 0       2     count     number of occupied slots
//! 2       2     flags     leaf bit
//! 4       8     ptr_left  leftmost child address (internal only)
//! 12      8     left      left sibling page address
//! 20      8     right     right sibling page address
//! 28      ...   slots     fixed-stride key records
//! ```
//!
//! Leaves and internal nodes both maintain the sibling pointers; the leaf
//! level forms a doubly-linked list for range scans.
//!
//! The header is deliberately decoded field-by-field instead of through a
//! zerocopy struct: the slot array that follows shares the same byte region
//! and is addressed with stride arithmetic, so the node code works in raw
//! offsets throughout.

use super::key::{slot_stride, KeyMut, KeyRef};
use crate::page::PAGE_HEADER_SIZE;

pub const NODE_HEADER_SIZE: usize = 28;

const COUNT_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 2;
const PTR_LEFT_OFFSET: usize = 4;
const LEFT_OFFSET: usize = 12;
const RIGHT_OFFSET: usize = 20;

const NODE_FLAG_LEAF: u16 = 0x0001;

/// Slots a node can hold for the given geometry.
pub fn max_keys(page_size: u32, key_size: u16) -> u16 {
    let usable = page_size as usize - PAGE_HEADER_SIZE - NODE_HEADER_SIZE;
    (usable / slot_stride(key_size)) as u16
}

/// Rebalance threshold: a non-root node with `count <= min_keys` is
/// under-full.
pub fn min_keys(max_keys: u16) -> u16 {
    max_keys / 2
}

#[inline]
fn read_u16(payload: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([payload[offset], payload[offset + 1]])
}

#[inline]
fn read_u64(payload: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(
        payload[offset..offset + 8]
            .try_into()
            .unwrap_or([0; 8]),
    )
}

/// Read-only node view over a page payload.
pub struct NodeRef<'a> {
    payload: &'a [u8],
    stride: usize,
}

impl<'a> NodeRef<'a> {
    pub fn new(payload: &'a [u8], key_size: u16) -> Self {
        debug_assert!(payload.len() >= NODE_HEADER_SIZE);
        Self {
            payload,
            stride: slot_stride(key_size),
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        read_u16(self.payload, COUNT_OFFSET) as usize
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        read_u16(self.payload, FLAGS_OFFSET) & NODE_FLAG_LEAF != 0
    }

    #[inline]
    pub fn ptr_left(&self) -> u64 {
        read_u64(self.payload, PTR_LEFT_OFFSET)
    }

    #[inline]
    pub fn left(&self) -> u64 {
        read_u64(self.payload, LEFT_OFFSET)
    }

    #[inline]
    pub fn right(&self) -> u64 {
        read_u64(self.payload, RIGHT_OFFSET)
    }

    #[inline]
    fn slot_range(&self, slot: usize) -> std::ops::Range<usize> {
        let start = NODE_HEADER_SIZE + slot * self.stride;
        start..start + self.stride
    }

    /// Raw bytes of one slot. Slots past `count` are accessible; the erase
    /// rebalancing reads a just-trimmed slot that is still physically
    /// intact.
    pub fn slot_bytes(&self, slot: usize) -> &'a [u8] {
        &self.payload[self.slot_range(slot)]
    }

    pub fn key(&self, slot: usize) -> KeyRef<'a> {
        KeyRef::new(self.slot_bytes(slot))
    }
}

/// Mutable node view over a page payload.
pub struct NodeMut<'a> {
    payload: &'a mut [u8],
    stride: usize,
}

impl<'a> NodeMut<'a> {
    pub fn new(payload: &'a mut [u8], key_size: u16) -> Self {
        debug_assert!(payload.len() >= NODE_HEADER_SIZE);
        Self {
            payload,
            stride: slot_stride(key_size),
        }
    }

    /// Zeroes the header and stamps the leaf bit.
    pub fn init(&mut self, is_leaf: bool) {
        self.payload[..NODE_HEADER_SIZE].fill(0);
        if is_leaf {
            self.payload[FLAGS_OFFSET..FLAGS_OFFSET + 2]
                .copy_from_slice(&NODE_FLAG_LEAF.to_le_bytes());
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        read_u16(self.payload, COUNT_OFFSET) as usize
    }

    #[inline]
    pub fn set_count(&mut self, count: usize) {
        debug_assert!(count <= u16::MAX as usize);
        self.payload[COUNT_OFFSET..COUNT_OFFSET + 2]
            .copy_from_slice(&(count as u16).to_le_bytes());
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        read_u16(self.payload, FLAGS_OFFSET) & NODE_FLAG_LEAF != 0
    }

    #[inline]
    pub fn ptr_left(&self) -> u64 {
        read_u64(self.payload, PTR_LEFT_OFFSET)
    }

    #[inline]
    pub fn set_ptr_left(&mut self, address: u64) {
        self.payload[PTR_LEFT_OFFSET..PTR_LEFT_OFFSET + 8].copy_from_slice(&address.to_le_bytes());
    }

    #[inline]
    pub fn left(&self) -> u64 {
        read_u64(self.payload, LEFT_OFFSET)
    }

    #[inline]
    pub fn set_left(&mut self, address: u64) {
        self.payload[LEFT_OFFSET..LEFT_OFFSET + 8].copy_from_slice(&address.to_le_bytes());
    }

    #[inline]
    pub fn right(&self) -> u64 {
        read_u64(self.payload, RIGHT_OFFSET)
    }

    #[inline]
    pub fn set_right(&mut self, address: u64) {
        self.payload[RIGHT_OFFSET..RIGHT_OFFSET + 8].copy_from_slice(&address.to_le_bytes());
    }

    #[inline]
    fn slot_range(&self, slot: usize) -> std::ops::Range<usize> {
        let start = NODE_HEADER_SIZE + slot * self.stride;
        start..start + self.stride
    }

    pub fn slot_bytes(&self, slot: usize) -> &[u8] {
        &self.payload[self.slot_range(slot)]
    }

    pub fn slot_bytes_mut(&mut self, slot: usize) -> &mut [u8] {
        let range = self.slot_range(slot);
        &mut self.payload[range]
    }

    pub fn key(&self, slot: usize) -> KeyRef<'_> {
        KeyRef::new(self.slot_bytes(slot))
    }

    pub fn key_mut(&mut self, slot: usize) -> KeyMut<'_> {
        KeyMut::new(self.slot_bytes_mut(slot))
    }

    /// Writes a whole slot.
    pub fn write_slot(&mut self, slot: usize, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.stride);
        self.slot_bytes_mut(slot).copy_from_slice(bytes);
    }

    /// Opens a gap at `slot` by moving `[slot, count)` one stride to the
    /// right. The caller bumps the count afterwards.
    pub fn open_gap(&mut self, slot: usize) {
        let count = self.count();
        if slot < count {
            let start = NODE_HEADER_SIZE + slot * self.stride;
            let end = NODE_HEADER_SIZE + count * self.stride;
            self.payload.copy_within(start..end, start + self.stride);
        }
    }

    /// Closes the gap at `slot` by moving `[slot + 1, count)` one stride to
    /// the left. The caller decrements the count afterwards.
    pub fn close_gap(&mut self, slot: usize) {
        let count = self.count();
        if slot + 1 < count {
            let start = NODE_HEADER_SIZE + (slot + 1) * self.stride;
            let end = NODE_HEADER_SIZE + count * self.stride;
            self.payload.copy_within(start..end, start - self.stride);
        }
    }

    /// Moves `n` slots within this node from `src` to `dst` (memmove
    /// semantics).
    pub fn move_slots(&mut self, src: usize, dst: usize, n: usize) {
        if n == 0 || src == dst {
            return;
        }
        let start = NODE_HEADER_SIZE + src * self.stride;
        let end = start + n * self.stride;
        self.payload
            .copy_within(start..end, NODE_HEADER_SIZE + dst * self.stride);
    }
}

/// Copies `n` slots from `src` (starting at `src_at`) into `dst` (starting
/// at `dst_at`). The nodes must live on different pages.
pub fn copy_slots(dst: &mut NodeMut<'_>, dst_at: usize, src: &NodeRef<'_>, src_at: usize, n: usize) {
    debug_assert_eq!(dst.stride, src.stride);
    for i in 0..n {
        let bytes = src.slot_bytes(src_at + i);
        dst.write_slot(dst_at + i, bytes);
    }
}
