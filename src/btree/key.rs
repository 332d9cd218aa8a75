//! # Key Record Codec
//!
//! Every slot in a node is a fixed-stride key record:
//!
//! ```text
//! Offset  Size      Field       Description
//! ------  --------  ----------  ----------------------------------------
//! 0       1         flags       EXTENDED / TINY / SMALL / EMPTY
//! 1       2         key_size    logical key length (may exceed inline)
//! 3       8         record_id   record pointer, inline record bytes, or
//!                               child page address (internal nodes)
//! 11      key_size  key_bytes   inline key bytes
//! ```
//!
//! All multi-byte fields are little-endian on disk, converted explicitly at
//! every access — a record id never crosses this boundary in host order.
//!
//! ## Extended Keys
//!
//! A key longer than the node's inline capacity keeps its first
//! `key_size - 8` bytes inline; the last 8 inline bytes are replaced by the
//! id of the blob holding the remainder, and `EXTENDED` is set.
//!
//! ## Inline Records
//!
//! The record-id field doubles as inline record storage in leaves:
//!
//! - `EMPTY`: zero-length record, field unused
//! - `TINY`: records shorter than 8 bytes live in the field's first bytes,
//!   with the length in the final byte
//! - `SMALL`: an exactly-8-byte record fills the field
//! - otherwise the field holds the id of the record's blob
//!
//! These three flags are leaf-only; separators in internal nodes reuse the
//! field as a child page address and must never carry them.

/// Key overflows into an extended blob.
pub const KEY_IS_EXTENDED: u8 = 0x01;
/// Record is inlined in the record-id field, length in the last byte.
pub const KEY_BLOB_SIZE_TINY: u8 = 0x02;
/// Record fills the record-id field exactly.
pub const KEY_BLOB_SIZE_SMALL: u8 = 0x04;
/// Record is zero-length.
pub const KEY_BLOB_SIZE_EMPTY: u8 = 0x08;

/// Flags that only make sense in a leaf. Stripped whenever a key is copied
/// into an internal node.
pub const KEY_LEAF_ONLY_FLAGS: u8 = KEY_BLOB_SIZE_TINY | KEY_BLOB_SIZE_SMALL | KEY_BLOB_SIZE_EMPTY;

/// Bytes of a slot before the inline key area.
pub const SLOT_OVERHEAD: usize = 11;

/// Width of the extended-blob id stored in the inline tail.
pub const EXTENDED_ID_SIZE: usize = 8;

const FLAGS_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 1;
const RID_OFFSET: usize = 3;
const DATA_OFFSET: usize = SLOT_OVERHEAD;

/// Total bytes one slot occupies for a given inline key capacity.
#[inline]
pub fn slot_stride(key_size: u16) -> usize {
    SLOT_OVERHEAD + key_size as usize
}

/// Inline prefix length for an extended key.
#[inline]
pub fn extended_prefix_len(key_size: u16) -> usize {
    key_size as usize - EXTENDED_ID_SIZE
}

/// Read-only view of one slot. The slice covers exactly one stride.
#[derive(Clone, Copy)]
pub struct KeyRef<'a> {
    slot: &'a [u8],
}

impl<'a> KeyRef<'a> {
    #[inline]
    pub fn new(slot: &'a [u8]) -> Self {
        debug_assert!(slot.len() > SLOT_OVERHEAD);
        Self { slot }
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.slot[FLAGS_OFFSET]
    }

    #[inline]
    pub fn is_extended(&self) -> bool {
        self.flags() & KEY_IS_EXTENDED != 0
    }

    /// Logical key length, which exceeds the inline capacity for extended
    /// keys.
    #[inline]
    pub fn size(&self) -> usize {
        u16::from_le_bytes([self.slot[SIZE_OFFSET], self.slot[SIZE_OFFSET + 1]]) as usize
    }

    /// Record id interpreted as a page/blob address.
    #[inline]
    pub fn rid(&self) -> u64 {
        u64::from_le_bytes(self.rid_bytes())
    }

    /// Raw record-id field, for inline records.
    #[inline]
    pub fn rid_bytes(&self) -> [u8; 8] {
        self.slot[RID_OFFSET..RID_OFFSET + 8]
            .try_into()
            .unwrap_or([0; 8])
    }

    /// The whole inline key area.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        &self.slot[DATA_OFFSET..]
    }

    /// Valid inline key bytes: the full logical key for regular keys, the
    /// prefix for extended ones.
    pub fn inline_key(&self) -> &'a [u8] {
        let inline_cap = self.slot.len() - DATA_OFFSET;
        let len = if self.is_extended() {
            inline_cap - EXTENDED_ID_SIZE
        } else {
            self.size().min(inline_cap)
        };
        &self.slot[DATA_OFFSET..DATA_OFFSET + len]
    }

    /// Blob id of an extended key, stored in the inline tail.
    pub fn extended_id(&self) -> u64 {
        let end = self.slot.len();
        u64::from_le_bytes(
            self.slot[end - EXTENDED_ID_SIZE..]
                .try_into()
                .unwrap_or([0; 8]),
        )
    }
}

/// Mutable view of one slot.
pub struct KeyMut<'a> {
    slot: &'a mut [u8],
}

impl<'a> KeyMut<'a> {
    #[inline]
    pub fn new(slot: &'a mut [u8]) -> Self {
        debug_assert!(slot.len() > SLOT_OVERHEAD);
        Self { slot }
    }

    pub fn as_ref(&self) -> KeyRef<'_> {
        KeyRef::new(self.slot)
    }

    #[inline]
    pub fn set_flags(&mut self, flags: u8) {
        self.slot[FLAGS_OFFSET] = flags;
    }

    #[inline]
    pub fn set_size(&mut self, size: usize) {
        debug_assert!(size <= u16::MAX as usize);
        self.slot[SIZE_OFFSET..SIZE_OFFSET + 2].copy_from_slice(&(size as u16).to_le_bytes());
    }

    #[inline]
    pub fn set_rid(&mut self, rid: u64) {
        self.slot[RID_OFFSET..RID_OFFSET + 8].copy_from_slice(&rid.to_le_bytes());
    }

    #[inline]
    pub fn set_rid_bytes(&mut self, bytes: &[u8; 8]) {
        self.slot[RID_OFFSET..RID_OFFSET + 8].copy_from_slice(bytes);
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.slot[DATA_OFFSET..]
    }

    pub fn set_extended_id(&mut self, blob_id: u64) {
        let end = self.slot.len();
        self.slot[end - EXTENDED_ID_SIZE..].copy_from_slice(&blob_id.to_le_bytes());
    }
}

/// Decoded record location for a leaf slot.
#[derive(Debug, PartialEq, Eq)]
pub enum InlineRecord<'a> {
    Empty,
    Tiny(&'a [u8]),
    Small(&'a [u8]),
    Blob(u64),
}

/// Interprets a leaf slot's flags and record-id field.
pub fn unpack_record<'a>(flags: u8, rid: &'a [u8; 8]) -> InlineRecord<'a> {
    if flags & KEY_BLOB_SIZE_EMPTY != 0 {
        InlineRecord::Empty
    } else if flags & KEY_BLOB_SIZE_TINY != 0 {
        let len = rid[7] as usize;
        InlineRecord::Tiny(&rid[..len.min(7)])
    } else if flags & KEY_BLOB_SIZE_SMALL != 0 {
        InlineRecord::Small(&rid[..])
    } else {
        InlineRecord::Blob(u64::from_le_bytes(*rid))
    }
}

/// Packs a record into the record-id field when it fits, returning the flag
/// to set. Records longer than 8 bytes need a blob; the caller handles
/// those.
pub fn pack_inline_record(record: &[u8], rid: &mut [u8; 8]) -> Option<u8> {
    match record.len() {
        0 => {
            *rid = [0; 8];
            Some(KEY_BLOB_SIZE_EMPTY)
        }
        len if len < 8 => {
            *rid = [0; 8];
            rid[..len].copy_from_slice(record);
            rid[7] = len as u8;
            Some(KEY_BLOB_SIZE_TINY)
        }
        8 => {
            rid.copy_from_slice(record);
            Some(KEY_BLOB_SIZE_SMALL)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_SIZE: u16 = 16;

    fn slot() -> Vec<u8> {
        vec![0u8; slot_stride(KEY_SIZE)]
    }

    #[test]
    fn field_roundtrip() {
        let mut buf = slot();
        {
            let mut key = KeyMut::new(&mut buf);
            key.set_flags(KEY_IS_EXTENDED);
            key.set_size(1000);
            key.set_rid(0xDEAD_BEEF_0123);
            key.set_extended_id(0x4242);
        }
        let key = KeyRef::new(&buf);
        assert!(key.is_extended());
        assert_eq!(key.size(), 1000);
        assert_eq!(key.rid(), 0xDEAD_BEEF_0123);
        assert_eq!(key.extended_id(), 0x4242);
    }

    #[test]
    fn fields_are_little_endian_on_disk() {
        let mut buf = slot();
        KeyMut::new(&mut buf).set_rid(0x0102_0304_0506_0708);
        assert_eq!(&buf[3..11], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);

        KeyMut::new(&mut buf).set_extended_id(0x1122);
        let end = buf.len();
        assert_eq!(&buf[end - 8..end - 6], &[0x22, 0x11]);
    }

    #[test]
    fn inline_key_respects_size() {
        let mut buf = slot();
        {
            let mut key = KeyMut::new(&mut buf);
            key.set_size(3);
            key.data_mut()[..3].copy_from_slice(b"abc");
        }
        assert_eq!(KeyRef::new(&buf).inline_key(), b"abc");
    }

    #[test]
    fn extended_inline_key_is_prefix_only() {
        let mut buf = slot();
        {
            let mut key = KeyMut::new(&mut buf);
            key.set_flags(KEY_IS_EXTENDED);
            key.set_size(100);
            key.data_mut()[..8].copy_from_slice(b"prefix!!");
            key.set_extended_id(77);
        }
        let key = KeyRef::new(&buf);
        // 16-byte inline area minus the 8-byte blob id.
        assert_eq!(key.inline_key().len(), 8);
        assert_eq!(key.extended_id(), 77);
    }

    #[test]
    fn record_packing() {
        let mut rid = [0u8; 8];

        assert_eq!(pack_inline_record(b"", &mut rid), Some(KEY_BLOB_SIZE_EMPTY));
        assert_eq!(unpack_record(KEY_BLOB_SIZE_EMPTY, &rid), InlineRecord::Empty);

        assert_eq!(
            pack_inline_record(b"abc", &mut rid),
            Some(KEY_BLOB_SIZE_TINY)
        );
        assert_eq!(
            unpack_record(KEY_BLOB_SIZE_TINY, &rid),
            InlineRecord::Tiny(b"abc")
        );

        assert_eq!(
            pack_inline_record(b"12345678", &mut rid),
            Some(KEY_BLOB_SIZE_SMALL)
        );
        assert_eq!(
            unpack_record(KEY_BLOB_SIZE_SMALL, &rid),
            InlineRecord::Small(b"12345678")
        );

        assert_eq!(pack_inline_record(b"123456789", &mut rid), None);

        rid = 0x2000u64.to_le_bytes();
        assert_eq!(unpack_record(0, &rid), InlineRecord::Blob(0x2000));
    }

    #[test]
    fn seven_byte_record_is_tiny() {
        let mut rid = [0u8; 8];
        assert_eq!(
            pack_inline_record(b"1234567", &mut rid),
            Some(KEY_BLOB_SIZE_TINY)
        );
        assert_eq!(rid[7], 7);
        assert_eq!(
            unpack_record(KEY_BLOB_SIZE_TINY, &rid),
            InlineRecord::Tiny(b"1234567")
        );
    }
}
