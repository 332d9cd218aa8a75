//! # Page Buffer
//!
//! A [`Page`] exclusively owns the raw bytes of one fixed-size page and the
//! metadata that ties the in-memory representation to its persisted form:
//! address, dirty state, and the header-less marker for pages (blob storage)
//! that omit the common header.
//!
//! ## Page Layout
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  -----------------------------------------
//! 0       4     crc32      MurmurHash3 x86-32 of the payload, seeded
//!                          with the page address; stamped on flush
//! 4       1     page_type  Header / BtreeRoot / BtreeIndex / Blob
//! 5       1     flags      reserved
//! 6       2     reserved
//! 8       ...   payload    node header + slots, or blob bytes
//! ```
//!
//! Header-less pages skip all of the above; their payload is the whole raw
//! buffer and they are never checksummed.
//!
//! ## Checksums
//!
//! The checksum is keyed by the page's byte-offset address, so an identical
//! payload persisted at a different offset yields a different digest. A
//! mismatch during fetch surfaces as [`DbError::Corruption`]. Stamping
//! happens in `flush` and is never skipped while checksums are enabled and
//! the page carries a header.
//!
//! ## Descriptors and Shadow Copies
//!
//! The raw bytes live in a [`PersistedData`] descriptor rather than in the
//! `Page` directly. [`Page::deep_copy_data`] installs a fresh copy of the
//! bytes as the page's primary descriptor and hands the previous one to the
//! caller, who now owns a pre-mutation snapshot that can be flushed while
//! the page keeps mutating. Ownership transfers fully; nothing is reference
//! counted.
//!
//! ## Cursor Registration
//!
//! Every cursor coupled to a slot of this page is registered in the page's
//! cursor list, so structural edits can uncouple exactly the affected
//! cursors before slots move. The list holds weak references; a page must
//! have no live coupled cursors left when it is dropped.
//!
//! ## Thread Safety
//!
//! None. Pages are reached through a single database handle.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use eyre::{ensure, Result};
use smallvec::SmallVec;
use tracing::trace;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::cursor::BtreeCursor;
use crate::config::ENABLE_CRC32;
use crate::device::{AnyDevice, Device};
use crate::error::{corruption, DbError};
use crate::zerocopy_accessors;

/// Size of the common page header.
pub const PAGE_HEADER_SIZE: usize = 8;

/// Shared handle to a cached page.
pub type PageRc = Rc<RefCell<Page>>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0x00,
    /// Page 0, carrying the database header.
    Header = 0x01,
    /// The B+tree root node.
    BtreeRoot = 0x02,
    /// Any non-root B+tree node.
    BtreeIndex = 0x03,
    /// Blob storage (header-less).
    Blob = 0x04,
}

impl PageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageType::Header,
            0x02 => PageType::BtreeRoot,
            0x03 => PageType::BtreeIndex,
            0x04 => PageType::Blob,
            _ => PageType::Unknown,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    crc32: U32,
    page_type: u8,
    flags: u8,
    reserved: [u8; 2],
}

impl PageHeader {
    zerocopy_accessors! {
        crc32: u32,
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_byte(self.page_type)
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.page_type = page_type as u8;
    }

    fn is_blank(&self) -> bool {
        self.crc32.get() == 0 && self.page_type == 0 && self.flags == 0
    }
}

/// One page's raw bytes plus the state needed to persist them.
#[derive(Debug)]
pub struct PersistedData {
    pub address: u64,
    pub size: u32,
    pub is_dirty: bool,
    pub is_without_header: bool,
    pub raw: Box<[u8]>,
}

impl PersistedData {
    fn new(size: u32, is_without_header: bool) -> Self {
        Self {
            address: 0,
            size,
            is_dirty: false,
            is_without_header,
            raw: vec![0u8; size as usize].into_boxed_slice(),
        }
    }

    fn deep_clone(&self) -> Self {
        Self {
            address: self.address,
            size: self.size,
            is_dirty: self.is_dirty,
            is_without_header: self.is_without_header,
            raw: self.raw.clone(),
        }
    }

    /// Payload region: everything after the common header, or the whole
    /// buffer for header-less pages.
    pub fn payload(&self) -> &[u8] {
        if self.is_without_header {
            &self.raw
        } else {
            &self.raw[PAGE_HEADER_SIZE..]
        }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        if self.is_without_header {
            &mut self.raw
        } else {
            &mut self.raw[PAGE_HEADER_SIZE..]
        }
    }
}

#[derive(Debug)]
pub struct Page {
    data: Box<PersistedData>,
    cursors: Vec<Weak<RefCell<BtreeCursor>>>,
}

impl Page {
    pub fn new(page_size: u32) -> Self {
        Self {
            data: Box::new(PersistedData::new(page_size, false)),
            cursors: Vec::new(),
        }
    }

    /// A page without the common header. Blob pages use this; they are
    /// never checksummed and carry no type byte.
    pub fn new_without_header(page_size: u32) -> Self {
        Self {
            data: Box::new(PersistedData::new(page_size, true)),
            cursors: Vec::new(),
        }
    }

    /// Asks the device for a fresh page and stamps the node type.
    pub fn alloc(&mut self, device: &mut AnyDevice, page_type: PageType) -> Result<()> {
        let address = device.alloc_page()?;
        self.data.address = address;
        if !self.data.is_without_header {
            self.header_mut()?.set_page_type(page_type);
        }
        self.data.is_dirty = true;
        Ok(())
    }

    /// Populates the buffer from the backing store. Verifies the checksum
    /// when the device has checksums enabled and the page carries a header.
    pub fn fetch(&mut self, device: &mut AnyDevice, address: u64) -> Result<()> {
        device.read_page(address, &mut self.data.raw)?;
        self.data.address = address;
        self.data.is_dirty = false;

        if device.config().flags & ENABLE_CRC32 != 0 && !self.data.is_without_header {
            let header = self.header()?;
            if !header.is_blank() {
                let stored = header.crc32();
                let computed = page_checksum(self.data.payload(), address)?;
                if stored != computed {
                    return Err(corruption(format!(
                        "checksum mismatch on page {address}: stored {stored:#010x}, computed {computed:#010x}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Persists a descriptor if it is dirty: stamp the checksum (when
    /// enabled and applicable), write the whole page, clear the dirty bit.
    /// Works on any descriptor so shadow copies can be flushed too.
    pub fn flush_data(device: &mut AnyDevice, data: &mut PersistedData) -> Result<()> {
        if !data.is_dirty {
            return Ok(());
        }

        if device.config().flags & ENABLE_CRC32 != 0 && !data.is_without_header {
            let crc = page_checksum(&data.raw[PAGE_HEADER_SIZE..], data.address)?;
            let header = PageHeader::mut_from_bytes(&mut data.raw[..PAGE_HEADER_SIZE])
                .map_err(|e| corruption(format!("unreadable page header: {e:?}")))?;
            header.set_crc32(crc);
        }

        trace!(address = data.address, "flushing page");
        device.write(data.address, &data.raw)?;
        data.is_dirty = false;
        Ok(())
    }

    /// Flushes this page's primary descriptor.
    pub fn flush(&mut self, device: &mut AnyDevice) -> Result<()> {
        Page::flush_data(device, &mut self.data)
    }

    /// Installs a fresh copy of the raw bytes as the primary descriptor and
    /// returns the previous one. The caller owns the returned snapshot and
    /// is responsible for flushing or discarding it.
    pub fn deep_copy_data(&mut self) -> Box<PersistedData> {
        let copy = Box::new(self.data.deep_clone());
        std::mem::replace(&mut self.data, copy)
    }

    pub fn address(&self) -> u64 {
        self.data.address
    }

    pub fn is_dirty(&self) -> bool {
        self.data.is_dirty
    }

    pub fn set_dirty(&mut self) {
        self.data.is_dirty = true;
    }

    pub fn size(&self) -> u32 {
        self.data.size
    }

    pub fn is_without_header(&self) -> bool {
        self.data.is_without_header
    }

    pub fn data(&self) -> &PersistedData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut PersistedData {
        &mut self.data
    }

    pub fn payload(&self) -> &[u8] {
        self.data.payload()
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.data.payload_mut()
    }

    pub fn header(&self) -> Result<&PageHeader> {
        ensure!(
            !self.data.is_without_header,
            "header access on a header-less page"
        );
        PageHeader::ref_from_bytes(&self.data.raw[..PAGE_HEADER_SIZE])
            .map_err(|e| corruption(format!("unreadable page header: {e:?}")))
    }

    pub fn header_mut(&mut self) -> Result<&mut PageHeader> {
        ensure!(
            !self.data.is_without_header,
            "header access on a header-less page"
        );
        PageHeader::mut_from_bytes(&mut self.data.raw[..PAGE_HEADER_SIZE])
            .map_err(|e| corruption(format!("unreadable page header: {e:?}")))
    }

    pub fn page_type(&self) -> Result<PageType> {
        Ok(self.header()?.page_type())
    }

    pub fn set_page_type(&mut self, page_type: PageType) -> Result<()> {
        self.header_mut()?.set_page_type(page_type);
        self.data.is_dirty = true;
        Ok(())
    }

    /// Registers a coupled cursor on this page.
    pub(crate) fn add_cursor(&mut self, cursor: Weak<RefCell<BtreeCursor>>) {
        self.cursors.push(cursor);
    }

    /// Unregisters a cursor. Expired entries are pruned as a side effect.
    pub(crate) fn remove_cursor(&mut self, cursor: &Rc<RefCell<BtreeCursor>>) {
        let target = Rc::as_ptr(cursor);
        self.cursors
            .retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), target));
    }

    /// Snapshot of the live cursors currently coupled to this page. Dead
    /// weak entries are pruned.
    pub(crate) fn live_cursors(&mut self) -> SmallVec<[Rc<RefCell<BtreeCursor>>; 8]> {
        let mut live = SmallVec::new();
        self.cursors.retain(|w| match w.upgrade() {
            Some(rc) => {
                live.push(rc);
                true
            }
            None => false,
        });
        live
    }

    /// Number of live cursors coupled to this page.
    pub fn cursor_count(&mut self) -> usize {
        self.live_cursors().len()
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        debug_assert!(
            self.cursors.iter().all(|w| w.strong_count() == 0),
            "page {} dropped with coupled cursors",
            self.data.address
        );
    }
}

/// MurmurHash3 x86-32 of `payload`, seeded with the page address.
pub fn page_checksum(payload: &[u8], address: u64) -> Result<u32> {
    let crc = murmur3::murmur3_32(&mut &payload[..], address as u32).map_err(DbError::Io)?;
    Ok(crc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_device(page_size: u32, flags: u32) -> AnyDevice {
        AnyDevice::Mem(crate::device::MemDevice::new(page_size, flags))
    }

    fn write_count(device: &AnyDevice) -> u64 {
        match device {
            AnyDevice::Mem(d) => d.write_count(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn alloc_stamps_type_and_marks_dirty() {
        let mut device = mem_device(256, 0);
        let mut page = Page::new(256);
        page.alloc(&mut device, PageType::BtreeRoot).unwrap();

        assert_eq!(page.address(), 0);
        assert!(page.is_dirty());
        assert_eq!(page.page_type().unwrap(), PageType::BtreeRoot);
    }

    #[test]
    fn flush_stamps_checksum_and_clears_dirty() {
        let mut device = mem_device(256, ENABLE_CRC32);
        let mut page = Page::new(256);
        page.alloc(&mut device, PageType::BtreeIndex).unwrap();
        page.payload_mut()[0] = 0x42;
        page.set_dirty();

        page.flush(&mut device).unwrap();

        assert!(!page.is_dirty());
        let expected = page_checksum(page.payload(), page.address()).unwrap();
        assert_eq!(page.header().unwrap().crc32(), expected);

        // A clean page is not rewritten.
        let writes = write_count(&device);
        page.flush(&mut device).unwrap();
        assert_eq!(write_count(&device), writes);
    }

    #[test]
    fn checksum_depends_on_address() {
        let payload = [7u8; 64];
        let a = page_checksum(&payload, 256).unwrap();
        let b = page_checksum(&payload, 512).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn fetch_detects_corruption() {
        let mut device = mem_device(256, ENABLE_CRC32);
        let address;
        {
            let mut page = Page::new(256);
            page.alloc(&mut device, PageType::BtreeIndex).unwrap();
            address = page.address();
            page.payload_mut()[10] = 0x99;
            page.set_dirty();
            page.flush(&mut device).unwrap();
        }

        // Flip a payload byte behind the engine's back.
        if let AnyDevice::Mem(d) = &mut device {
            d.bytes_mut()[address as usize + PAGE_HEADER_SIZE + 10] ^= 0xFF;
        }

        let mut page = Page::new(256);
        let err = page.fetch(&mut device, address).unwrap_err();
        assert!(DbError::is_corruption(&err));
    }

    #[test]
    fn fetch_roundtrip_without_crc() {
        let mut device = mem_device(256, 0);
        let address;
        {
            let mut page = Page::new(256);
            page.alloc(&mut device, PageType::BtreeIndex).unwrap();
            address = page.address();
            page.payload_mut()[..4].copy_from_slice(b"abcd");
            page.set_dirty();
            page.flush(&mut device).unwrap();
        }

        let mut page = Page::new(256);
        page.fetch(&mut device, address).unwrap();
        assert_eq!(&page.payload()[..4], b"abcd");
        assert!(!page.is_dirty());
    }

    #[test]
    fn deep_copy_hands_over_snapshot() {
        let mut device = mem_device(256, 0);
        let mut page = Page::new(256);
        page.alloc(&mut device, PageType::BtreeIndex).unwrap();
        page.payload_mut()[0] = 1;

        let before = page.data().raw.clone();
        let shadow = page.deep_copy_data();

        // The snapshot holds the pre-copy bytes; the page is byte-identical
        // after discarding it.
        assert_eq!(shadow.raw, before);
        drop(shadow);
        assert_eq!(page.data().raw, before);

        // Mutations after the copy do not affect a live snapshot.
        let shadow = page.deep_copy_data();
        page.payload_mut()[0] = 2;
        assert_eq!(shadow.raw[PAGE_HEADER_SIZE], 1);
    }

    #[test]
    fn headerless_page_flush_skips_checksum() {
        let mut device = mem_device(256, ENABLE_CRC32);
        let mut page = Page::new_without_header(256);
        page.alloc(&mut device, PageType::Blob).unwrap();
        page.payload_mut()[..3].copy_from_slice(b"xyz");
        page.set_dirty();
        page.flush(&mut device).unwrap();

        // The payload starts at offset 0; no header was written over it.
        let mut buf = vec![0u8; 256];
        device.read_page(page.address(), &mut buf).unwrap();
        assert_eq!(&buf[..3], b"xyz");
    }
}
