//! # Blob Store
//!
//! Out-of-line storage for payloads that do not fit inside a slot: records
//! larger than the 8-byte inline field and the overflow portion of extended
//! keys. A blob occupies one or more consecutive header-less pages allocated
//! straight from the device; the blob id is the address of its first page.
//!
//! ## Blob Layout
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  ------------------------------------
//! 0       4     flags      FREED, COMPRESSED
//! 4       4     reserved
//! 8       8     size       stored payload bytes
//! 16      8     orig_size  logical payload bytes
//! 24      ...   payload
//! ```
//!
//! ## Ownership
//!
//! A blob is owned by exactly one key (or record) at a time. Copying a key
//! that references a blob allocates a new blob — ids are never shared and
//! never reference counted. Freeing stamps the `FREED` flag so a dangling
//! reference surfaces as [`DbError::Corruption`] instead of silently reading
//! reused bytes. Freed pages are not returned to the device; reclaiming
//! them is a compaction concern outside this engine.
//!
//! ## Compression
//!
//! When the database was opened with a [`Compressor`], payloads that shrink
//! under it are stored compressed and transparently expanded on read. The
//! stored size and original size both live in the header, so `record_size`
//! queries never touch the payload.
//!
//! [`DbError::Corruption`]: crate::DbError::Corruption

use eyre::Result;
use tracing::debug;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::compress::Compressor;
use crate::device::{AnyDevice, Device};
use crate::error::corruption;
use crate::memory::ByteArena;
use crate::page::{Page, PageType};
use crate::zerocopy_accessors;

pub const BLOB_HEADER_SIZE: usize = 24;

const BLOB_FREED: u32 = 0x0001;
const BLOB_COMPRESSED: u32 = 0x0002;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct BlobHeader {
    flags: U32,
    reserved: U32,
    size: U64,
    orig_size: U64,
}

impl BlobHeader {
    zerocopy_accessors! {
        flags: u32,
        size: u64,
        orig_size: u64,
    }

    fn is_freed(&self) -> bool {
        self.flags.get() & BLOB_FREED != 0
    }

    fn is_compressed(&self) -> bool {
        self.flags.get() & BLOB_COMPRESSED != 0
    }
}

pub struct BlobStore {
    compressor: Option<Box<dyn Compressor>>,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("compression", &self.compressor.is_some())
            .finish()
    }
}

impl BlobStore {
    pub fn new(compressor: Option<Box<dyn Compressor>>) -> Self {
        Self { compressor }
    }

    /// Stores `data` and returns the new blob id. Never returns 0.
    pub fn allocate(&mut self, device: &mut AnyDevice, data: &[u8]) -> Result<u64> {
        let mut flags = 0u32;
        let mut stored: &[u8] = data;

        let mut scratch = ByteArena::new();
        if let Some(compressor) = &mut self.compressor {
            // Size the output buffer to the worst-case bound up front so
            // the compressor writes without reallocating.
            scratch.resize(compressor.compressed_length(data.len()));
            let compressed_len = compressor.compress(data, None, &mut scratch)?;
            if compressed_len < data.len() {
                stored = &scratch.as_slice()[..compressed_len];
                flags |= BLOB_COMPRESSED;
            }
        }

        let header = BlobHeader {
            flags: U32::new(flags),
            reserved: U32::new(0),
            size: U64::new(stored.len() as u64),
            orig_size: U64::new(data.len() as u64),
        };

        let page_size = device.page_size() as usize;
        let total = BLOB_HEADER_SIZE + stored.len();

        let blob_id = if total <= page_size {
            // Single-page blobs go through a header-less page buffer so the
            // regular flush path (which skips checksums for them) applies.
            let mut page = Page::new_without_header(device.page_size());
            page.alloc(device, PageType::Blob)?;
            let payload = page.payload_mut();
            payload[..BLOB_HEADER_SIZE].copy_from_slice(header.as_bytes());
            payload[BLOB_HEADER_SIZE..total].copy_from_slice(stored);
            page.flush(device)?;
            page.address()
        } else {
            let first = device.alloc_page()?;
            let mut allocated = page_size;
            while allocated < total {
                let next = device.alloc_page()?;
                debug_assert_eq!(next, first + allocated as u64);
                allocated += page_size;
            }

            let mut buf = vec![0u8; total];
            buf[..BLOB_HEADER_SIZE].copy_from_slice(header.as_bytes());
            buf[BLOB_HEADER_SIZE..].copy_from_slice(stored);
            device.write(first, &buf)?;
            first
        };

        debug!(blob_id, size = data.len(), compressed = flags & BLOB_COMPRESSED != 0, "allocated blob");
        Ok(blob_id)
    }

    fn read_header(&self, device: &mut AnyDevice, blob_id: u64) -> Result<BlobHeader> {
        if blob_id == 0 {
            return Err(corruption("blob id is zero"));
        }
        let mut buf = [0u8; BLOB_HEADER_SIZE];
        device.read(blob_id, &mut buf)?;
        let header = BlobHeader::read_from_bytes(&buf)
            .map_err(|e| corruption(format!("unreadable blob header at {blob_id}: {e:?}")))?;
        Ok(header)
    }

    /// Materializes the blob payload into `arena` and returns its logical
    /// length.
    pub fn read(
        &mut self,
        device: &mut AnyDevice,
        blob_id: u64,
        arena: &mut ByteArena,
    ) -> Result<usize> {
        let header = self.read_header(device, blob_id)?;
        if header.is_freed() {
            return Err(corruption(format!("read of freed blob {blob_id}")));
        }

        let stored_len = header.size() as usize;
        let orig_len = header.orig_size() as usize;

        if header.is_compressed() {
            let mut stored = vec![0u8; stored_len];
            device.read(blob_id + BLOB_HEADER_SIZE as u64, &mut stored)?;
            let compressor = self.compressor.as_mut().ok_or_else(|| {
                corruption(format!(
                    "blob {blob_id} is compressed but no compressor is configured"
                ))
            })?;
            compressor.decompress(&stored, orig_len, arena)?;
        } else {
            arena.resize(stored_len);
            device.read(blob_id + BLOB_HEADER_SIZE as u64, arena.as_mut_slice())?;
        }
        Ok(orig_len)
    }

    /// Logical size of the blob, without touching the payload.
    pub fn size(&mut self, device: &mut AnyDevice, blob_id: u64) -> Result<u64> {
        let header = self.read_header(device, blob_id)?;
        if header.is_freed() {
            return Err(corruption(format!("size query on freed blob {blob_id}")));
        }
        Ok(header.orig_size())
    }

    /// Releases the blob. Subsequent reads of this id fail with a
    /// corruption error until the space is reused.
    pub fn free(&mut self, device: &mut AnyDevice, blob_id: u64) -> Result<()> {
        let mut header = self.read_header(device, blob_id)?;
        if header.is_freed() {
            return Err(corruption(format!("double free of blob {blob_id}")));
        }
        header.set_flags(header.flags() | BLOB_FREED);
        device.write(blob_id, header.as_bytes())?;
        debug!(blob_id, "freed blob");
        Ok(())
    }
}
