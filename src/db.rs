//! # Database Handle
//!
//! Ties the subsystems together: device, page cache, blob store,
//! extended-key cache, comparator, and the B+tree state (root address and
//! geometry). One handle owns one database; the engine is single-threaded
//! cooperative and a handle must not be shared across threads.
//!
//! ## File Header
//!
//! Page 0 carries the database header in its payload:
//!
//! ```text
//! Offset  Size  Field         Description
//! ------  ----  ------------  -------------------------------
//! 0       4     magic         "mrtn"
//! 4       2     version       format version, currently 1
//! 6       2     key_size      inline key capacity per slot
//! 8       4     page_size     fixed page size
//! 12      4     flags         ENABLE_CRC32, ...
//! 16      8     root_address  0 while the tree is empty
//! 24      8     reserved
//! ```
//!
//! Geometry and checksum settings are fixed at creation time; `open` reads
//! them back from the header and ignores conflicting builder settings.
//!
//! ## Caching Discipline
//!
//! Tree pages are only reached through [`Database::fetch_page`], which
//! consults the cache first. Eviction happens in [`Database::purge_cache`],
//! called at the end of every public operation: each victim has its
//! cursors uncoupled and its dirty bytes flushed before the buffer is
//! dropped, which is what lets coupled cursors survive eviction.

use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use tracing::{debug, trace};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::blob::BlobStore;
use crate::btree::key::{pack_inline_record, unpack_record, InlineRecord, KEY_LEAF_ONLY_FLAGS};
use crate::btree::node::{max_keys, min_keys, NodeMut, NodeRef};
use crate::btree::MIN_USABLE_KEYS;
use crate::cache::PageCache;
use crate::compress::Compressor;
use crate::config::{Comparator, Config};
use crate::device::{AnyDevice, Device, FileDevice, MemDevice};
use crate::error::{corruption, DbError};
use crate::extkeys::ExtKeyCache;
use crate::memory::ByteArena;
use crate::page::{Page, PageRc, PageType, PAGE_HEADER_SIZE};
use crate::zerocopy_accessors;

const DB_MAGIC: u32 = u32::from_le_bytes(*b"mrtn");
const DB_VERSION: u16 = 1;
const DB_HEADER_SIZE: usize = 32;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct DbHeader {
    magic: U32,
    version: U16,
    key_size: U16,
    page_size: U32,
    flags: U32,
    root_address: U64,
    reserved: [u8; 8],
}

impl DbHeader {
    zerocopy_accessors! {
        magic: u32,
        version: u16,
        key_size: u16,
        page_size: u32,
        flags: u32,
        root_address: u64,
    }
}

/// Builder for opening or creating a database.
///
/// ```ignore
/// let mut db = Database::builder()
///     .path("./data.mdb")
///     .page_size(16 * 1024)
///     .enable_crc(true)
///     .create()?;
/// ```
pub struct DatabaseBuilder {
    config: Config,
    comparator: Comparator,
    compressor: Option<Box<dyn Compressor>>,
}

impl DatabaseBuilder {
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = Some(path.into());
        self
    }

    /// Keeps all data in memory; nothing survives the handle.
    pub fn in_memory(mut self) -> Self {
        self.config.path = None;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.config.page_size = page_size;
        self
    }

    pub fn key_size(mut self, key_size: u16) -> Self {
        self.config.key_size = key_size;
        self
    }

    pub fn cache_capacity(mut self, pages: usize) -> Self {
        self.config.cache_capacity = pages;
        self
    }

    pub fn enable_crc(mut self, enable: bool) -> Self {
        self.config.enable_crc = enable;
        self
    }

    pub fn comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = comparator;
        self
    }

    /// Compresses out-of-line payloads with the given strategy.
    pub fn compressor(mut self, compressor: Box<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Creates a fresh database, truncating an existing file.
    pub fn create(self) -> Result<Database> {
        self.config.validate()?;
        let flags = self.config.device_flags();
        let device = match &self.config.path {
            Some(path) => {
                AnyDevice::File(FileDevice::create(path, self.config.page_size, flags)?)
            }
            None => AnyDevice::Mem(MemDevice::new(self.config.page_size, flags)),
        };

        let max = max_keys(self.config.page_size, self.config.key_size);
        let mut db = Database {
            cache: PageCache::new(self.config.cache_capacity),
            blobs: BlobStore::new(self.compressor),
            extkeys: ExtKeyCache::new(),
            comparator: self.comparator,
            device,
            root_address: 0,
            header_dirty: false,
            max_keys: max,
            config: self.config,
        };

        // Page 0: the database header.
        let mut page = Page::new(db.config.page_size);
        page.alloc(&mut db.device, PageType::Header)?;
        ensure!(
            page.address() == 0,
            "header page landed at {}, expected 0",
            page.address()
        );
        db.cache
            .insert(0, std::rc::Rc::new(std::cell::RefCell::new(page)));
        db.write_header()?;
        debug!(page_size = db.config.page_size, key_size = db.config.key_size, "created database");
        Ok(db)
    }

    /// Opens an existing database file. Geometry and checksum settings are
    /// taken from the stored header.
    pub fn open(self) -> Result<Database> {
        let path = self
            .config
            .path
            .clone()
            .ok_or(DbError::InvalidArgument("open requires a file path"))?;

        let header = read_bootstrap_header(&path)?;
        let page_size = header.page_size();
        let key_size = header.key_size();
        let flags = header.flags();

        let config = Config {
            page_size,
            key_size,
            cache_capacity: self.config.cache_capacity,
            enable_crc: flags & crate::config::ENABLE_CRC32 != 0,
            path: Some(path.clone()),
        };
        config.validate()?;

        let max = max_keys(page_size, key_size);
        ensure!(
            max >= MIN_USABLE_KEYS,
            "stored geometry yields only {} keys per node",
            max
        );

        let device = AnyDevice::File(FileDevice::open(&path, page_size, flags)?);
        let mut db = Database {
            cache: PageCache::new(config.cache_capacity),
            blobs: BlobStore::new(self.compressor),
            extkeys: ExtKeyCache::new(),
            comparator: self.comparator,
            device,
            root_address: 0,
            header_dirty: false,
            max_keys: max,
            config,
        };

        // Re-read through the page path so the checksum is verified.
        let page0 = db.fetch_page(0)?;
        let root_address = {
            let p = page0.borrow();
            let header = DbHeader::ref_from_bytes(&p.payload()[..DB_HEADER_SIZE])
                .map_err(|e| corruption(format!("unreadable database header: {e:?}")))?;
            header.root_address()
        };
        db.root_address = root_address;
        debug!(root = root_address, "opened database");
        Ok(db)
    }
}

/// Reads the database header straight from the file, before any device
/// exists — the page size needed to build the device lives inside it.
fn read_bootstrap_header(path: &Path) -> Result<DbHeader> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)
        .map_err(DbError::Io)
        .wrap_err_with(|| format!("reading database header from {}", path.display()))?;
    let mut bytes = [0u8; PAGE_HEADER_SIZE + DB_HEADER_SIZE];
    file.read_exact(&mut bytes)
        .map_err(|_| corruption("file too short for a database header"))?;
    let header = DbHeader::read_from_bytes(&bytes[PAGE_HEADER_SIZE..])
        .map_err(|e| corruption(format!("unreadable database header: {e:?}")))?;

    if header.magic() != DB_MAGIC {
        return Err(corruption(format!(
            "bad magic {:#010x}, not a martendb file",
            header.magic()
        )));
    }
    if header.version() != DB_VERSION {
        return Err(corruption(format!(
            "unsupported format version {}",
            header.version()
        )));
    }
    Ok(header)
}

/// An embedded key/value database backed by a disk-resident B+tree.
#[derive(Debug)]
pub struct Database {
    pub(crate) config: Config,
    pub(crate) comparator: Comparator,
    pub(crate) device: AnyDevice,
    pub(crate) cache: PageCache,
    pub(crate) blobs: BlobStore,
    pub(crate) extkeys: ExtKeyCache,
    pub(crate) root_address: u64,
    pub(crate) header_dirty: bool,
    pub(crate) max_keys: u16,
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder {
            config: Config::default(),
            comparator: Comparator::Lexicographic,
            compressor: None,
        }
    }

    /// Address of the current tree root; 0 while the tree is empty.
    pub fn root_address(&self) -> u64 {
        self.root_address
    }

    /// Slots per node for this database's geometry.
    pub fn max_keys(&self) -> u16 {
        self.max_keys
    }

    /// Rebalance threshold derived from `max_keys`.
    pub fn min_keys(&self) -> u16 {
        min_keys(self.max_keys)
    }

    /// Number of pages currently held by the cache.
    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    /// Loads a page through the cache, verifying its checksum on a miss.
    pub(crate) fn fetch_page(&mut self, address: u64) -> Result<PageRc> {
        if let Some(page) = self.cache.get(address) {
            return Ok(page);
        }
        let mut page = Page::new(self.config.page_size);
        page.fetch(&mut self.device, address)?;
        let page = std::rc::Rc::new(std::cell::RefCell::new(page));
        self.cache.insert(address, page.clone());
        Ok(page)
    }

    /// Allocates and initializes a fresh tree page.
    pub(crate) fn alloc_tree_page(&mut self, page_type: PageType, is_leaf: bool) -> Result<PageRc> {
        let mut page = Page::new(self.config.page_size);
        page.alloc(&mut self.device, page_type)?;
        {
            let mut node = NodeMut::new(page.payload_mut(), self.config.key_size);
            node.init(is_leaf);
        }
        let address = page.address();
        let page = std::rc::Rc::new(std::cell::RefCell::new(page));
        self.cache.insert(address, page.clone());
        Ok(page)
    }

    /// Drops a page from the cache without writing it back. The caller has
    /// already uncoupled any cursors (structural primitives do this before
    /// freeing).
    pub(crate) fn free_page(&mut self, page: &PageRc) -> Result<()> {
        let address = page.borrow().address();
        self.cache.remove(address);
        trace!(address, "freed page");
        Ok(())
    }

    /// Evicts pages beyond the cache capacity: uncouple cursors, flush
    /// dirty bytes, drop the buffer.
    pub fn purge_cache(&mut self) -> Result<()> {
        while self.cache.is_over_capacity() {
            let victim = match self.cache.evict_candidate() {
                Some(address) => address,
                None => break,
            };
            let page = match self.cache.peek(victim) {
                Some(page) => page,
                None => break,
            };
            self.uncouple_all_cursors(&page, 0)?;
            page.borrow_mut().flush(&mut self.device)?;
            drop(page);
            self.cache.remove(victim);
            trace!(address = victim, "evicted page");
        }
        Ok(())
    }

    /// Writes the database header into page 0.
    fn write_header(&mut self) -> Result<()> {
        let header = DbHeader {
            magic: U32::new(DB_MAGIC),
            version: U16::new(DB_VERSION),
            key_size: U16::new(self.config.key_size),
            page_size: U32::new(self.config.page_size),
            flags: U32::new(self.config.device_flags()),
            root_address: U64::new(self.root_address),
            reserved: [0; 8],
        };
        let page0 = self.fetch_page(0)?;
        let mut p = page0.borrow_mut();
        p.payload_mut()[..DB_HEADER_SIZE].copy_from_slice(header.as_bytes());
        p.set_dirty();
        Ok(())
    }

    /// Writes out the header (if the root moved) and every dirty page,
    /// then syncs the device.
    pub fn flush(&mut self) -> Result<()> {
        if self.header_dirty {
            self.write_header()?;
            self.header_dirty = false;
        }
        let pages: Vec<PageRc> = self.cache.pages().cloned().collect();
        for page in pages {
            page.borrow_mut().flush(&mut self.device)?;
        }
        self.device.flush()?;
        Ok(())
    }

    /// Flushes and consumes the handle. Close (or nil) all cursors first.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /// Duplicates a blob: reads the source and allocates an identical new
    /// blob. Ids are never shared between keys.
    pub(crate) fn deep_copy_blob(&mut self, src_id: u64) -> Result<u64> {
        let mut arena = ByteArena::new();
        let len = self.blobs.read(&mut self.device, src_id, &mut arena)?;
        self.blobs
            .allocate(&mut self.device, &arena.as_slice()[..len])
    }

    /// Materializes the record of a leaf slot into `arena` and returns its
    /// length.
    pub(crate) fn read_record_at(
        &mut self,
        page: &PageRc,
        slot: usize,
        arena: &mut ByteArena,
    ) -> Result<usize> {
        let (flags, rid) = {
            let p = page.borrow();
            let node = NodeRef::new(p.payload(), self.config.key_size);
            let key = node.key(slot);
            (key.flags(), key.rid_bytes())
        };
        match unpack_record(flags, &rid) {
            InlineRecord::Empty => {
                arena.clear();
                Ok(0)
            }
            InlineRecord::Tiny(data) => {
                arena.assign(data);
                Ok(data.len())
            }
            InlineRecord::Small(data) => {
                arena.assign(data);
                Ok(8)
            }
            InlineRecord::Blob(blob_id) => {
                if blob_id == 0 {
                    return Err(corruption(format!(
                        "record blob id is zero in page {} slot {}",
                        page.borrow().address(),
                        slot
                    )));
                }
                self.blobs.read(&mut self.device, blob_id, arena)
            }
        }
    }

    /// Replaces the record of a leaf slot. The new record's blob (if any)
    /// is allocated before the old one is released, so a failed allocation
    /// leaves the slot untouched.
    pub(crate) fn overwrite_record(
        &mut self,
        page: &PageRc,
        slot: usize,
        record: &[u8],
    ) -> Result<()> {
        let (old_flags, old_rid) = {
            let p = page.borrow();
            let node = NodeRef::new(p.payload(), self.config.key_size);
            let key = node.key(slot);
            (key.flags(), key.rid_bytes())
        };

        let mut new_rid = [0u8; 8];
        let record_flags = match pack_inline_record(record, &mut new_rid) {
            Some(flags) => flags,
            None => {
                let blob_id = self.blobs.allocate(&mut self.device, record)?;
                new_rid = blob_id.to_le_bytes();
                0
            }
        };

        if let InlineRecord::Blob(old_id) = unpack_record(old_flags, &old_rid) {
            if old_id != 0 {
                self.blobs.free(&mut self.device, old_id)?;
            }
        }

        let mut p = page.borrow_mut();
        let mut node = NodeMut::new(p.payload_mut(), self.config.key_size);
        let mut key = node.key_mut(slot);
        key.set_flags((old_flags & !KEY_LEAF_ONLY_FLAGS) | record_flags);
        key.set_rid_bytes(&new_rid);
        p.set_dirty();
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Best-effort durability for handles dropped without an explicit
        // close.
        let _ = self.flush();
    }
}
