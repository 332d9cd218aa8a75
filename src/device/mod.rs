//! # Device Facade
//!
//! The device allocates, reads, and writes fixed-size pages and hides the
//! difference between file-backed and memory-only storage. Everything above
//! this layer addresses storage by byte offset ("page address"); address 0
//! is always the database header page.
//!
//! ## Interface
//!
//! ```text
//! alloc_page() -> address     extend the backing store by one page
//! read_page(address, buf)     populate a page-sized buffer
//! read(address, buf)          arbitrary-length read (blob store)
//! write(address, bytes)       arbitrary-length write
//! page_size(), config()       capability queries
//! flush()                     durability barrier (fsync for files)
//! ```
//!
//! `read_page` is `read` constrained to `page_size` bytes; it exists
//! separately because the page buffer path is the hot one and asserts the
//! exact length. Blobs span multiple consecutive pages, so the blob store
//! uses the unconstrained variants.
//!
//! ## Backends
//!
//! - [`FileDevice`]: positioned I/O over a plain file. No memory mapping;
//!   the page cache above this layer is the only caching tier, which keeps
//!   the buffer lifecycle (dirty tracking, checksum stamping, shadow copies)
//!   in one place.
//! - [`MemDevice`]: a growable byte vector, used for in-memory databases
//!   and throughout the test suite. Counts writes so tests can assert that
//!   clean pages are not rewritten.
//!
//! [`AnyDevice`] erases the backend without generics, so the database struct
//! stays object-safe and monomorphization-free.
//!
//! ## Thread Safety
//!
//! None. A device belongs to exactly one database handle; the engine is
//! single-threaded cooperative.

mod file;
mod mem;

pub use file::FileDevice;
pub use mem::MemDevice;

use eyre::Result;

/// Capability description advertised by a device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    pub page_size: u32,
    /// Database flag word (`config::ENABLE_CRC32`, ...). The page flush path
    /// consults this to decide whether checksums are stamped.
    pub flags: u32,
}

/// Page-granular storage backend.
pub trait Device {
    /// Extends the backing store by one page and returns its address.
    /// Fails when the device cannot extend.
    fn alloc_page(&mut self) -> Result<u64>;

    /// Reads exactly one page at `address` into `buf`.
    /// `buf.len()` must equal `page_size`.
    fn read_page(&mut self, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Reads `buf.len()` bytes starting at `address`.
    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Persists `bytes` starting at `address`.
    fn write(&mut self, address: u64, bytes: &[u8]) -> Result<()>;

    fn page_size(&self) -> u32;

    fn config(&self) -> &DeviceConfig;

    /// Total bytes currently allocated.
    fn file_size(&self) -> u64;

    /// Durability barrier.
    fn flush(&mut self) -> Result<()>;
}

/// Type-erased device, so `Database` works with any backend without
/// generics.
#[derive(Debug)]
pub enum AnyDevice {
    File(FileDevice),
    Mem(MemDevice),
}

macro_rules! forward {
    ($self:ident, $m:ident $(, $arg:expr)*) => {
        match $self {
            AnyDevice::File(d) => d.$m($($arg),*),
            AnyDevice::Mem(d) => d.$m($($arg),*),
        }
    };
}

impl Device for AnyDevice {
    fn alloc_page(&mut self) -> Result<u64> {
        forward!(self, alloc_page)
    }

    fn read_page(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        forward!(self, read_page, address, buf)
    }

    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        forward!(self, read, address, buf)
    }

    fn write(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        forward!(self, write, address, bytes)
    }

    fn page_size(&self) -> u32 {
        forward!(self, page_size)
    }

    fn config(&self) -> &DeviceConfig {
        forward!(self, config)
    }

    fn file_size(&self) -> u64 {
        forward!(self, file_size)
    }

    fn flush(&mut self) -> Result<()> {
        forward!(self, flush)
    }
}
