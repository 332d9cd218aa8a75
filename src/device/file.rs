//! File-backed device backend.
//!
//! Plain positioned I/O over a single file. The file grows in page-size
//! increments via `set_len`; reads and writes seek to the page address.
//! There is no OS-level caching trickery here: the page cache above the
//! device is the only caching tier, so dirty-state tracking and checksum
//! stamping stay in one place.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};

use crate::error::DbError;

use super::{Device, DeviceConfig};

#[derive(Debug)]
pub struct FileDevice {
    file: File,
    file_size: u64,
    config: DeviceConfig,
}

impl FileDevice {
    /// Creates a new database file, truncating any existing one.
    pub fn create(path: &Path, page_size: u32, flags: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(DbError::Io)
            .wrap_err_with(|| format!("creating database file {}", path.display()))?;
        Ok(Self {
            file,
            file_size: 0,
            config: DeviceConfig { page_size, flags },
        })
    }

    /// Opens an existing database file.
    pub fn open(path: &Path, page_size: u32, flags: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(DbError::Io)
            .wrap_err_with(|| format!("opening database file {}", path.display()))?;
        let file_size = file.metadata().map_err(DbError::Io)?.len();
        ensure!(
            file_size % page_size as u64 == 0,
            "file size {} is not a multiple of the page size {}",
            file_size,
            page_size
        );
        Ok(Self {
            file,
            file_size,
            config: DeviceConfig { page_size, flags },
        })
    }

    fn seek_to(&mut self, address: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(address))
            .map_err(DbError::Io)?;
        Ok(())
    }
}

impl Device for FileDevice {
    fn alloc_page(&mut self) -> Result<u64> {
        let address = self.file_size;
        let new_size = self.file_size + self.config.page_size as u64;
        self.file.set_len(new_size).map_err(DbError::Io)?;
        self.file_size = new_size;
        Ok(address)
    }

    fn read_page(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() == self.config.page_size as usize,
            "read_page buffer is {} bytes, page size is {}",
            buf.len(),
            self.config.page_size
        );
        self.read(address, buf)
    }

    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.seek_to(address)?;
        self.file.read_exact(buf).map_err(DbError::Io)?;
        Ok(())
    }

    fn write(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        self.seek_to(address)?;
        self.file.write_all(bytes).map_err(DbError::Io)?;
        Ok(())
    }

    fn page_size(&self) -> u32 {
        self.config.page_size
    }

    fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_all().map_err(DbError::Io)?;
        Ok(())
    }
}
