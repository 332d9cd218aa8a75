//! In-memory device backend.
//!
//! A growable byte vector addressed exactly like a file. Used for in-memory
//! databases and for tests that need to count device writes or inject
//! corruption at known offsets.

use eyre::{ensure, Result};

use crate::error::DbError;

use super::{Device, DeviceConfig};

#[derive(Debug)]
pub struct MemDevice {
    data: Vec<u8>,
    config: DeviceConfig,
    write_count: u64,
}

impl MemDevice {
    pub fn new(page_size: u32, flags: u32) -> Self {
        Self {
            data: Vec::new(),
            config: DeviceConfig { page_size, flags },
            write_count: 0,
        }
    }

    /// Number of `write` calls served so far. Lets tests assert that a
    /// re-flush of a clean page is a no-op.
    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    /// Direct view of the backing bytes, for corruption-injection tests.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn check_range(&self, address: u64, len: usize) -> Result<()> {
        let end = address as usize + len;
        if end > self.data.len() {
            return Err(DbError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "read/write of {} bytes at {} past device end {}",
                    len,
                    address,
                    self.data.len()
                ),
            ))
            .into());
        }
        Ok(())
    }
}

impl Device for MemDevice {
    fn alloc_page(&mut self) -> Result<u64> {
        let address = self.data.len() as u64;
        let new_len = self.data.len() + self.config.page_size as usize;
        self.data
            .try_reserve(self.config.page_size as usize)
            .map_err(|_| DbError::OutOfMemory)?;
        self.data.resize(new_len, 0);
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
        self.check_range(address, buf.len())?;
        let start = address as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        self.check_range(address, bytes.len())?;
        let start = address as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.write_count += 1;
        Ok(())
    }

    fn page_size(&self) -> u32 {
        self.config.page_size
    }

    fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn file_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
