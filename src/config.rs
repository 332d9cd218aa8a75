//! # Configuration
//!
//! Central place for layout constants, database flags, and the open-time
//! configuration that the [`crate::DatabaseBuilder`] assembles. Several
//! values are interdependent (a page must hold the common page header, the
//! node header, and at least a handful of key slots), so the checks live
//! next to the constants instead of being scattered across modules.
//!
//! ## Derived Geometry
//!
//! ```text
//! max_keys = (page_size - PAGE_HEADER_SIZE - NODE_HEADER_SIZE)
//!          / (SLOT_OVERHEAD + key_size)
//! min_keys = max_keys / 2
//! ```
//!
//! `min_keys` is the rebalance threshold: a non-root node with
//! `count <= min_keys` is considered under-full during erase.

use std::cmp::Ordering;
use std::path::PathBuf;

use eyre::{ensure, Result};

use crate::btree::{max_keys, MIN_USABLE_KEYS};

/// Default page size, 16KB.
pub const DEFAULT_PAGE_SIZE: u32 = 16 * 1024;

/// Default inline key capacity per slot.
pub const DEFAULT_KEY_SIZE: u16 = 32;

/// Default page cache capacity, in pages.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Smallest supported page size. Small pages are useful in tests to force
/// splits and merges with a handful of keys.
pub const MIN_PAGE_SIZE: u32 = 128;

/// Smallest supported inline key size. Extended keys store an 8-byte blob id
/// in the tail of the inline area, so the inline area must comfortably exceed
/// that.
pub const MIN_KEY_SIZE: u16 = 16;

/// Database/device flag: stamp and verify page checksums.
pub const ENABLE_CRC32: u32 = 0x0001;

/// Comparison callback for user-supplied key ordering. Both sides receive
/// the full logical key bytes; extended keys are materialized before the
/// callback runs.
pub type CompareFn = fn(&[u8], &[u8]) -> Ordering;

/// Key ordering used by the whole tree.
///
/// The database holds exactly one of these. Pluggable comparator frameworks
/// are out of scope; a single callback covers custom orderings.
#[derive(Clone, Copy)]
pub enum Comparator {
    /// Plain bytewise comparison.
    Lexicographic,
    /// User-supplied callback.
    Callback(CompareFn),
}

impl Comparator {
    #[inline]
    pub fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        match self {
            Comparator::Lexicographic => lhs.cmp(rhs),
            Comparator::Callback(f) => f(lhs, rhs),
        }
    }
}

impl std::fmt::Debug for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Comparator::Lexicographic => f.write_str("Comparator::Lexicographic"),
            Comparator::Callback(_) => f.write_str("Comparator::Callback(..)"),
        }
    }
}

/// Validated open-time configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub page_size: u32,
    pub key_size: u16,
    pub cache_capacity: usize,
    pub enable_crc: bool,
    /// `None` selects the in-memory device.
    pub path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            key_size: DEFAULT_KEY_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            enable_crc: false,
            path: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.page_size >= MIN_PAGE_SIZE,
            "page size {} below minimum {}",
            self.page_size,
            MIN_PAGE_SIZE
        );
        ensure!(
            self.key_size >= MIN_KEY_SIZE,
            "key size {} below minimum {}",
            self.key_size,
            MIN_KEY_SIZE
        );
        ensure!(self.cache_capacity >= 1, "cache capacity must be at least 1");

        let max = max_keys(self.page_size, self.key_size);
        ensure!(
            max >= MIN_USABLE_KEYS,
            "page size {} holds only {} keys of inline size {}; need at least {}",
            self.page_size,
            max,
            self.key_size,
            MIN_USABLE_KEYS
        );
        Ok(())
    }

    /// Flag word advertised through the device capability query.
    pub fn device_flags(&self) -> u32 {
        if self.enable_crc {
            ENABLE_CRC32
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn tiny_page_rejected() {
        let cfg = Config {
            page_size: 64,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn page_must_hold_minimum_key_count() {
        // 128-byte pages with 64-byte inline keys leave room for a single
        // slot, which is not a usable tree.
        let cfg = Config {
            page_size: 128,
            key_size: 64,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn comparator_callback_dispatch() {
        fn reverse(a: &[u8], b: &[u8]) -> Ordering {
            b.cmp(a)
        }
        let cmp = Comparator::Callback(reverse);
        assert_eq!(cmp.compare(b"a", b"b"), Ordering::Greater);
        assert_eq!(
            Comparator::Lexicographic.compare(b"a", b"b"),
            Ordering::Less
        );
    }
}
