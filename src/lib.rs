//! # martendb - Embedded B+Tree Key/Value Engine
//!
//! martendb is an embedded key/value database engine organized around a
//! disk-resident B+tree whose pages are mediated by a page cache. The
//! implementation prioritizes:
//!
//! - **Predictable layout**: fixed-size pages, fixed-stride key slots,
//!   little-endian on-disk integers
//! - **Cheap iteration**: cursors couple directly to in-memory pages and
//!   survive splits, merges, and cache evictions
//! - **Simple lifetimes**: blobs are owned by exactly one key and copied
//!   rather than reference-counted
//!
//! ## Quick Start
//!
//! ```ignore
//! use martendb::Database;
//!
//! let mut db = Database::builder()
//!     .path("./data.mdb")
//!     .enable_crc(true)
//!     .create()?;
//!
//! db.insert(b"hello", b"world", 0)?;
//!
//! let mut arena = martendb::ByteArena::new();
//! let len = db.find(b"hello", &mut arena)?;
//! assert_eq!(&arena.as_slice()[..len], b"world");
//!
//! db.erase(b"hello")?;
//! db.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Public API (Database, Cursor)      │
//! ├──────────────────────────────────────────┤
//! │   B+Tree Engine (find / insert / erase)   │
//! ├──────────────────────┬───────────────────┤
//! │  Node & Key Codecs   │  Extended-Key     │
//! │  (slot arrays)       │  Cache            │
//! ├──────────────────────┴───────────────────┤
//! │        Page Cache (SIEVE eviction)        │
//! ├──────────────────────┬───────────────────┤
//! │  Page Buffers (CRC,  │  Blob Store       │
//! │  shadow copies)      │  (records, keys)  │
//! ├──────────────────────┴───────────────────┤
//! │     Device (file-backed or in-memory)     │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Single-threaded cooperative. No operation suspends; a database handle
//! must not be shared across threads. Separate handles over separate
//! devices are independent.
//!
//! ## Module Overview
//!
//! - [`btree`]: tree mutation engine, node/key codecs, cursors
//! - [`page`]: page buffers, checksums, shadow copies
//! - [`cache`]: SIEVE page cache
//! - [`blob`]: out-of-line storage for large records and extended keys
//! - [`device`]: page-granular storage backends
//! - [`memory`]: caller-owned scratch arenas
//! - [`compress`]: pluggable compression capability

#[macro_use]
mod macros;

pub mod blob;
pub mod btree;
pub mod cache;
pub mod compress;
pub mod config;
pub mod device;
pub mod error;
pub mod extkeys;
pub mod memory;
pub mod page;

mod db;

pub use btree::{
    NodeSnapshot, CURSOR_FIRST, CURSOR_LAST, CURSOR_NEXT, CURSOR_ONLY_DUPLICATES, CURSOR_PREVIOUS,
    CURSOR_SKIP_DUPLICATES, DUPLICATE, FIND_EXACT_MATCH, FIND_GE_MATCH, FIND_GT_MATCH,
    FIND_LE_MATCH, FIND_LT_MATCH, OVERWRITE,
};
pub use btree::{Cursor, CursorState};
pub use compress::Compressor;
pub use config::{Comparator, Config};
pub use db::{Database, DatabaseBuilder};
pub use error::DbError;
pub use memory::ByteArena;
