//! # Memory Utilities
//!
//! Caller-owned scratch buffers. The engine itself never retains scratch
//! memory across operations; callers pass a [`ByteArena`] into the APIs that
//! materialize keys or records and reuse it between calls to avoid
//! per-operation allocation.

mod arena;

pub use arena::ByteArena;
