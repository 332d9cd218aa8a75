//! # Compression Capability
//!
//! The engine does not ship a compression algorithm; it consumes one. A
//! [`Compressor`] plugged into the database builder is applied by the blob
//! store to out-of-line payloads (records and extended-key overflow) that
//! shrink under it. The capability is deliberately thin: an implementation
//! provides a worst-case output bound, `compress`, and `decompress`, and
//! the engine handles framing (original size, compressed flag) itself.
//!
//! The blob store sizes the output arena with [`Compressor::compressed_length`]
//! before calling `compress`, so an implementation can write straight into
//! the provided buffer without growing it:
//!
//! ```ignore
//! arena.resize(compressor.compressed_length(payload.len()));
//! let clen = compressor.compress(payload, None, &mut arena)?;
//! ```
//!
//! `compress` accepts an optional second input that is treated as if it
//! were concatenated to the first, so callers can compress a header and a
//! body without gluing them into a scratch buffer first.

use eyre::Result;

use crate::memory::ByteArena;

pub trait Compressor {
    /// Worst-case compressed size for `input_len` input bytes. Callers
    /// resize the output arena to this bound before calling `compress`.
    fn compressed_length(&self, input_len: usize) -> usize;

    /// Compresses `inp1` (followed by `inp2`, when given) into `arena` and
    /// returns the number of compressed bytes written. The arena arrives
    /// sized to the `compressed_length` bound; implementations may grow it
    /// but must not assume it is zeroed.
    fn compress(&mut self, inp1: &[u8], inp2: Option<&[u8]>, arena: &mut ByteArena)
        -> Result<usize>;

    /// Decompresses `inp` into `arena`. `expected_len` is the exact size of
    /// the decompressed data; producing a different length is an error.
    fn decompress(&mut self, inp: &[u8], expected_len: usize, arena: &mut ByteArena) -> Result<()>;
}
