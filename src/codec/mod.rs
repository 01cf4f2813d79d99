//! Lossless byte codec for stored payloads
//!
//! Payloads are compressed with zstd before they enter the cache, the
//! partition slots or the version ledger. The compressed stream carries no
//! dtype or shape: those travel in the artifact record and snapshot metadata
//! and must be supplied again on every read.

pub mod dtype;

pub use dtype::{DType, Resolved};

use crate::error::{Error, Result};
use bytes::Bytes;

/// Compression level used by [`compress`].
pub const DEFAULT_LEVEL: i32 = 3;

/// Compress a byte buffer at the default level.
pub fn compress(data: &[u8]) -> Result<Bytes> {
    compress_with_level(data, DEFAULT_LEVEL)
}

/// Compress a byte buffer at an explicit zstd level.
pub fn compress_with_level(data: &[u8], level: i32) -> Result<Bytes> {
    zstd::encode_all(data, level)
        .map(Bytes::from)
        .map_err(|e| Error::Codec(format!("compression failed: {}", e)))
}

/// Decompress a buffer produced by [`compress`].
pub fn decompress(data: &[u8]) -> Result<Bytes> {
    zstd::decode_all(data)
        .map(Bytes::from)
        .map_err(|e| Error::Codec(format!("malformed compressed payload: {}", e)))
}
