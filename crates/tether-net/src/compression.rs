//! Whole-buffer LZ4 compression for bulk sync payloads.
//!
//! The uncompressed length is prepended to the stream, so decompression can
//! detect truncation instead of silently returning a short buffer. The prefix
//! comes off the wire, so it is bounded before anything is allocated.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use crate::message::DecodeError;

/// Largest uncompressed buffer [`decompress`] will produce (256 MiB).
pub const MAX_DECOMPRESSED_LEN: usize = 256 * 1024 * 1024;

/// LZ4 cannot expand a block by more than this factor.
const MAX_EXPANSION: usize = 255;

/// Compress `data` into a size-prefixed LZ4 block.
pub fn compress(data: &[u8]) -> Vec<u8> {
    compress_prepend_size(data)
}

/// Decompress a buffer produced by [`compress`].
///
/// Fails with [`DecodeError::CorruptStream`] on malformed or truncated input,
/// or when the size prefix exceeds [`MAX_DECOMPRESSED_LEN`] or what the
/// stream could possibly expand to.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if data.len() < 4 {
        return Err(DecodeError::CorruptStream(format!(
            "stream of {} bytes is shorter than the size prefix",
            data.len()
        )));
    }
    let declared = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let body = data.len() - 4;
    if declared > MAX_DECOMPRESSED_LEN || declared > body.saturating_mul(MAX_EXPANSION) + 16 {
        return Err(DecodeError::CorruptStream(format!(
            "size prefix of {declared} bytes is implausible for a {body}-byte stream"
        )));
    }
    decompress_size_prepended(data).map_err(|e| DecodeError::CorruptStream(e.to_string()))
}
