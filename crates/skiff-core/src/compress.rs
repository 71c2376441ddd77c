//! LZ4 block compression with an uncompressed fallback.
//!
//! Blocks are stored compressed only when compression actually shrinks them,
//! so decompression must accept raw input: when the stored length equals the
//! original size, the bytes are returned verbatim.

use crate::error::{Result, SkiffError};

/// Upper bound for size-prepended decompression (manifest blobs).
/// Prevents a corrupted length prefix from consuming unbounded memory.
const MAX_PREPENDED_DECOMPRESS_SIZE: u64 = 256 * 1024 * 1024;

/// Compress `src` with the LZ4 block format.
///
/// Returns the input verbatim when compression does not shrink it, so the
/// stored form is always the smaller of the two representations.
pub fn compress(src: &[u8]) -> Vec<u8> {
    let compressed = lz4_flex::block::compress(src);
    if compressed.len() < src.len() {
        compressed
    } else {
        src.to_vec()
    }
}

/// Report the LZ4-compressed length of `src` without retaining the output.
///
/// Callers compare against `src.len()` to decide whether storing the raw
/// input is cheaper.
pub fn compressed_len(src: &[u8]) -> usize {
    lz4_flex::block::compress(src).len()
}

/// Decompress a block produced by [`compress`].
///
/// `original_size` is the exact uncompressed length. Inputs whose length
/// already equals `original_size` were stored raw and are returned verbatim.
pub fn decompress(src: &[u8], original_size: usize) -> Result<Vec<u8>> {
    if src.len() == original_size {
        return Ok(src.to_vec());
    }
    let out = lz4_flex::block::decompress(src, original_size)
        .map_err(|e| SkiffError::Decompression(format!("lz4: {e}")))?;
    if out.len() != original_size {
        return Err(SkiffError::Decompression(format!(
            "lz4: expected {original_size} bytes, got {}",
            out.len()
        )));
    }
    Ok(out)
}

/// Compress with a little-endian length prefix.
///
/// Used for manifest blobs, whose original size is not tracked anywhere
/// else. Data blocks use the raw block format instead because their
/// `original_size` is recorded alongside them.
pub fn compress_prepend_size(src: &[u8]) -> Vec<u8> {
    lz4_flex::block::compress_prepend_size(src)
}

/// Decompress a size-prepended blob produced by [`compress_prepend_size`].
pub fn decompress_size_prepended(src: &[u8]) -> Result<Vec<u8>> {
    if src.len() < 4 {
        return Err(SkiffError::Decompression("payload too short".into()));
    }
    let claimed = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as u64;
    if claimed > MAX_PREPENDED_DECOMPRESS_SIZE {
        return Err(SkiffError::Decompression(format!(
            "declared size {claimed} exceeds limit of {MAX_PREPENDED_DECOMPRESS_SIZE} bytes"
        )));
    }
    lz4_flex::block::decompress_size_prepended(src)
        .map_err(|e| SkiffError::Decompression(format!("lz4: {e}")))
}
