//! lz4 compression for durable-tier blobs.
//!
//! Compression applies only above a raw-size threshold, and only when it
//! actually shrinks the payload; small or incompressible blobs are stored
//! verbatim with the `compressed` flag unset.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use crate::cache::StoreError;

/// Compresses `data` if it exceeds `threshold` and compression saves space.
///
/// Returns the blob to persist and whether it is compressed. The decision
/// is made on raw size alone.
#[must_use]
pub fn maybe_compress(data: &[u8], threshold: usize) -> (Vec<u8>, bool) {
    if data.len() <= threshold {
        return (data.to_vec(), false);
    }

    let compressed = compress_prepend_size(data);
    if compressed.len() < data.len() {
        (compressed, true)
    } else {
        (data.to_vec(), false)
    }
}

/// Restores the raw payload from a durable-store blob.
///
/// # Errors
///
/// Returns `StoreError::Corrupt` when a blob flagged as compressed fails to
/// decompress.
pub fn decompress(blob: &[u8], compressed: bool) -> Result<Vec<u8>, StoreError> {
    if !compressed {
        return Ok(blob.to_vec());
    }
    decompress_size_prepended(blob)
        .map_err(|e| StoreError::Corrupt(format!("lz4 decompression failed: {e}")))
}
