//! Range planner - splits a file into non-overlapping byte ranges
//!
//! Given a total size and a chunk count, computes an ordered partition of
//! `[0, total_size)` with near-equal chunk sizes. The remainder of the
//! integer division goes to the final chunk.

use crate::error::FetchError;
use datafetch_types::ChunkSpec;

/// Compute the chunk plan for a transfer.
///
/// Every chunk satisfies `end >= start`, ranges are ordered and disjoint,
/// and their lengths sum exactly to `total_size`.
pub fn plan(total_size: u64, num_chunks: u32) -> Result<Vec<ChunkSpec>, FetchError> {
    if total_size == 0 {
        return Err(FetchError::InvalidPlan("total size must be positive".into()));
    }
    if num_chunks == 0 {
        return Err(FetchError::InvalidPlan("chunk count must be positive".into()));
    }
    if num_chunks as u64 > total_size {
        return Err(FetchError::InvalidPlan(format!(
            "cannot split {} bytes into {} chunks (zero-length chunk)",
            total_size, num_chunks
        )));
    }

    let chunk_size = total_size / num_chunks as u64;
    let mut chunks = Vec::with_capacity(num_chunks as usize);

    for i in 0..num_chunks {
        let start = i as u64 * chunk_size;
        // Last chunk absorbs the remainder
        let end = if i == num_chunks - 1 {
            total_size - 1
        } else {
            start + chunk_size - 1
        };
        chunks.push(ChunkSpec::new(i, start, end));
    }

    Ok(chunks)
}
