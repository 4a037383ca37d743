// Maps a requested byte interval onto the backend's fixed-size chunk grid.

use bytes::Bytes;

use crate::error::{GatewayError, GatewayResult};

/// Chunk-aligned fetch plan for one inclusive byte interval `[from, until]`.
///
/// Parts are numbered from 1. Part `i` is fetched at
/// `fetch_offset + (i - 1) * chunk_size` and trimmed by [`RangePlan::trim`]
/// so that the concatenation of all trimmed parts is exactly the interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangePlan {
    pub from: u64,
    pub until: u64,
    pub chunk_size: u64,
    /// `from` aligned down to a chunk boundary.
    pub fetch_offset: u64,
    /// Bytes to drop from the front of the first part.
    pub first_chunk_trim: u64,
    /// Bytes to keep from the front of the last part.
    pub last_chunk_trim: u64,
    pub chunk_count: u64,
}

impl RangePlan {
    /// Plan `[from, until]` of an object of `size` bytes.
    pub fn new(from: u64, until: u64, size: u64, chunk_size: u64) -> GatewayResult<Self> {
        if chunk_size == 0 {
            return Err(GatewayError::ChunkSize(chunk_size));
        }
        if from > until || until >= size {
            return Err(GatewayError::RangeNotSatisfiable { size });
        }

        let fetch_offset = from - from % chunk_size;
        let first_chunk_trim = from - fetch_offset;
        let last_chunk_trim = until % chunk_size + 1;
        let chunk_count = (until + chunk_size) / chunk_size - fetch_offset / chunk_size;

        Ok(Self {
            from,
            until,
            chunk_size,
            fetch_offset,
            first_chunk_trim,
            last_chunk_trim,
            chunk_count,
        })
    }

    /// Plan the whole object.
    pub fn full(size: u64, chunk_size: u64) -> GatewayResult<Self> {
        if size == 0 {
            return Err(GatewayError::RangeNotSatisfiable { size });
        }
        Self::new(0, size - 1, size, chunk_size)
    }

    /// Number of bytes the plan emits.
    pub fn content_length(&self) -> u64 {
        self.until - self.from + 1
    }

    /// Backend offset of part `part`.
    pub fn part_offset(&self, part: u64) -> u64 {
        self.fetch_offset + (part - 1) * self.chunk_size
    }

    /// Cut part `part` down to the bytes that belong to the interval.
    ///
    /// Returns `None` when the backend handed back a chunk too short for the
    /// plan, since emitting it would shift every following byte.
    pub fn trim(&self, part: u64, chunk: Bytes) -> Option<Bytes> {
        let len = chunk.len() as u64;
        let first = self.first_chunk_trim as usize;
        let last = self.last_chunk_trim as usize;

        if part < self.chunk_count && len != self.chunk_size {
            return None;
        }
        if part == self.chunk_count && len < self.last_chunk_trim {
            return None;
        }

        let slice = if self.chunk_count == 1 {
            chunk.slice(first..last)
        } else if part == 1 {
            chunk.slice(first..)
        } else if part == self.chunk_count {
            chunk.slice(..last)
        } else {
            chunk
        };
        Some(slice)
    }
}
