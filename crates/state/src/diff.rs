//! Chunked byte diffing
//!
//! Produces a [`DiffSpec`] describing which byte ranges changed between two
//! state buffers. The comparison walks fixed-size chunks and compares each
//! with a single slice equality, which the compiler lowers to wide loads on
//! every target we care about. Diff output feeds the observer channel only;
//! commit correctness never depends on it.

use serde::{Deserialize, Serialize};

/// Default chunk width for the equality pass.
pub const DEFAULT_CHUNK_SIZE: usize = 64;

/// One contiguous changed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRange {
    /// Byte offset of the range
    pub offset: usize,
    /// Range length in bytes
    pub len: usize,
}

/// Result of diffing two state buffers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSpec {
    /// Chunk width used
    pub chunk_size: usize,
    /// Length of the longer input
    pub total_len: usize,
    /// Changed ranges, ascending and non-overlapping
    pub ranges: Vec<DiffRange>,
    /// Total bytes covered by changed ranges
    pub bytes_changed: usize,
}

impl DiffSpec {
    /// True when the inputs were byte-identical.
    pub fn is_identical(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Changed fraction of the longer input (0.0 for two empty buffers).
    pub fn changed_ratio(&self) -> f64 {
        if self.total_len == 0 {
            0.0
        } else {
            self.bytes_changed as f64 / self.total_len as f64
        }
    }
}

/// Diff two buffers with the given chunk width.
///
/// Adjacent changed chunks coalesce into one range. A length difference
/// makes the trailing region of the longer buffer a changed range.
pub fn compute_diff(before: &[u8], after: &[u8], chunk_size: usize) -> DiffSpec {
    let chunk_size = chunk_size.max(1);
    let common = before.len().min(after.len());
    let total_len = before.len().max(after.len());

    let mut ranges: Vec<DiffRange> = Vec::new();
    let mut offset = 0;
    while offset < common {
        let end = (offset + chunk_size).min(common);
        if before[offset..end] != after[offset..end] {
            match ranges.last_mut() {
                Some(last) if last.offset + last.len == offset => last.len += end - offset,
                _ => ranges.push(DiffRange {
                    offset,
                    len: end - offset,
                }),
            }
        }
        offset = end;
    }

    if before.len() != after.len() {
        match ranges.last_mut() {
            Some(last) if last.offset + last.len == common => last.len += total_len - common,
            _ => ranges.push(DiffRange {
                offset: common,
                len: total_len - common,
            }),
        }
    }

    let bytes_changed = ranges.iter().map(|r| r.len).sum();
    DiffSpec {
        chunk_size,
        total_len,
        ranges,
        bytes_changed,
    }
}
