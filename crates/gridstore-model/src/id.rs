use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a chunk within its grid: `(chunk_row, chunk_col)`.
///
/// Ids are stable for the lifetime of a grid and key both the resident chunk
/// map and the cache store. They order row-major, which is the order used by
/// grid iteration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId {
    pub row: u32,
    pub col: u32,
}

impl ChunkId {
    #[inline]
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// Position of a cell inside a chunk, row-major.
pub type CellOffset = usize;
