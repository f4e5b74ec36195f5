use serde::{Deserialize, Serialize};

use crate::{ChunkId, ShapeError};

/// Dimensions of a single chunk.
///
/// Chunks are uniform except along the bottom and right edges of a grid, where
/// they are clipped to the grid bounds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkShape {
    pub rows: usize,
    pub cols: usize,
}

impl ChunkShape {
    #[inline]
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Number of cells in the chunk.
    #[inline]
    pub const fn cells(&self) -> usize {
        self.rows * self.cols
    }

    #[inline]
    pub const fn contains(&self, row: usize, col: usize) -> bool {
        row < self.rows && col < self.cols
    }

    /// Row-major offset of `(row, col)`. Callers check bounds first.
    #[inline]
    pub const fn offset(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    #[inline]
    pub const fn position(&self, offset: usize) -> (usize, usize) {
        (offset / self.cols, offset % self.cols)
    }
}

/// A grid cell resolved to its chunk and in-chunk position.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CellLocation {
    pub chunk: ChunkId,
    pub row: usize,
    pub col: usize,
}

/// Total and per-chunk dimensions of a grid.
///
/// Every addressable cell maps to exactly one chunk id and one in-chunk offset.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridShape {
    rows: u64,
    cols: u64,
    chunk_rows: u32,
    chunk_cols: u32,
}

impl GridShape {
    pub fn new(rows: u64, cols: u64, chunk_rows: u32, chunk_cols: u32) -> Result<Self, ShapeError> {
        if chunk_rows == 0 || chunk_cols == 0 {
            return Err(ShapeError::EmptyChunk {
                rows: chunk_rows,
                cols: chunk_cols,
            });
        }
        let shape = Self {
            rows,
            cols,
            chunk_rows,
            chunk_cols,
        };
        if u32::try_from(shape.chunk_count_along(rows, chunk_rows)).is_err()
            || u32::try_from(shape.chunk_count_along(cols, chunk_cols)).is_err()
        {
            return Err(ShapeError::TooManyChunks { rows, cols });
        }
        Ok(shape)
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn cols(&self) -> u64 {
        self.cols
    }

    /// Nominal chunk dimensions (edge chunks may be smaller).
    pub fn chunk_dimensions(&self) -> (u32, u32) {
        (self.chunk_rows, self.chunk_cols)
    }

    pub fn cell_count(&self) -> u64 {
        self.rows.saturating_mul(self.cols)
    }

    fn chunk_count_along(&self, cells: u64, per_chunk: u32) -> u64 {
        cells.div_ceil(u64::from(per_chunk))
    }

    /// Number of chunk rows in the grid.
    pub fn chunk_row_count(&self) -> u32 {
        self.chunk_count_along(self.rows, self.chunk_rows) as u32
    }

    /// Number of chunk columns in the grid.
    pub fn chunk_col_count(&self) -> u32 {
        self.chunk_count_along(self.cols, self.chunk_cols) as u32
    }

    pub fn chunk_count(&self) -> u64 {
        u64::from(self.chunk_row_count()) * u64::from(self.chunk_col_count())
    }

    pub fn contains(&self, row: i64, col: i64) -> bool {
        row >= 0 && col >= 0 && (row as u64) < self.rows && (col as u64) < self.cols
    }

    pub fn contains_chunk(&self, id: ChunkId) -> bool {
        id.row < self.chunk_row_count() && id.col < self.chunk_col_count()
    }

    /// Resolve a grid cell to its chunk and in-chunk position.
    ///
    /// Returns `None` for coordinates outside the grid.
    pub fn locate(&self, row: i64, col: i64) -> Option<CellLocation> {
        if !self.contains(row, col) {
            return None;
        }
        let (row, col) = (row as u64, col as u64);
        let chunk_rows = u64::from(self.chunk_rows);
        let chunk_cols = u64::from(self.chunk_cols);
        Some(CellLocation {
            chunk: ChunkId::new((row / chunk_rows) as u32, (col / chunk_cols) as u32),
            row: (row % chunk_rows) as usize,
            col: (col % chunk_cols) as usize,
        })
    }

    /// Grid coordinates of the top-left cell of `id`.
    pub fn chunk_origin(&self, id: ChunkId) -> (u64, u64) {
        (
            u64::from(id.row) * u64::from(self.chunk_rows),
            u64::from(id.col) * u64::from(self.chunk_cols),
        )
    }

    /// Dimensions of `id`, clipped at the grid edges.
    pub fn chunk_shape(&self, id: ChunkId) -> Option<ChunkShape> {
        if !self.contains_chunk(id) {
            return None;
        }
        let (row0, col0) = self.chunk_origin(id);
        let rows = (self.rows - row0).min(u64::from(self.chunk_rows));
        let cols = (self.cols - col0).min(u64::from(self.chunk_cols));
        Some(ChunkShape::new(rows as usize, cols as usize))
    }

    /// Iterate every chunk id, ascending by `(chunk_row, chunk_col)`.
    pub fn chunk_ids(&self) -> impl Iterator<Item = ChunkId> {
        let chunk_rows = self.chunk_row_count();
        let chunk_cols = self.chunk_col_count();
        (0..chunk_rows).flat_map(move |row| (0..chunk_cols).map(move |col| ChunkId::new(row, col)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_chunks_are_clipped() {
        let shape = GridShape::new(5, 7, 2, 3).unwrap();
        assert_eq!(shape.chunk_row_count(), 3);
        assert_eq!(shape.chunk_col_count(), 3);
        assert_eq!(shape.chunk_shape(ChunkId::new(0, 0)), Some(ChunkShape::new(2, 3)));
        assert_eq!(shape.chunk_shape(ChunkId::new(2, 2)), Some(ChunkShape::new(1, 1)));
        assert_eq!(shape.chunk_shape(ChunkId::new(3, 0)), None);
    }

    #[test]
    fn locate_maps_every_cell_to_one_chunk() {
        let shape = GridShape::new(5, 7, 2, 3).unwrap();
        let mut seen = std::collections::HashSet::new();
        for row in 0..5 {
            for col in 0..7 {
                let loc = shape.locate(row, col).unwrap();
                let chunk = shape.chunk_shape(loc.chunk).unwrap();
                assert!(chunk.contains(loc.row, loc.col));
                assert!(seen.insert((loc.chunk, loc.row, loc.col)));
            }
        }
        assert_eq!(seen.len(), 35);
        assert_eq!(shape.locate(-1, 0), None);
        assert_eq!(shape.locate(0, 7), None);
    }

    #[test]
    fn zero_sized_chunks_are_rejected() {
        assert_eq!(
            GridShape::new(10, 10, 0, 4),
            Err(ShapeError::EmptyChunk { rows: 0, cols: 4 })
        );
    }

    #[test]
    fn chunk_ids_are_row_major() {
        let shape = GridShape::new(4, 4, 2, 2).unwrap();
        let ids: Vec<_> = shape.chunk_ids().collect();
        assert_eq!(
            ids,
            vec![
                ChunkId::new(0, 0),
                ChunkId::new(0, 1),
                ChunkId::new(1, 0),
                ChunkId::new(1, 1)
            ]
        );
    }
}
