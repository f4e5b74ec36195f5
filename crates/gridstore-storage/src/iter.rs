//! Two-level grid traversal: chunk ids in row-major order, then the cells of
//! each chunk in row-major order.

use gridstore_chunk::ChunkCells;
use gridstore_model::{ChunkId, GridShape, GridValue};

use crate::error::Result;
use crate::grid::Grid;

/// Chunk ids of a grid, ascending by `(chunk_row, chunk_col)`.
#[derive(Clone, Debug)]
pub struct ChunkIds {
    rows: u32,
    cols: u32,
    next: u64,
}

impl ChunkIds {
    pub(crate) fn new(shape: GridShape) -> Self {
        Self {
            rows: shape.chunk_row_count(),
            cols: shape.chunk_col_count(),
            next: 0,
        }
    }

    fn total(&self) -> u64 {
        u64::from(self.rows) * u64::from(self.cols)
    }
}

impl Iterator for ChunkIds {
    type Item = ChunkId;

    fn next(&mut self) -> Option<ChunkId> {
        if self.next >= self.total() {
            return None;
        }
        let cols = u64::from(self.cols);
        let id = ChunkId::new((self.next / cols) as u32, (self.next % cols) as u32);
        self.next += 1;
        Some(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.total() - self.next).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

/// A cell yielded by [`GridCells`], in grid coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct GridCell<V> {
    pub row: u64,
    pub col: u64,
    pub value: V,
}

/// Every cell of a grid, chunk by chunk.
///
/// Each chunk is copied out when the traversal reaches it, so writes made
/// during iteration show up only in chunks not yet visited. After an error the
/// iterator is exhausted.
pub struct GridCells<'g, V: GridValue> {
    grid: &'g Grid<V>,
    chunks: ChunkIds,
    current: Option<(ChunkId, ChunkCells<'static, V>)>,
    failed: bool,
}

impl<'g, V: GridValue> GridCells<'g, V> {
    pub(crate) fn new(grid: &'g Grid<V>) -> Self {
        Self {
            grid,
            chunks: grid.chunk_ids(),
            current: None,
            failed: false,
        }
    }
}

impl<V: GridValue> Iterator for GridCells<'_, V> {
    type Item = Result<GridCell<V>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some((id, cells)) = &mut self.current {
                if let Some((row, col, value)) = cells.next() {
                    let (origin_row, origin_col) = self.grid.shape().chunk_origin(*id);
                    return Some(Ok(GridCell {
                        row: origin_row + row as u64,
                        col: origin_col + col as u64,
                        value,
                    }));
                }
            }
            let id = self.chunks.next()?;
            match self.grid.chunk_cells(id) {
                Ok(cells) => self.current = Some((id, cells)),
                Err(err) => {
                    self.failed = true;
                    self.current = None;
                    return Some(Err(err));
                }
            }
        }
    }
}
