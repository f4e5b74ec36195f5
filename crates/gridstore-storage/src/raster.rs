use std::convert::Infallible;

use gridstore_model::{GridValue, RasterHeader};

use crate::error::{GridError, Result};
use crate::grid::{Grid, GridOptions};
use crate::memory::MemoryManager;
use crate::statistics::StatisticsMode;

/// A stream of raster cells: a header, then `rows * cols` values row-major
/// starting at the top row.
pub trait RasterSource<V> {
    type Error: std::error::Error + Send + Sync + 'static;

    fn header(&self) -> &RasterHeader<V>;

    /// The next cell, or `None` once the source is exhausted.
    fn next_value(&mut self) -> std::result::Result<Option<V>, Self::Error>;
}

/// Raster source over values already in memory.
#[derive(Clone, Debug)]
pub struct VecRasterSource<V> {
    header: RasterHeader<V>,
    values: std::vec::IntoIter<V>,
}

impl<V> VecRasterSource<V> {
    pub fn new(header: RasterHeader<V>, values: Vec<V>) -> Self {
        Self {
            header,
            values: values.into_iter(),
        }
    }
}

impl<V> RasterSource<V> for VecRasterSource<V> {
    type Error = Infallible;

    fn header(&self) -> &RasterHeader<V> {
        &self.header
    }

    fn next_value(&mut self) -> std::result::Result<Option<V>, Infallible> {
        Ok(self.values.next())
    }
}

impl<V: GridValue> Grid<V> {
    /// Build a grid from a raster source with default options.
    pub fn from_source<S: RasterSource<V>>(
        memory: MemoryManager,
        source: S,
        chunk_rows: u32,
        chunk_cols: u32,
    ) -> Result<Self> {
        let options = GridOptions::from_header(source.header())
            .with_chunk_dimensions(chunk_rows, chunk_cols);
        Self::from_source_with(memory, source, options)
    }

    /// Build a grid from a raster source. The shape, no-data and fill values
    /// come from the source header; everything else from `options`.
    ///
    /// Cells are loaded without statistics tracking. Eager statistics are
    /// rebuilt with one scan afterwards; lazy statistics start invalid.
    pub fn from_source_with<S: RasterSource<V>>(
        memory: MemoryManager,
        mut source: S,
        options: GridOptions<V>,
    ) -> Result<Self> {
        let header = source.header().clone();
        let options = GridOptions {
            rows: header.rows,
            cols: header.cols,
            fill: header.no_data.clone(),
            no_data: header.no_data.clone(),
            ..options
        };
        let mode = options.statistics;
        let grid = Self::create(memory, options)?;
        let expected = header.cell_count();
        let mut read = 0u64;
        for row in 0..header.rows {
            for col in 0..header.cols {
                let value = source
                    .next_value()
                    .map_err(|err| GridError::Source(Box::new(err)))?
                    .ok_or(GridError::TruncatedSource { expected, read })?;
                grid.init_cell(row as i64, col as i64, value)?;
                read += 1;
            }
        }
        log::debug!("loaded {read} cells into grid {}", grid.id());
        match mode {
            StatisticsMode::Eager => grid.rescan_statistics()?,
            StatisticsMode::Lazy => grid.invalidate_statistics(),
        }
        Ok(grid)
    }
}
