use serde::{Deserialize, Serialize};

/// Header of an external raster (e.g. an ESRI ASCII grid).
///
/// Only `rows`, `cols` and `no_data` shape the grid; the geometry fields are
/// carried through untouched for callers that map cells to world coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RasterHeader<V> {
    pub rows: u64,
    pub cols: u64,
    pub cell_size: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    pub no_data: V,
}

impl<V> RasterHeader<V> {
    pub fn new(rows: u64, cols: u64, no_data: V) -> Self {
        Self {
            rows,
            cols,
            cell_size: 1.0,
            origin_x: 0.0,
            origin_y: 0.0,
            no_data,
        }
    }

    pub fn cell_count(&self) -> u64 {
        self.rows.saturating_mul(self.cols)
    }
}
