//! Out-of-core raster grids.
//!
//! A [`Grid`] partitions a 2D raster into chunks that are materialized on
//! first write and kept resident in an LRU map. Every resident byte is charged
//! to a shared [`MemoryManager`]; when a charge fails the grid asks the manager
//! to evict chunks to its [`CacheStore`] and retries, so a grid may be far
//! larger than its memory budget. A dropped grid leaves its chunks in the
//! store, and [`Grid::open`] reattaches to them by id.
//!
//! Grid statistics are tracked eagerly on every write or rebuilt lazily on
//! demand; see [`Statistics`].

#![forbid(unsafe_code)]

mod error;
mod grid;
mod iter;
mod memory;
mod raster;
mod schema;
mod statistics;
mod store;

pub use crate::error::{GridError, Result};
pub use crate::grid::{Grid, GridOptions};
pub use crate::iter::{ChunkIds, GridCell, GridCells};
pub use crate::memory::{
    MemoryManager, MemoryManagerConfig, MemoryManagerStats, PinGuard, Reservation,
};
pub use crate::raster::{RasterSource, VecRasterSource};
pub use crate::statistics::{Aggregate, Extreme, GridStatistics, Statistics, StatisticsMode};
pub use crate::store::{CacheStore, InMemoryCacheStore, SqliteCacheStore, StoreError};
