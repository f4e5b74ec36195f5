//! `gridstore-model` defines the value types shared by every gridstore crate.
//!
//! The crate is intentionally small and dependency-light so it can be reused by:
//! - the chunk encodings (`gridstore-chunk`)
//! - the grid, memory manager and statistics engine (`gridstore-storage`)
//! - raster importers that only need headers and value types

mod decimal;
mod error;
mod id;
mod raster;
mod shape;
mod value;

pub use decimal::{Decimal, DecimalParseError};
pub use error::{AllocationFailure, ShapeError, StatisticsError};
pub use id::{CellOffset, ChunkId};
pub use raster::RasterHeader;
pub use shape::{CellLocation, ChunkShape, GridShape};
pub use value::GridValue;

/// Exact rational type used for sums and means.
pub use num_rational::BigRational;
