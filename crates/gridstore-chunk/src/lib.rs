//! Chunk encodings for gridstore grids.
//!
//! A grid is split into rectangular chunks, each stored in whichever of three
//! encodings suits its contents:
//! - dense: one slot per cell
//! - sparse default-map: a default value plus per-value position sets or runs
//! - singlet: a single value for every cell
//!
//! [`ChunkFactory`] creates chunks and converts between encodings; chunk-level
//! statistics come from each encoding's [`ValueHistogram`].

#![forbid(unsafe_code)]

mod bitmap;
mod chunk;
mod dense;
mod factory;
mod histogram;
mod singlet;
mod sparse;

pub use crate::bitmap::BitVec;
pub use crate::chunk::{
    Chunk, ChunkCells, ChunkContext, ChunkEncoding, ChunkError, ChunkPayload, Result,
    FORMAT_VERSION,
};
pub use crate::dense::DenseChunk;
pub use crate::factory::ChunkFactory;
pub use crate::histogram::{standard_deviation, QuantileClass, QuantileClasses, ValueHistogram};
pub use crate::singlet::SingletChunk;
pub use crate::sparse::{SparseChunk, ValuePositions, DEFAULT_RUN_DENSITY_THRESHOLD};
