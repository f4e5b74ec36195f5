use gridstore_chunk::ChunkError;
use gridstore_model::{AllocationFailure, ChunkId, ShapeError, StatisticsError};
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum GridError {
    /// Recovery could not free enough memory for the operation.
    #[error(
        "out of memory: {requested} bytes still unavailable after {attempts} recovery attempts"
    )]
    OutOfMemory { requested: usize, attempts: usize },
    /// Raised inside an operation and handled by the recovery loop; never
    /// returned from a public grid operation.
    #[error(transparent)]
    Allocation(#[from] AllocationFailure),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("cache store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Statistics(#[from] StatisticsError),
    #[error("value {0} cannot be stored in a grid")]
    UnstorableValue(String),
    #[error("chunk {0} lies outside the grid")]
    ChunkOutOfRange(ChunkId),
    #[error("grid {0} is already open")]
    AlreadyOpen(Uuid),
    #[error("chunk {0} was evicted but is missing from the cache store")]
    MissingChunk(ChunkId),
    #[error("raster source error: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("raster source ended after {read} of {expected} cells")]
    TruncatedSource { expected: u64, read: u64 },
}

impl GridError {
    /// The recoverable allocation failure behind this error, if any.
    pub fn allocation_failure(&self) -> Option<AllocationFailure> {
        match self {
            GridError::Allocation(failure)
            | GridError::Chunk(ChunkError::Allocation(failure)) => Some(*failure),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GridError>;
