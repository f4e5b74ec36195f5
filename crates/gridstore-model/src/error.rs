use thiserror::Error;

/// An allocation that could not be satisfied.
///
/// This is the recoverable signal that drives the memory manager's
/// evict-and-retry loop. It is raised either by an explicit budget check or by
/// a failed `try_reserve` on a chunk buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("allocation of {requested} bytes failed")]
pub struct AllocationFailure {
    pub requested: usize,
}

impl AllocationFailure {
    pub const fn new(requested: usize) -> Self {
        Self { requested }
    }
}

impl From<std::collections::TryReserveError> for AllocationFailure {
    fn from(_: std::collections::TryReserveError) -> Self {
        // The std error does not expose the layout size.
        Self { requested: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("chunk dimensions must be non-zero (got {rows}x{cols})")]
    EmptyChunk { rows: u32, cols: u32 },
    #[error("grid of {rows}x{cols} needs more than u32::MAX chunks along one axis")]
    TooManyChunks { rows: u64, cols: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatisticsError {
    /// Division by a zero population (e.g. the mean of a grid holding only no-data).
    #[error("statistic is undefined for an empty population")]
    EmptyPopulation,
    #[error("quantile classes requires at least one class")]
    NoClasses,
}
