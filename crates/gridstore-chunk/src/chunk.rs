#![forbid(unsafe_code)]

use std::fmt;

use gridstore_model::{AllocationFailure, BigRational, ChunkId, ChunkShape, Decimal, GridValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::dense::DenseChunk;
use crate::histogram::ValueHistogram;
use crate::singlet::SingletChunk;
use crate::sparse::SparseChunk;

/// Leading byte of every serialized chunk blob.
pub const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("cell ({row}, {col}) is outside a {rows}x{cols} chunk")]
    OffsetOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },
    #[error("singlet chunk cannot hold a second distinct value")]
    SingletConflict,
    #[error("chunk contents are not uniform")]
    NotUniform,
    #[error(transparent)]
    Allocation(#[from] AllocationFailure),
    #[error("chunk codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("unsupported chunk format version {0}")]
    UnsupportedVersion(u8),
    #[error("chunk blob is empty")]
    EmptyPayload,
}

pub type Result<T> = std::result::Result<T, ChunkError>;

/// Grid-wide data a chunk needs but does not own.
#[derive(Debug)]
pub struct ChunkContext<'a, V> {
    pub no_data: &'a V,
}

impl<V> Clone for ChunkContext<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for ChunkContext<'_, V> {}

impl<'a, V> ChunkContext<'a, V> {
    pub fn new(no_data: &'a V) -> Self {
        Self { no_data }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkEncoding {
    DenseArray,
    SparseMap,
    #[default]
    Singlet,
}

impl fmt::Display for ChunkEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChunkEncoding::DenseArray => "dense",
            ChunkEncoding::SparseMap => "sparse",
            ChunkEncoding::Singlet => "singlet",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum ChunkPayload<V: GridValue> {
    Dense(DenseChunk<V>),
    SparseMap(SparseChunk<V>),
    Singlet(SingletChunk<V>),
}

impl<V: GridValue> ChunkPayload<V> {
    pub fn encoding(&self) -> ChunkEncoding {
        match self {
            ChunkPayload::Dense(_) => ChunkEncoding::DenseArray,
            ChunkPayload::SparseMap(_) => ChunkEncoding::SparseMap,
            ChunkPayload::Singlet(_) => ChunkEncoding::Singlet,
        }
    }
}

/// A rectangular block of a grid with one of three encodings.
///
/// The chunk names its grid by id only. A new chunk is dirty until it has been
/// written to a cache store; the flag is not serialized, so a chunk decoded
/// from a blob starts clean.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Chunk<V: GridValue> {
    grid_id: Uuid,
    id: ChunkId,
    shape: ChunkShape,
    #[serde(skip)]
    dirty: bool,
    payload: ChunkPayload<V>,
}

impl<V: GridValue> Chunk<V> {
    pub fn new(grid_id: Uuid, id: ChunkId, shape: ChunkShape, payload: ChunkPayload<V>) -> Self {
        Self {
            grid_id,
            id,
            shape,
            dirty: true,
            payload,
        }
    }

    pub fn grid_id(&self) -> Uuid {
        self.grid_id
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn shape(&self) -> ChunkShape {
        self.shape
    }

    pub fn encoding(&self) -> ChunkEncoding {
        self.payload.encoding()
    }

    pub fn payload(&self) -> &ChunkPayload<V> {
        &self.payload
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Chunks worth evicting first: swapping out a singlet frees almost nothing.
    pub fn is_worth_swapping(&self) -> bool {
        !matches!(self.payload, ChunkPayload::Singlet(_))
    }

    pub(crate) fn with_payload(&self, payload: ChunkPayload<V>) -> Self {
        Self {
            grid_id: self.grid_id,
            id: self.id,
            shape: self.shape,
            dirty: self.dirty,
            payload,
        }
    }

    fn offset(&self, row: usize, col: usize) -> Result<usize> {
        if !self.shape.contains(row, col) {
            return Err(ChunkError::OffsetOutOfBounds {
                row,
                col,
                rows: self.shape.rows,
                cols: self.shape.cols,
            });
        }
        Ok(self.shape.offset(row, col))
    }

    pub fn get(&self, ctx: ChunkContext<'_, V>, row: usize, col: usize) -> Result<V> {
        let offset = self.offset(row, col)?;
        Ok(match &self.payload {
            ChunkPayload::Dense(dense) => dense.get(offset).clone(),
            ChunkPayload::SparseMap(sparse) => sparse.get(offset, ctx.no_data),
            ChunkPayload::Singlet(singlet) => singlet.value().clone(),
        })
    }

    /// Write a cell and return its previous value.
    ///
    /// The chunk becomes dirty only if the value changed. A singlet rejects a
    /// differing value with [`ChunkError::SingletConflict`] and is left as is.
    pub fn set(&mut self, ctx: ChunkContext<'_, V>, row: usize, col: usize, value: V) -> Result<V> {
        match self.write(ctx, row, col, value.clone())? {
            Some(previous) => {
                self.dirty = true;
                Ok(previous)
            }
            None => Ok(value),
        }
    }

    /// Constructor-time write: no dirty tracking.
    pub fn init(
        &mut self,
        ctx: ChunkContext<'_, V>,
        row: usize,
        col: usize,
        value: V,
    ) -> Result<()> {
        self.write(ctx, row, col, value).map(|_| ())
    }

    /// Returns the previous value when the cell changed, `None` for a no-op.
    fn write(
        &mut self,
        ctx: ChunkContext<'_, V>,
        row: usize,
        col: usize,
        value: V,
    ) -> Result<Option<V>> {
        let offset = self.offset(row, col)?;
        match &mut self.payload {
            ChunkPayload::Dense(dense) => {
                if dense.get(offset).same_value(&value) {
                    return Ok(None);
                }
                Ok(Some(dense.set(offset, value)))
            }
            ChunkPayload::SparseMap(sparse) => {
                let previous = sparse.set(offset, value.clone(), ctx.no_data);
                Ok((!previous.same_value(&value)).then_some(previous))
            }
            ChunkPayload::Singlet(singlet) => {
                if singlet.accepts(&value) {
                    Ok(None)
                } else {
                    Err(ChunkError::SingletConflict)
                }
            }
        }
    }

    /// Value → cardinality summary of the chunk.
    pub fn histogram(&self, ctx: ChunkContext<'_, V>) -> ValueHistogram<V> {
        match &self.payload {
            ChunkPayload::Dense(dense) => dense.histogram(ctx.no_data),
            ChunkPayload::SparseMap(sparse) => sparse.histogram(ctx.no_data),
            ChunkPayload::Singlet(singlet) => singlet.histogram(self.shape.cells(), ctx.no_data),
        }
    }

    pub fn n(&self, ctx: ChunkContext<'_, V>) -> u64 {
        match &self.payload {
            ChunkPayload::Singlet(singlet) if singlet.value().same_value(ctx.no_data) => 0,
            ChunkPayload::Singlet(_) => self.shape.cells() as u64,
            _ => self.histogram(ctx).n(),
        }
    }

    pub fn sum(&self, ctx: ChunkContext<'_, V>) -> BigRational {
        self.histogram(ctx).sum()
    }

    pub fn min(&self, ctx: ChunkContext<'_, V>) -> Option<(V, u64)> {
        self.histogram(ctx).min()
    }

    pub fn max(&self, ctx: ChunkContext<'_, V>) -> Option<(V, u64)> {
        self.histogram(ctx).max()
    }

    pub fn mode(&self, ctx: ChunkContext<'_, V>) -> Option<V> {
        self.histogram(ctx).mode()
    }

    pub fn median(&self, ctx: ChunkContext<'_, V>) -> Option<BigRational> {
        self.histogram(ctx).median()
    }

    pub fn standard_deviation(&self, ctx: ChunkContext<'_, V>, precision: u32) -> Decimal {
        self.histogram(ctx).standard_deviation(precision)
    }

    /// Row-major cells of this chunk. A sparse chunk is materialized into a
    /// temporary dense buffer first.
    pub fn cells(&self, ctx: ChunkContext<'_, V>) -> Result<ChunkCells<'_, V>> {
        let source = match &self.payload {
            ChunkPayload::Dense(dense) => CellSource::Slice(dense.values()),
            ChunkPayload::SparseMap(sparse) => {
                CellSource::Owned(sparse.to_values(ctx.no_data)?.into_iter())
            }
            ChunkPayload::Singlet(singlet) => CellSource::Repeat(singlet.value().clone()),
        };
        Ok(ChunkCells::new(self.shape, source))
    }

    /// Like [`Chunk::cells`] but consumes the chunk, so the iterator owns its data.
    pub fn into_cells(self, ctx: ChunkContext<'_, V>) -> Result<ChunkCells<'static, V>> {
        let shape = self.shape;
        let source = match self.payload {
            ChunkPayload::Dense(dense) => CellSource::Owned(dense.into_values().into_iter()),
            ChunkPayload::SparseMap(sparse) => {
                CellSource::Owned(sparse.to_values(ctx.no_data)?.into_iter())
            }
            ChunkPayload::Singlet(singlet) => CellSource::Repeat(singlet.value().clone()),
        };
        Ok(ChunkCells::new(shape, source))
    }

    /// Approximate resident footprint of the payload.
    pub fn estimated_bytes(&self) -> usize {
        match &self.payload {
            ChunkPayload::Dense(dense) => dense.estimated_bytes(),
            ChunkPayload::SparseMap(sparse) => sparse.estimated_bytes(),
            ChunkPayload::Singlet(singlet) => singlet.estimated_bytes(),
        }
    }

    /// Worst-case growth of [`Chunk::estimated_bytes`] from one `set`.
    pub fn write_headroom_bytes(&self) -> usize {
        match &self.payload {
            ChunkPayload::SparseMap(sparse) => sparse.write_headroom_bytes(),
            ChunkPayload::Dense(_) | ChunkPayload::Singlet(_) => 0,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![FORMAT_VERSION];
        bincode::serialize_into(&mut out, self)?;
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (&version, body) = bytes.split_first().ok_or(ChunkError::EmptyPayload)?;
        if version != FORMAT_VERSION {
            return Err(ChunkError::UnsupportedVersion(version));
        }
        Ok(bincode::deserialize(body)?)
    }

    /// Check the encoding's internal bookkeeping against the chunk shape.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        match &self.payload {
            ChunkPayload::Dense(dense) if dense.values().len() != self.shape.cells() => Err(format!(
                "dense chunk {} holds {} values for {} cells",
                self.id,
                dense.values().len(),
                self.shape.cells()
            )),
            ChunkPayload::SparseMap(sparse) => sparse
                .check_invariants()
                .map_err(|err| format!("sparse chunk {}: {err}", self.id)),
            _ => Ok(()),
        }
    }
}

enum CellSource<'a, V> {
    Slice(&'a [V]),
    Repeat(V),
    Owned(std::vec::IntoIter<V>),
}

/// Row-major `(row, col, value)` traversal of one chunk.
pub struct ChunkCells<'a, V> {
    shape: ChunkShape,
    next: usize,
    source: CellSource<'a, V>,
}

impl<'a, V: Clone> ChunkCells<'a, V> {
    fn new(shape: ChunkShape, source: CellSource<'a, V>) -> Self {
        Self {
            shape,
            next: 0,
            source,
        }
    }
}

impl<V: Clone> ChunkCells<'static, V> {
    /// Every cell of `shape` holding `value`; used for chunks that were never
    /// materialized.
    pub fn repeat(shape: ChunkShape, value: V) -> Self {
        ChunkCells::new(shape, CellSource::Repeat(value))
    }
}

impl<V: Clone> Iterator for ChunkCells<'_, V> {
    type Item = (usize, usize, V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.shape.cells() {
            return None;
        }
        let value = match &mut self.source {
            CellSource::Slice(values) => values.get(self.next)?.clone(),
            CellSource::Repeat(value) => value.clone(),
            CellSource::Owned(values) => values.next()?,
        };
        let (row, col) = self.shape.position(self.next);
        self.next += 1;
        Some((row, col, value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.shape.cells().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl<V: Clone> ExactSizeIterator for ChunkCells<'_, V> {}
