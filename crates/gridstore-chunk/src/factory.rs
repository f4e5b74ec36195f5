#![forbid(unsafe_code)]

use gridstore_model::{ChunkId, ChunkShape, GridValue};
use uuid::Uuid;

use crate::chunk::{Chunk, ChunkContext, ChunkEncoding, ChunkError, ChunkPayload, Result};
use crate::dense::DenseChunk;
use crate::histogram::ValueHistogram;
use crate::singlet::SingletChunk;
use crate::sparse::{SparseChunk, DEFAULT_RUN_DENSITY_THRESHOLD};

/// Builds chunks for a grid and converts them between encodings.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkFactory {
    /// Encoding of freshly materialized chunks.
    pub encoding: ChunkEncoding,
    /// Encoding a singlet converts to when it receives a second value.
    pub conversion_target: ChunkEncoding,
    /// Occupancy share at which the sparse encoding stores new values as runs.
    pub run_density_threshold: f32,
}

impl Default for ChunkFactory {
    fn default() -> Self {
        Self {
            encoding: ChunkEncoding::Singlet,
            conversion_target: ChunkEncoding::SparseMap,
            run_density_threshold: DEFAULT_RUN_DENSITY_THRESHOLD,
        }
    }
}

impl ChunkFactory {
    pub fn new(encoding: ChunkEncoding, conversion_target: ChunkEncoding) -> Self {
        // A singlet cannot absorb the write that triggered the conversion.
        let conversion_target = match conversion_target {
            ChunkEncoding::Singlet => ChunkEncoding::SparseMap,
            other => other,
        };
        Self {
            encoding,
            conversion_target,
            ..Self::default()
        }
    }

    pub fn with_run_density_threshold(mut self, threshold: f32) -> Self {
        self.run_density_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// A chunk of the configured encoding with every cell at `fill`.
    pub fn create<V: GridValue>(
        &self,
        grid_id: Uuid,
        id: ChunkId,
        shape: ChunkShape,
        fill: &V,
    ) -> Result<Chunk<V>> {
        self.create_encoded(self.encoding, grid_id, id, shape, fill)
    }

    pub fn create_encoded<V: GridValue>(
        &self,
        encoding: ChunkEncoding,
        grid_id: Uuid,
        id: ChunkId,
        shape: ChunkShape,
        fill: &V,
    ) -> Result<Chunk<V>> {
        let payload = match encoding {
            ChunkEncoding::DenseArray => {
                ChunkPayload::Dense(DenseChunk::filled(shape.cells(), fill)?)
            }
            ChunkEncoding::SparseMap => ChunkPayload::SparseMap(SparseChunk::new(
                shape,
                fill.clone(),
                self.run_density_threshold,
            )),
            ChunkEncoding::Singlet => ChunkPayload::Singlet(SingletChunk::new(fill.clone())),
        };
        Ok(Chunk::new(grid_id, id, shape, payload))
    }

    /// Re-encode `chunk` as `target`, migrating every cell.
    ///
    /// The source chunk is untouched, so a failed conversion can be retried.
    /// The result keeps the source's dirty flag.
    pub fn convert<V: GridValue>(
        &self,
        chunk: &Chunk<V>,
        target: ChunkEncoding,
        ctx: ChunkContext<'_, V>,
    ) -> Result<Chunk<V>> {
        let shape = chunk.shape();
        let payload = match (chunk.payload(), target) {
            (payload, target) if payload.encoding() == target => payload.clone(),
            (ChunkPayload::Singlet(singlet), ChunkEncoding::DenseArray) => {
                ChunkPayload::Dense(DenseChunk::filled(shape.cells(), singlet.value())?)
            }
            (ChunkPayload::Singlet(singlet), ChunkEncoding::SparseMap) => {
                ChunkPayload::SparseMap(SparseChunk::new(
                    shape,
                    singlet.value().clone(),
                    self.run_density_threshold,
                ))
            }
            (ChunkPayload::Dense(dense), ChunkEncoding::SparseMap) => {
                ChunkPayload::SparseMap(SparseChunk::from_values(
                    shape,
                    dense.values().iter(),
                    ctx.no_data,
                    self.run_density_threshold,
                ))
            }
            (ChunkPayload::SparseMap(sparse), ChunkEncoding::DenseArray) => {
                ChunkPayload::Dense(DenseChunk::from_values(sparse.to_values(ctx.no_data)?))
            }
            (_, ChunkEncoding::Singlet) => {
                let value = uniform_value(&chunk.histogram(ctx), ctx.no_data)
                    .ok_or(ChunkError::NotUniform)?;
                ChunkPayload::Singlet(SingletChunk::new(value))
            }
            (payload, _) => payload.clone(),
        };
        log::debug!(
            "converted chunk {} from {} to {}",
            chunk.id(),
            chunk.encoding(),
            payload.encoding()
        );
        Ok(chunk.with_payload(payload))
    }

    /// Bytes a chunk of `shape` and contents `histogram` would occupy as `encoding`.
    pub fn estimate_bytes<V: GridValue>(
        &self,
        encoding: ChunkEncoding,
        shape: ChunkShape,
        histogram: &ValueHistogram<V>,
    ) -> usize {
        match encoding {
            ChunkEncoding::DenseArray => {
                let heap = if V::HAS_HEAP {
                    histogram
                        .iter()
                        .map(|(value, count)| value.heap_bytes() * count as usize)
                        .sum()
                } else {
                    0
                };
                shape.cells() * std::mem::size_of::<V>() + heap
            }
            ChunkEncoding::SparseMap => SparseChunk::estimate_bytes(shape, histogram),
            ChunkEncoding::Singlet => std::mem::size_of::<V>(),
        }
    }

    /// Bytes `chunk` would occupy as a dense array.
    ///
    /// Values without heap storage cost a fixed size per cell, so no histogram
    /// is built for them.
    pub fn dense_bytes<V: GridValue>(&self, chunk: &Chunk<V>, ctx: ChunkContext<'_, V>) -> usize {
        if V::HAS_HEAP {
            self.estimate_bytes(ChunkEncoding::DenseArray, chunk.shape(), &chunk.histogram(ctx))
        } else {
            chunk.shape().cells() * std::mem::size_of::<V>()
        }
    }

    /// Bytes to reserve before converting `chunk` to `target`.
    pub fn conversion_estimate<V: GridValue>(
        &self,
        chunk: &Chunk<V>,
        target: ChunkEncoding,
        ctx: ChunkContext<'_, V>,
    ) -> usize {
        match (chunk.payload(), target) {
            (payload, target) if payload.encoding() == target => 0,
            (ChunkPayload::Singlet(singlet), ChunkEncoding::DenseArray) => {
                chunk.shape().cells() * (std::mem::size_of::<V>() + singlet.value().heap_bytes())
            }
            (ChunkPayload::Singlet(_), ChunkEncoding::SparseMap) => {
                SparseChunk::<V>::estimate_bytes(chunk.shape(), &ValueHistogram::new())
            }
            _ => self.estimate_bytes(target, chunk.shape(), &chunk.histogram(ctx)),
        }
    }

    /// Smallest encoding for the chunk's current contents.
    pub fn optimal_encoding<V: GridValue>(
        &self,
        chunk: &Chunk<V>,
        ctx: ChunkContext<'_, V>,
    ) -> ChunkEncoding {
        let histogram = chunk.histogram(ctx);
        if uniform_value(&histogram, ctx.no_data).is_some() {
            return ChunkEncoding::Singlet;
        }
        let dense = self.estimate_bytes(ChunkEncoding::DenseArray, chunk.shape(), &histogram);
        let sparse = self.estimate_bytes(ChunkEncoding::SparseMap, chunk.shape(), &histogram);
        if sparse < dense {
            ChunkEncoding::SparseMap
        } else {
            ChunkEncoding::DenseArray
        }
    }

    /// Re-encode `chunk` to its optimal encoding, or `None` if it already has it.
    pub fn optimise<V: GridValue>(
        &self,
        chunk: &Chunk<V>,
        ctx: ChunkContext<'_, V>,
    ) -> Result<Option<Chunk<V>>> {
        let target = self.optimal_encoding(chunk, ctx);
        if target == chunk.encoding() {
            return Ok(None);
        }
        self.convert(chunk, target, ctx).map(Some)
    }
}

/// The single value every cell holds, if there is one.
fn uniform_value<V: GridValue>(histogram: &ValueHistogram<V>, no_data: &V) -> Option<V> {
    match (histogram.distinct(), histogram.no_data_count()) {
        (0, n) if n > 0 => Some(no_data.clone()),
        (1, 0) => histogram.iter().next().map(|(value, _)| value),
        _ => None,
    }
}
