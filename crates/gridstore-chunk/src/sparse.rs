#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use gridstore_model::{AllocationFailure, ChunkShape, GridValue};
use serde::{Deserialize, Serialize};

use crate::bitmap::BitVec;
use crate::histogram::ValueHistogram;

const SPARSE_BASE_OVERHEAD_BYTES: usize = 96;
const BUCKET_OVERHEAD_BYTES: usize = 48;
const SCATTERED_ENTRY_OVERHEAD_BYTES: usize = 16;

/// Default share of recorded cells at which newly seen values are stored as runs.
pub const DEFAULT_RUN_DENSITY_THRESHOLD: f32 = 0.25;

/// Where one value lives inside a sparse chunk.
///
/// The representation is picked once, when the value is first recorded, and
/// later positions merge into it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValuePositions {
    /// Offset bit-vector: bit `i` marks offset `start + i`.
    Run { start: usize, bits: BitVec },
    /// Explicit `(row, col)` identifiers.
    Scattered(BTreeSet<(u32, u32)>),
}

impl ValuePositions {
    fn run(offset: usize) -> Self {
        let mut bits = BitVec::new();
        bits.set(0, true);
        Self::Run { start: offset, bits }
    }

    fn scattered(offset: usize, cols: usize) -> Self {
        let mut set = BTreeSet::new();
        set.insert(cell_id(offset, cols));
        Self::Scattered(set)
    }

    pub fn is_run(&self) -> bool {
        matches!(self, Self::Run { .. })
    }

    /// Number of cells holding the value.
    pub fn len(&self) -> usize {
        match self {
            Self::Run { bits, .. } => bits.count_ones(),
            Self::Scattered(set) => set.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, offset: usize, cols: usize) -> bool {
        match self {
            Self::Run { start, bits } => offset >= *start && bits.get(offset - start),
            Self::Scattered(set) => set.contains(&cell_id(offset, cols)),
        }
    }

    fn insert(&mut self, offset: usize, cols: usize) -> bool {
        match self {
            Self::Run { start, bits } => {
                if offset < *start {
                    *bits = bits.shifted_up(*start - offset);
                    *start = offset;
                }
                !bits.set(offset - *start, true)
            }
            Self::Scattered(set) => set.insert(cell_id(offset, cols)),
        }
    }

    fn remove(&mut self, offset: usize, cols: usize) -> bool {
        match self {
            Self::Run { start, bits } => offset >= *start && bits.set(offset - *start, false),
            Self::Scattered(set) => set.remove(&cell_id(offset, cols)),
        }
    }

    /// Offsets holding the value, ascending.
    pub fn offsets(&self, cols: usize) -> Box<dyn Iterator<Item = usize> + '_> {
        match self {
            Self::Run { start, bits } => Box::new(bits.iter_ones().map(move |i| start + i)),
            Self::Scattered(set) => Box::new(
                set.iter()
                    .map(move |&(row, col)| row as usize * cols + col as usize),
            ),
        }
    }

    fn heap_bytes(&self) -> usize {
        match self {
            Self::Run { bits, .. } => bits.heap_bytes(),
            Self::Scattered(set) => {
                set.len() * (std::mem::size_of::<(u32, u32)>() + SCATTERED_ENTRY_OVERHEAD_BYTES)
            }
        }
    }
}

#[inline]
fn cell_id(offset: usize, cols: usize) -> (u32, u32) {
    ((offset / cols) as u32, (offset % cols) as u32)
}

/// A default value for every unrecorded cell, a no-data mask, and one
/// [`ValuePositions`] bucket per other observed value.
///
/// Cardinality-based statistics read bucket sizes directly instead of
/// visiting cells. A bucket whose cardinality drops to zero is removed, so
/// every key present in `buckets` is held by at least one cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SparseChunk<V: GridValue> {
    shape: ChunkShape,
    default: V,
    no_data: BitVec,
    buckets: BTreeMap<V::Key, ValuePositions>,
    recorded: usize,
    run_density_threshold: f32,
}

impl<V: GridValue> SparseChunk<V> {
    pub fn new(shape: ChunkShape, default: V, run_density_threshold: f32) -> Self {
        Self {
            shape,
            default,
            no_data: BitVec::new(),
            buckets: BTreeMap::new(),
            recorded: 0,
            run_density_threshold,
        }
    }

    /// Encode row-major `values`, using the most frequent value (no-data
    /// included) as the default.
    pub fn from_values<'a, I>(
        shape: ChunkShape,
        values: I,
        no_data: &V,
        run_density_threshold: f32,
    ) -> Self
    where
        I: IntoIterator<Item = &'a V> + Clone,
    {
        let mut histogram = ValueHistogram::new();
        for value in values.clone() {
            histogram.add(value, 1, no_data);
        }
        // Most frequent value; ties go to the smallest key.
        let most_frequent = histogram
            .iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.to_key().cmp(&a.0.to_key())));
        let default = match most_frequent {
            Some((value, count)) if count >= histogram.no_data_count() => value,
            _ => no_data.clone(),
        };
        let mut chunk = Self::new(shape, default, run_density_threshold);
        for (offset, value) in values.into_iter().enumerate() {
            chunk.set(offset, value.clone(), no_data);
        }
        chunk
    }

    /// Footprint a sparse encoding of `histogram` over `shape` would have,
    /// costing every recorded cell as a scattered entry.
    pub fn estimate_bytes(shape: ChunkShape, histogram: &ValueHistogram<V>) -> usize {
        let most_frequent = histogram.iter().map(|(_, count)| count).max().unwrap_or(0);
        let no_data_cells = histogram.no_data_count();
        let (recorded, buckets, mask_bytes) = if no_data_cells >= most_frequent {
            (histogram.n(), histogram.distinct(), 0)
        } else {
            let mask_bytes = if no_data_cells > 0 {
                shape.cells().div_ceil(64) * std::mem::size_of::<u64>()
            } else {
                0
            };
            (histogram.n() - most_frequent, histogram.distinct() - 1, mask_bytes)
        };
        SPARSE_BASE_OVERHEAD_BYTES
            + std::mem::size_of::<V>()
            + buckets * (BUCKET_OVERHEAD_BYTES + std::mem::size_of::<V::Key>())
            + recorded as usize
                * (std::mem::size_of::<(u32, u32)>() + SCATTERED_ENTRY_OVERHEAD_BYTES)
            + mask_bytes
    }

    pub fn default_value(&self) -> &V {
        &self.default
    }

    /// Cells held in value buckets (neither default nor no-data).
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn positions(&self, value: &V) -> Option<&ValuePositions> {
        self.buckets.get(&value.to_key())
    }

    pub fn no_data_mask(&self) -> &BitVec {
        &self.no_data
    }

    pub fn get(&self, offset: usize, no_data: &V) -> V {
        if self.no_data.get(offset) {
            return no_data.clone();
        }
        let cols = self.shape.cols;
        self.buckets
            .iter()
            .find(|(_, positions)| positions.contains(offset, cols))
            .map(|(key, _)| V::from_key(key))
            .unwrap_or_else(|| self.default.clone())
    }

    /// Write `value` at `offset`, returning the previous value.
    pub fn set(&mut self, offset: usize, value: V, no_data: &V) -> V {
        let previous = self.get(offset, no_data);
        if previous.same_value(&value) {
            return previous;
        }

        if self.no_data.get(offset) {
            self.no_data.set(offset, false);
        } else if !previous.same_value(&self.default) {
            self.remove_from_bucket(&previous.to_key(), offset);
        }

        if value.same_value(&self.default) {
            // Implicit.
        } else if value.same_value(no_data) {
            self.no_data.set(offset, true);
        } else {
            self.insert_into_bucket(value.to_key(), offset);
        }
        previous
    }

    fn insert_into_bucket(&mut self, key: V::Key, offset: usize) {
        let cols = self.shape.cols;
        let inserted = match self.buckets.get_mut(&key) {
            Some(positions) => positions.insert(offset, cols),
            None => {
                let density = self.recorded as f32 / self.shape.cells().max(1) as f32;
                let positions = if density >= self.run_density_threshold {
                    ValuePositions::run(offset)
                } else {
                    ValuePositions::scattered(offset, cols)
                };
                self.buckets.insert(key, positions);
                true
            }
        };
        if inserted {
            self.recorded += 1;
        }
    }

    fn remove_from_bucket(&mut self, key: &V::Key, offset: usize) {
        let cols = self.shape.cols;
        let Some(positions) = self.buckets.get_mut(key) else {
            return;
        };
        if positions.remove(offset, cols) {
            self.recorded -= 1;
        }
        if positions.is_empty() {
            self.buckets.remove(key);
        }
    }

    pub fn histogram(&self, no_data: &V) -> ValueHistogram<V> {
        let mut histogram = ValueHistogram::new();
        let no_data_cells = self.no_data.count_ones();
        histogram.add_no_data(no_data_cells as u64);
        let default_cells = self.shape.cells() - no_data_cells - self.recorded;
        histogram.add(&self.default, default_cells as u64, no_data);
        for (key, positions) in &self.buckets {
            histogram.add_key(key.clone(), positions.len() as u64);
        }
        histogram
    }

    /// Materialize a row-major dense view.
    pub fn to_values(&self, no_data: &V) -> Result<Vec<V>, AllocationFailure> {
        let cells = self.shape.cells();
        let mut values = Vec::new();
        values
            .try_reserve_exact(cells)
            .map_err(|_| AllocationFailure::new(cells.saturating_mul(std::mem::size_of::<V>())))?;
        values.resize(cells, self.default.clone());
        for (key, positions) in &self.buckets {
            for offset in positions.offsets(self.shape.cols) {
                values[offset] = V::from_key(key);
            }
        }
        for offset in self.no_data.iter_ones() {
            values[offset] = no_data.clone();
        }
        Ok(values)
    }

    pub fn estimated_bytes(&self) -> usize {
        let buckets: usize = self
            .buckets
            .iter()
            .map(|(key, positions)| {
                BUCKET_OVERHEAD_BYTES
                    + std::mem::size_of::<V::Key>()
                    + V::from_key(key).heap_bytes()
                    + positions.heap_bytes()
            })
            .sum();
        SPARSE_BASE_OVERHEAD_BYTES
            + std::mem::size_of::<V>()
            + self.default.heap_bytes()
            + self.no_data.heap_bytes()
            + buckets
    }

    /// Upper bound on the bytes one write can add.
    ///
    /// Covers a new bucket, a run rebuilt to span the whole chunk while its old
    /// bits are still live, and growth of the no-data mask.
    pub fn write_headroom_bytes(&self) -> usize {
        let mask_bytes = self.shape.cells().div_ceil(64) * std::mem::size_of::<u64>();
        BUCKET_OVERHEAD_BYTES
            + std::mem::size_of::<V::Key>()
            + SCATTERED_ENTRY_OVERHEAD_BYTES
            + 3 * mask_bytes
    }

    /// Verify the bookkeeping: no empty bucket, `recorded` matches the bucket
    /// sizes, and no offset is claimed twice or lies outside the chunk.
    pub fn check_invariants(&self) -> Result<(), String> {
        let cells = self.shape.cells();
        let mut claimed = BitVec::with_len_all_false(cells);
        for offset in self.no_data.iter_ones() {
            if offset >= cells {
                return Err(format!("no-data offset {offset} outside {cells} cells"));
            }
            claimed.set(offset, true);
        }
        let mut total = 0usize;
        for (key, positions) in &self.buckets {
            if positions.is_empty() {
                return Err(format!("bucket {key:?} has zero cardinality"));
            }
            if V::from_key(key).same_value(&self.default) {
                return Err(format!("bucket {key:?} duplicates the default value"));
            }
            for offset in positions.offsets(self.shape.cols) {
                if offset >= cells {
                    return Err(format!("bucket {key:?} offset {offset} outside {cells} cells"));
                }
                if claimed.set(offset, true) {
                    return Err(format!("offset {offset} claimed twice"));
                }
            }
            total += positions.len();
        }
        if total != self.recorded {
            return Err(format!("recorded {} but buckets hold {total}", self.recorded));
        }
        Ok(())
    }
}
