use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use gridstore_chunk::{
    Chunk, ChunkCells, ChunkContext, ChunkEncoding, ChunkError, ChunkFactory, ChunkPayload,
    ValueHistogram,
};
use gridstore_model::{CellLocation, ChunkId, GridShape, GridValue, RasterHeader};
use lru::LruCache;
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::iter::{ChunkIds, GridCells};
use crate::memory::{MemoryManager, SwapTarget, VictimPolicy};
use crate::statistics::{Aggregate, GridStatistics, Statistics, StatisticsMode};

const DEFAULT_CHUNK_SIDE: u32 = 256;

/// Construction options for [`Grid::create`].
#[derive(Clone, Debug)]
pub struct GridOptions<V> {
    pub rows: u64,
    pub cols: u64,
    /// Chunk height (default: 256).
    pub chunk_rows: u32,
    /// Chunk width (default: 256).
    pub chunk_cols: u32,
    pub no_data: V,
    /// Value of every cell in a chunk that was never written (default: `no_data`).
    pub fill: V,
    pub factory: ChunkFactory,
    pub statistics: StatisticsMode,
    /// Convert a sparse chunk to dense once the sparse form is the larger one
    /// (default: true).
    pub auto_densify: bool,
}

impl<V: GridValue> GridOptions<V> {
    pub fn new(rows: u64, cols: u64, no_data: V) -> Self {
        Self {
            rows,
            cols,
            chunk_rows: DEFAULT_CHUNK_SIDE,
            chunk_cols: DEFAULT_CHUNK_SIDE,
            fill: no_data.clone(),
            no_data,
            factory: ChunkFactory::default(),
            statistics: StatisticsMode::default(),
            auto_densify: true,
        }
    }

    pub fn from_header(header: &RasterHeader<V>) -> Self {
        Self::new(header.rows, header.cols, header.no_data.clone())
    }

    pub fn with_chunk_dimensions(mut self, chunk_rows: u32, chunk_cols: u32) -> Self {
        self.chunk_rows = chunk_rows;
        self.chunk_cols = chunk_cols;
        self
    }

    pub fn with_fill(mut self, fill: V) -> Self {
        self.fill = fill;
        self
    }

    pub fn with_factory(mut self, factory: ChunkFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_statistics(mut self, mode: StatisticsMode) -> Self {
        self.statistics = mode;
        self
    }

    pub fn with_auto_densify(mut self, auto_densify: bool) -> Self {
        self.auto_densify = auto_densify;
        self
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum WriteKind {
    Set,
    Init,
}

struct Resident<V: GridValue> {
    chunk: Chunk<V>,
    /// Bytes currently charged to the memory manager for this chunk.
    charged: usize,
}

pub(crate) struct GridInner<V: GridValue> {
    id: Uuid,
    shape: GridShape,
    no_data: V,
    fill: V,
    factory: ChunkFactory,
    auto_densify: bool,
    resident: LruCache<ChunkId, Resident<V>>,
    /// Chunks with a blob in the cache store. Anything neither resident nor
    /// stored was never materialized and holds `fill`.
    stored: HashSet<ChunkId>,
    statistics: GridStatistics<V>,
    memory: MemoryManager,
}

impl<V: GridValue> GridInner<V> {
    fn is_untouched(&self, id: ChunkId) -> bool {
        !self.resident.contains(&id) && !self.stored.contains(&id)
    }

    /// A resident chunk that is still the implicit fill singlet can be dropped
    /// without writing it anywhere.
    fn is_implicit(&self, id: ChunkId, chunk: &Chunk<V>) -> bool {
        if self.stored.contains(&id) {
            return false;
        }
        matches!(
            chunk.payload(),
            ChunkPayload::Singlet(singlet) if singlet.value().same_value(&self.fill)
        )
    }

    /// Bring `id` into the resident map, loading it from the cache store or
    /// materializing it from the fill value.
    fn ensure_resident(&mut self, id: ChunkId) -> Result<()> {
        if self.resident.get(&id).is_some() {
            return Ok(());
        }
        let chunk = if self.stored.contains(&id) {
            let bytes = self
                .memory
                .load_chunk(self.id, id)?
                .ok_or(GridError::MissingChunk(id))?;
            let chunk = Chunk::from_bytes(&bytes)?;
            log::debug!("loaded chunk {id} of grid {} ({} bytes)", self.id, bytes.len());
            chunk
        } else {
            let shape = self.shape.chunk_shape(id).ok_or(GridError::ChunkOutOfRange(id))?;
            self.factory.create(self.id, id, shape, &self.fill)?
        };
        let charged = chunk.estimated_bytes();
        self.memory.try_charge(charged)?;
        log::trace!("charged {charged} bytes for chunk {id} of grid {}", self.id);
        if let Some((_, replaced)) = self.resident.push(id, Resident { chunk, charged }) {
            self.memory.release(replaced.charged);
        }
        Ok(())
    }

    fn read(&mut self, location: CellLocation) -> Result<V> {
        if self.is_untouched(location.chunk) {
            return Ok(self.fill.clone());
        }
        self.ensure_resident(location.chunk)?;
        let ctx = ChunkContext::new(&self.no_data);
        let entry = self
            .resident
            .get(&location.chunk)
            .ok_or(GridError::MissingChunk(location.chunk))?;
        Ok(entry.chunk.get(ctx, location.row, location.col)?)
    }

    fn write(&mut self, location: CellLocation, value: &V, kind: WriteKind) -> Result<V> {
        if self.is_untouched(location.chunk) && value.same_value(&self.fill) {
            return Ok(self.fill.clone());
        }
        self.ensure_resident(location.chunk)?;
        let previous = match self.apply(location, value, kind) {
            Err(GridError::Chunk(ChunkError::SingletConflict)) => {
                self.convert_resident(location.chunk, self.factory.conversion_target)?;
                self.apply(location, value, kind)?
            }
            other => other?,
        };
        if kind == WriteKind::Set {
            self.statistics.record_write(&previous, value, &self.no_data);
        }
        if self.auto_densify {
            self.densify_if_larger(location.chunk)?;
        }
        Ok(previous)
    }

    /// Reserve the chunk's worst-case growth, write, then settle the charge.
    fn apply(&mut self, location: CellLocation, value: &V, kind: WriteKind) -> Result<V> {
        let ctx = ChunkContext::new(&self.no_data);
        let entry = self
            .resident
            .get_mut(&location.chunk)
            .ok_or(GridError::MissingChunk(location.chunk))?;
        let reservation = self.memory.reserve(entry.chunk.write_headroom_bytes())?;
        let previous = match kind {
            WriteKind::Set => entry.chunk.set(ctx, location.row, location.col, value.clone())?,
            WriteKind::Init => {
                let previous = entry.chunk.get(ctx, location.row, location.col)?;
                entry.chunk.init(ctx, location.row, location.col, value.clone())?;
                // A chunk reloaded mid-import is clean; it must not be dropped unsaved.
                if !previous.same_value(value) {
                    entry.chunk.mark_dirty();
                }
                previous
            }
        };
        let actual = entry.chunk.estimated_bytes();
        reservation.settle(entry.charged, actual);
        entry.charged = actual;
        Ok(previous)
    }

    /// Re-encode a resident chunk and replace its map entry wholesale.
    fn convert_resident(&mut self, id: ChunkId, target: ChunkEncoding) -> Result<()> {
        let ctx = ChunkContext::new(&self.no_data);
        let entry = self.resident.peek(&id).ok_or(GridError::MissingChunk(id))?;
        let reservation = self
            .memory
            .reserve(self.factory.conversion_estimate(&entry.chunk, target, ctx))?;
        let converted = self.factory.convert(&entry.chunk, target, ctx)?;
        let previous = entry.charged;
        let actual = converted.estimated_bytes();
        reservation.settle(previous, actual);
        if let Some(entry) = self.resident.peek_mut(&id) {
            *entry = Resident {
                chunk: converted,
                charged: actual,
            };
        }
        Ok(())
    }

    /// Best effort: a sparse chunk grown past its dense footprint is densified
    /// if the budget allows, otherwise left alone.
    fn densify_if_larger(&mut self, id: ChunkId) -> Result<()> {
        let ctx = ChunkContext::new(&self.no_data);
        let Some(entry) = self.resident.peek(&id) else {
            return Ok(());
        };
        if entry.chunk.encoding() != ChunkEncoding::SparseMap {
            return Ok(());
        }
        // `charged` was settled to the sparse estimate by the write.
        if entry.charged <= self.factory.dense_bytes(&entry.chunk, ctx) {
            return Ok(());
        }
        match self.convert_resident(id, ChunkEncoding::DenseArray) {
            Err(err) if err.allocation_failure().is_some() => {
                log::trace!("skipped densifying chunk {id} of grid {}: {err}", self.id);
                Ok(())
            }
            other => other,
        }
    }

    fn histogram(&mut self, id: ChunkId) -> Result<ValueHistogram<V>> {
        if self.is_untouched(id) {
            let shape = self.shape.chunk_shape(id).ok_or(GridError::ChunkOutOfRange(id))?;
            let mut histogram = ValueHistogram::new();
            histogram.add(&self.fill, shape.cells() as u64, &self.no_data);
            return Ok(histogram);
        }
        self.ensure_resident(id)?;
        let ctx = ChunkContext::new(&self.no_data);
        let entry = self.resident.peek(&id).ok_or(GridError::MissingChunk(id))?;
        Ok(entry.chunk.histogram(ctx))
    }

    fn snapshot(&mut self, id: ChunkId) -> Result<Chunk<V>> {
        if self.is_untouched(id) {
            let shape = self.shape.chunk_shape(id).ok_or(GridError::ChunkOutOfRange(id))?;
            return Ok(self
                .factory
                .create_encoded(ChunkEncoding::Singlet, self.id, id, shape, &self.fill)?);
        }
        self.ensure_resident(id)?;
        let entry = self.resident.peek(&id).ok_or(GridError::MissingChunk(id))?;
        Ok(entry.chunk.clone())
    }

    /// Write a resident chunk to the cache store if it has unsaved changes.
    fn store_if_dirty(&mut self, id: ChunkId) -> Result<()> {
        let Some(entry) = self.resident.peek(&id) else {
            return Ok(());
        };
        if !entry.chunk.is_dirty() {
            return Ok(());
        }
        if !self.is_implicit(id, &entry.chunk) {
            let bytes = entry.chunk.to_bytes()?;
            self.memory.store_chunk(self.id, id, &bytes)?;
            self.stored.insert(id);
        }
        if let Some(entry) = self.resident.peek_mut(&id) {
            entry.chunk.mark_clean();
        }
        Ok(())
    }

    /// Store (if dirty) and drop a resident chunk.
    fn swap_out(&mut self, id: ChunkId) -> Result<()> {
        self.store_if_dirty(id)?;
        if let Some(entry) = self.resident.pop(&id) {
            self.memory.release(entry.charged);
            self.memory.note_evicted();
            log::debug!(
                "evicted {} chunk {id} of grid {} ({} bytes)",
                entry.chunk.encoding(),
                self.id,
                entry.charged
            );
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<usize> {
        let dirty: Vec<ChunkId> = self
            .resident
            .iter()
            .filter(|(_, entry)| entry.chunk.is_dirty())
            .map(|(id, _)| *id)
            .collect();
        for id in &dirty {
            self.store_if_dirty(*id)?;
        }
        Ok(dirty.len())
    }
}

impl<V: GridValue> SwapTarget for GridInner<V> {
    fn grid_id(&self) -> Uuid {
        self.id
    }

    fn evict_one(&mut self, policy: VictimPolicy) -> Result<bool> {
        let victim = self
            .resident
            .iter()
            .rev()
            .find(|(id, entry)| {
                !self.memory.is_pinned(self.id, **id)
                    && (policy == VictimPolicy::AnyUnpinned || entry.chunk.is_worth_swapping())
            })
            .map(|(id, _)| *id);
        match victim {
            Some(id) => {
                self.swap_out(id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// A 2D raster of `V` partitioned into chunks that live in memory on demand.
///
/// Chunks are materialized on first write, evicted to the memory manager's
/// cache store under memory pressure and reloaded transparently. Cells outside
/// the grid read as no-data and ignore writes.
///
/// Dropping a grid flushes its dirty resident chunks to the cache store, where
/// [`Grid::open`] can reattach to them under the same id. Use [`Grid::delete`]
/// to discard a grid and its blobs instead.
pub struct Grid<V: GridValue> {
    id: Uuid,
    shape: GridShape,
    no_data: V,
    fill: V,
    memory: MemoryManager,
    inner: Arc<Mutex<GridInner<V>>>,
    deleted: bool,
}

impl<V: GridValue> Grid<V> {
    pub fn create(memory: MemoryManager, options: GridOptions<V>) -> Result<Self> {
        Self::build(memory, Uuid::new_v4(), options, HashSet::new())
    }

    /// Reattach to the chunks a dropped grid left in the memory manager's
    /// cache store under `id`.
    ///
    /// The store is authoritative: every chunk with a blob is loaded from it on
    /// demand and every other chunk holds `options.fill`. `options` must
    /// describe the same shape, chunk dimensions, no-data and fill as the grid
    /// that wrote the blobs. Statistics are rebuilt (eager) or marked invalid
    /// (lazy).
    pub fn open(memory: MemoryManager, id: Uuid, options: GridOptions<V>) -> Result<Self> {
        let stored: HashSet<ChunkId> = memory.stored_chunk_ids(id)?.into_iter().collect();
        let reattached = !stored.is_empty();
        let grid = Self::build(memory, id, options, stored)?;
        if reattached {
            let mode = grid.lock().statistics.mode();
            match mode {
                StatisticsMode::Eager => grid.rescan_statistics()?,
                StatisticsMode::Lazy => grid.invalidate_statistics(),
            }
        }
        log::debug!("reopened grid {id}");
        Ok(grid)
    }

    fn build(
        memory: MemoryManager,
        id: Uuid,
        options: GridOptions<V>,
        stored: HashSet<ChunkId>,
    ) -> Result<Self> {
        let shape = GridShape::new(
            options.rows,
            options.cols,
            options.chunk_rows,
            options.chunk_cols,
        )?;
        if !options.fill.is_storable() && !options.fill.same_value(&options.no_data) {
            return Err(GridError::UnstorableValue(format!("{:?}", options.fill)));
        }
        if let Some(outside) = stored.iter().find(|chunk| !shape.contains_chunk(**chunk)) {
            return Err(GridError::ChunkOutOfRange(*outside));
        }
        let initial = Aggregate::uniform(&options.fill, shape.cell_count(), &options.no_data);
        let inner = GridInner {
            id,
            shape,
            no_data: options.no_data.clone(),
            fill: options.fill.clone(),
            factory: options.factory,
            auto_densify: options.auto_densify,
            resident: LruCache::unbounded(),
            stored,
            statistics: GridStatistics::new(options.statistics, initial),
            memory: memory.clone(),
        };
        let inner = Arc::new(Mutex::new(inner));
        let target: Weak<Mutex<GridInner<V>>> = Arc::downgrade(&inner);
        if !memory.register(id, target) {
            return Err(GridError::AlreadyOpen(id));
        }
        log::debug!(
            "created {}x{} grid {id} with {} chunks",
            shape.rows(),
            shape.cols(),
            shape.chunk_count()
        );
        Ok(Self {
            id,
            shape,
            no_data: options.no_data,
            fill: options.fill,
            memory,
            inner,
            deleted: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    pub fn rows(&self) -> u64 {
        self.shape.rows()
    }

    pub fn cols(&self) -> u64 {
        self.shape.cols()
    }

    pub fn no_data(&self) -> &V {
        &self.no_data
    }

    pub fn fill(&self) -> &V {
        &self.fill
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    fn lock(&self) -> MutexGuard<'_, GridInner<V>> {
        self.inner.lock().expect("grid mutex poisoned")
    }

    /// Run `op` against the grid, recovering memory and retrying whenever it
    /// fails to allocate.
    ///
    /// `op` must reserve before it mutates so a failed attempt leaves nothing
    /// behind. The loop stops with [`GridError::OutOfMemory`] once recovery
    /// evicts nothing or the configured number of attempts is spent.
    pub(crate) fn with_recovery<T>(
        &self,
        mut op: impl FnMut(&mut GridInner<V>) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.lock();
        let mut attempts = 0usize;
        loop {
            let err = match op(&mut *inner) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let Some(failure) = err.allocation_failure() else {
                return Err(err);
            };
            self.memory.note_allocation_failure();
            let exhausted = attempts >= self.memory.config().max_recovery_attempts;
            if exhausted || !self.memory.recover(&mut *inner, failure)? {
                self.memory.note_out_of_memory();
                log::debug!(
                    "grid {} out of memory after {attempts} recovery attempts ({} bytes requested)",
                    self.id,
                    failure.requested
                );
                return Err(GridError::OutOfMemory {
                    requested: failure.requested,
                    attempts,
                });
            }
            attempts += 1;
        }
    }

    pub fn get_cell(&self, row: i64, col: i64) -> Result<V> {
        let Some(location) = self.shape.locate(row, col) else {
            return Ok(self.no_data.clone());
        };
        self.with_recovery(|inner| inner.read(location))
    }

    /// Write a cell and return its previous value. Writes outside the grid
    /// are ignored and return no-data.
    pub fn set_cell(&self, row: i64, col: i64, value: V) -> Result<V> {
        self.write_cell(row, col, value, WriteKind::Set)
    }

    /// Bulk-load write: no statistics update.
    pub(crate) fn init_cell(&self, row: i64, col: i64, value: V) -> Result<()> {
        self.write_cell(row, col, value, WriteKind::Init).map(|_| ())
    }

    fn write_cell(&self, row: i64, col: i64, value: V, kind: WriteKind) -> Result<V> {
        let Some(location) = self.shape.locate(row, col) else {
            return Ok(self.no_data.clone());
        };
        if !value.is_storable() && !value.same_value(&self.no_data) {
            return Err(GridError::UnstorableValue(format!("{value:?}")));
        }
        let _pin = self.memory.pin(self.id, [location.chunk]);
        self.with_recovery(|inner| inner.write(location, &value, kind))
    }

    /// Snapshot of one chunk, loaded from the cache store if evicted.
    pub fn chunk(&self, id: ChunkId) -> Result<Chunk<V>> {
        if !self.shape.contains_chunk(id) {
            return Err(GridError::ChunkOutOfRange(id));
        }
        self.with_recovery(|inner| inner.snapshot(id))
    }

    /// Every chunk id, ascending by `(chunk_row, chunk_col)`.
    pub fn chunk_ids(&self) -> ChunkIds {
        ChunkIds::new(self.shape)
    }

    /// Every cell, chunk by chunk.
    pub fn cells(&self) -> GridCells<'_, V> {
        GridCells::new(self)
    }

    pub(crate) fn chunk_cells(&self, id: ChunkId) -> Result<ChunkCells<'static, V>> {
        let chunk = self.chunk(id)?;
        Ok(chunk.into_cells(ChunkContext::new(&self.no_data))?)
    }

    pub fn statistics(&self) -> Statistics<'_, V> {
        Statistics::new(self)
    }

    pub(crate) fn statistics_snapshot(&self) -> GridStatistics<V> {
        self.lock().statistics.clone()
    }

    pub(crate) fn for_each_histogram(&self, mut f: impl FnMut(ValueHistogram<V>)) -> Result<()> {
        for id in self.chunk_ids() {
            let histogram = self.with_recovery(|inner| inner.histogram(id))?;
            f(histogram);
        }
        Ok(())
    }

    /// Rescan if the tracker is invalid or a forced extreme is stale.
    pub(crate) fn refresh_statistics(&self, force_min: bool, force_max: bool) -> Result<()> {
        if !self.lock().statistics.needs_rescan(force_min, force_max) {
            return Ok(());
        }
        self.rescan_statistics()
    }

    pub(crate) fn rescan_statistics(&self) -> Result<()> {
        let mut aggregate = Aggregate::default();
        self.for_each_histogram(|histogram| {
            aggregate.merge(Aggregate::from_histogram(&histogram));
        })?;
        let mut inner = self.lock();
        inner.statistics.replace(aggregate);
        log::debug!(
            "rescanned statistics of grid {} (rescan #{})",
            self.id,
            inner.statistics.rescan_count()
        );
        Ok(())
    }

    pub(crate) fn invalidate_statistics(&self) {
        self.lock().statistics.invalidate();
    }

    /// Switch between eager and lazy statistics. Converting to eager rescans
    /// first if the lazy aggregate is out of date.
    pub fn set_statistics_mode(&self, mode: StatisticsMode) -> Result<()> {
        if mode == StatisticsMode::Eager {
            self.refresh_statistics(false, false)?;
        }
        self.lock().statistics.set_mode(mode);
        Ok(())
    }

    /// Write every dirty resident chunk to the cache store. Returns the number
    /// of chunks written.
    pub fn flush(&self) -> Result<usize> {
        self.lock().flush()
    }

    /// Evict every unpinned resident chunk. Returns the number evicted.
    pub fn swap_out_all(&self) -> Result<usize> {
        let mut inner = self.lock();
        let ids: Vec<ChunkId> = inner.resident.iter().map(|(id, _)| *id).collect();
        let mut evicted = 0;
        for id in ids {
            if self.memory.is_pinned(self.id, id) {
                continue;
            }
            inner.swap_out(id)?;
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Re-encode every resident chunk to its smallest encoding. Returns the
    /// number of chunks converted.
    pub fn optimise_chunks(&self) -> Result<usize> {
        let ids = self.resident_chunk_ids();
        let mut converted = 0;
        for id in ids {
            let _pin = self.memory.pin(self.id, [id]);
            let changed = self.with_recovery(|inner| {
                let ctx = ChunkContext::new(&inner.no_data);
                let Some(entry) = inner.resident.peek(&id) else {
                    return Ok(false);
                };
                let target = inner.factory.optimal_encoding(&entry.chunk, ctx);
                if target == entry.chunk.encoding() {
                    return Ok(false);
                }
                inner.convert_resident(id, target)?;
                Ok(true)
            })?;
            if changed {
                converted += 1;
            }
        }
        Ok(converted)
    }

    /// Resident chunk ids, most recently used first.
    pub fn resident_chunk_ids(&self) -> Vec<ChunkId> {
        self.lock().resident.iter().map(|(id, _)| *id).collect()
    }

    pub fn is_resident(&self, id: ChunkId) -> bool {
        self.lock().resident.contains(&id)
    }

    /// Resident non-singlet chunks: the ones recovery prefers to evict.
    pub fn worth_swapping_ids(&self) -> Vec<ChunkId> {
        self.lock()
            .resident
            .iter()
            .filter(|(_, entry)| entry.chunk.is_worth_swapping())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drop the grid and every blob it left in the cache store.
    pub fn delete(mut self) -> Result<()> {
        self.deleted = true;
        {
            let mut inner = self.lock();
            let charged: usize = inner.resident.iter().map(|(_, entry)| entry.charged).sum();
            inner.resident.clear();
            inner.stored.clear();
            self.memory.release(charged);
        }
        self.memory.remove_grid(self.id)?;
        log::debug!("deleted grid {}", self.id);
        Ok(())
    }
}

impl<V: GridValue> Drop for Grid<V> {
    fn drop(&mut self) {
        self.memory.unregister(self.id);
        if self.deleted {
            return;
        }
        if let Ok(mut inner) = self.inner.lock() {
            if let Err(err) = inner.flush() {
                log::warn!("failed to flush grid {} on drop: {err}", self.id);
            }
            let charged: usize = inner.resident.iter().map(|(_, entry)| entry.charged).sum();
            inner.resident.clear();
            self.memory.release(charged);
        }
    }
}
