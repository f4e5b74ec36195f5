use std::sync::Arc;

use gridstore_chunk::{ChunkEncoding, ChunkFactory};
use gridstore_model::{BigRational, ChunkId, RasterHeader};
use gridstore_storage::{
    CacheStore, Grid, GridCell, GridError, GridOptions, MemoryManager, MemoryManagerConfig,
    SqliteCacheStore, StatisticsMode, VecRasterSource,
};
use pretty_assertions::assert_eq;

const NO_DATA: i64 = -9999;

fn memory(max_memory_bytes: usize) -> MemoryManager {
    MemoryManager::in_memory(MemoryManagerConfig {
        max_memory_bytes,
        reserve_bytes: 0,
        max_recovery_attempts: 16,
    })
}

fn options(rows: u64, cols: u64, chunk: u32) -> GridOptions<i64> {
    GridOptions::new(rows, cols, NO_DATA).with_chunk_dimensions(chunk, chunk)
}

fn grid(memory: &MemoryManager, rows: u64, cols: u64, chunk: u32) -> Grid<i64> {
    Grid::create(memory.clone(), options(rows, cols, chunk)).unwrap()
}

#[test]
fn writes_survive_eviction_under_a_small_budget() {
    let memory = memory(1024);
    let grid = grid(&memory, 16, 16, 4);
    for row in 0..16 {
        for col in 0..16 {
            assert_eq!(grid.set_cell(row, col, row * 16 + col + 1).unwrap(), NO_DATA);
        }
    }
    for row in 0..16 {
        for col in 0..16 {
            assert_eq!(grid.get_cell(row, col).unwrap(), row * 16 + col + 1);
        }
    }

    let stats = memory.stats_snapshot();
    assert!(stats.chunks_evicted > 0);
    assert!(stats.chunks_loaded > 0);
    assert_eq!(stats.out_of_memory, 0);
    assert!(memory.charged_bytes() <= 1024);

    let statistics = grid.statistics();
    assert_eq!(statistics.get_n().unwrap(), 256);
    assert_eq!(
        statistics.get_sum().unwrap(),
        BigRational::from_integer((256 * 257 / 2).into())
    );
    assert_eq!(statistics.get_min(false).unwrap(), Some((1, 1)));
    assert_eq!(statistics.get_max(false).unwrap(), Some((256, 1)));
}

#[test]
fn injected_failures_are_recovered_by_evicting_lru_chunks() {
    let memory = memory(1 << 20);
    let grid = grid(&memory, 8, 8, 2);
    for chunk in 0..4 {
        grid.set_cell(0, chunk * 2, chunk + 1).unwrap();
    }
    assert_eq!(grid.resident_chunk_ids().len(), 4);

    memory.fail_next_allocations(2);
    grid.set_cell(7, 7, 42).unwrap();

    let stats = memory.stats_snapshot();
    assert_eq!(stats.allocation_failures, 2);
    assert_eq!(stats.recoveries, 2);
    assert_eq!(stats.chunks_evicted, 2);
    assert!(!grid.is_resident(ChunkId::new(0, 0)));
    assert!(!grid.is_resident(ChunkId::new(0, 1)));
    assert!(grid.is_resident(ChunkId::new(3, 3)));

    for chunk in 0..4 {
        assert_eq!(grid.get_cell(0, chunk * 2).unwrap(), chunk + 1);
    }
    assert_eq!(grid.get_cell(7, 7).unwrap(), 42);
}

#[test]
fn nothing_to_evict_is_out_of_memory() {
    let memory = memory(1 << 20);
    let grid = grid(&memory, 4, 4, 2);
    memory.fail_next_allocations(1);
    let err = grid.set_cell(1, 1, 5).unwrap_err();
    assert!(matches!(err, GridError::OutOfMemory { attempts: 0, .. }), "{err:?}");
    assert_eq!(memory.stats_snapshot().out_of_memory, 1);

    assert_eq!(grid.get_cell(1, 1).unwrap(), NO_DATA);
    assert_eq!(grid.statistics().get_n().unwrap(), 0);
    assert_eq!(grid.set_cell(1, 1, 5).unwrap(), NO_DATA);
    assert_eq!(grid.statistics().get_n().unwrap(), 1);
}

#[test]
fn other_grids_are_evicted_first() {
    let memory = memory(1 << 20);
    let first = grid(&memory, 4, 4, 2);
    let second = grid(&memory, 4, 4, 2);
    first.set_cell(0, 0, 1).unwrap();
    first.set_cell(2, 2, 2).unwrap();
    second.set_cell(0, 0, 3).unwrap();
    second.set_cell(2, 2, 4).unwrap();

    memory.fail_next_allocations(1);
    second.set_cell(0, 3, 5).unwrap();

    assert_eq!(first.resident_chunk_ids().len(), 1);
    assert!(!first.is_resident(ChunkId::new(0, 0)));
    assert_eq!(second.resident_chunk_ids().len(), 3);
    assert_eq!(first.get_cell(0, 0).unwrap(), 1);
}

#[test]
fn pinned_chunks_are_never_evicted() {
    let memory = memory(1 << 20);
    let grid = grid(&memory, 4, 4, 2);
    grid.set_cell(0, 0, 1).unwrap();
    grid.set_cell(3, 3, 2).unwrap();

    let pin = memory.pin(grid.id(), grid.resident_chunk_ids());
    memory.fail_next_allocations(1);
    assert!(matches!(grid.set_cell(0, 3, 3), Err(GridError::OutOfMemory { .. })));
    assert_eq!(grid.resident_chunk_ids().len(), 2);

    drop(pin);
    memory.fail_next_allocations(1);
    grid.set_cell(0, 3, 3).unwrap();
    assert_eq!(grid.get_cell(0, 3).unwrap(), 3);
}

#[test]
fn sqlite_store_holds_evicted_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteCacheStore::open_path(dir.path().join("cache.db")).unwrap());
    let memory = MemoryManager::new(store.clone(), MemoryManagerConfig::default());
    let grid = grid(&memory, 6, 6, 3);
    grid.set_cell(0, 0, 10).unwrap();
    grid.set_cell(5, 5, 20).unwrap();

    assert_eq!(grid.swap_out_all().unwrap(), 2);
    assert_eq!(store.chunk_count(grid.id()).unwrap(), 2);
    assert_eq!(grid.get_cell(0, 0).unwrap(), 10);
    assert_eq!(grid.get_cell(5, 5).unwrap(), 20);
    assert_eq!(grid.get_cell(3, 0).unwrap(), NO_DATA);

    let id = grid.id();
    grid.delete().unwrap();
    assert_eq!(store.chunk_count(id).unwrap(), 0);
}

#[test]
fn dropping_a_grid_flushes_dirty_chunks() {
    let memory = memory(1 << 20);
    let grid = grid(&memory, 4, 4, 2);
    let id = grid.id();
    grid.set_cell(3, 0, 8).unwrap();
    drop(grid);

    let bytes = memory.store().get(id, ChunkId::new(1, 0)).unwrap().unwrap();
    let chunk = gridstore_chunk::Chunk::<i64>::from_bytes(&bytes).unwrap();
    let ctx = gridstore_chunk::ChunkContext::new(&NO_DATA);
    assert_eq!(chunk.get(ctx, 1, 0).unwrap(), 8);
    assert_eq!(memory.charged_bytes(), 0);
}

#[test]
fn fill_value_backs_untouched_chunks() {
    let memory = memory(1 << 20);
    let grid = Grid::create(
        memory.clone(),
        GridOptions::new(5, 5, NO_DATA)
            .with_chunk_dimensions(2, 2)
            .with_fill(0),
    )
    .unwrap();
    assert_eq!(grid.get_cell(4, 4).unwrap(), 0);
    assert_eq!(grid.set_cell(4, 4, 0).unwrap(), 0);
    assert!(grid.resident_chunk_ids().is_empty());

    let statistics = grid.statistics();
    assert_eq!(statistics.get_n().unwrap(), 25);
    assert_eq!(statistics.get_min(false).unwrap(), Some((0, 25)));

    assert_eq!(grid.set_cell(4, 4, NO_DATA).unwrap(), 0);
    assert_eq!(statistics.get_n().unwrap(), 24);
    assert_eq!(grid.chunk(ChunkId::new(2, 2)).unwrap().shape().cells(), 1);
}

#[test]
fn sparse_conversion_target_is_honoured() {
    let memory = memory(1 << 20);
    let grid = Grid::create(
        memory,
        GridOptions::new(64, 64, NO_DATA)
            .with_chunk_dimensions(32, 32)
            .with_factory(ChunkFactory::new(ChunkEncoding::Singlet, ChunkEncoding::SparseMap)),
    )
    .unwrap();
    grid.set_cell(3, 4, 1).unwrap();
    grid.set_cell(5, 6, 1).unwrap();
    let chunk = grid.chunk(ChunkId::new(0, 0)).unwrap();
    assert_eq!(chunk.encoding(), ChunkEncoding::SparseMap);
    chunk.check_invariants().unwrap();
    assert_eq!(grid.worth_swapping_ids(), vec![ChunkId::new(0, 0)]);
}

#[test]
fn dense_conversion_target_keeps_the_fill() {
    let memory = memory(1 << 20);
    let grid = Grid::create(
        memory,
        options(6, 6, 3)
            .with_fill(4)
            .with_factory(ChunkFactory::new(ChunkEncoding::Singlet, ChunkEncoding::DenseArray)),
    )
    .unwrap();
    assert_eq!(grid.set_cell(1, 1, 9).unwrap(), 4);

    let chunk = grid.chunk(ChunkId::new(0, 0)).unwrap();
    assert_eq!(chunk.encoding(), ChunkEncoding::DenseArray);
    for row in 0..3 {
        for col in 0..3 {
            let expected = if (row, col) == (1, 1) { 9 } else { 4 };
            assert_eq!(grid.get_cell(row, col).unwrap(), expected, "cell ({row}, {col})");
        }
    }
    let statistics = grid.statistics();
    assert_eq!(statistics.get_n().unwrap(), 36);
    assert_eq!(statistics.get_max(false).unwrap(), Some((9, 1)));
    assert_eq!(statistics.get_min(false).unwrap(), Some((4, 35)));
}

#[test]
fn reopened_grids_read_what_was_dropped() {
    let memory = memory(1 << 20);
    let grid = grid(&memory, 6, 6, 3);
    let id = grid.id();
    grid.set_cell(0, 0, 10).unwrap();
    grid.set_cell(4, 5, 20).unwrap();
    grid.swap_out_all().unwrap();
    grid.set_cell(0, 1, 30).unwrap();
    drop(grid);
    assert_eq!(memory.store().chunk_ids(id).unwrap().len(), 2);

    let reopened = Grid::open(memory.clone(), id, options(6, 6, 3)).unwrap();
    assert_eq!(reopened.id(), id);
    assert_eq!(reopened.get_cell(0, 0).unwrap(), 10);
    assert_eq!(reopened.get_cell(0, 1).unwrap(), 30);
    assert_eq!(reopened.get_cell(4, 5).unwrap(), 20);
    assert_eq!(reopened.get_cell(3, 0).unwrap(), NO_DATA);

    let statistics = reopened.statistics();
    assert_eq!(statistics.rescan_count(), 1);
    assert_eq!(statistics.get_n().unwrap(), 3);
    assert_eq!(statistics.get_sum().unwrap(), BigRational::from_integer(60.into()));

    let err = Grid::open(memory.clone(), id, options(6, 6, 3)).err().unwrap();
    assert!(matches!(err, GridError::AlreadyOpen(open) if open == id), "{err:?}");

    reopened.delete().unwrap();
    assert!(memory.store().chunk_ids(id).unwrap().is_empty());
}

#[test]
fn reopening_with_a_smaller_shape_is_rejected() {
    let memory = memory(1 << 20);
    let grid = grid(&memory, 6, 6, 3);
    let id = grid.id();
    grid.set_cell(5, 5, 1).unwrap();
    drop(grid);

    let err = Grid::open(memory.clone(), id, options(3, 3, 3)).err().unwrap();
    assert!(matches!(err, GridError::ChunkOutOfRange(chunk) if chunk == ChunkId::new(1, 1)));
    assert_eq!(Grid::open(memory, id, options(6, 6, 3)).unwrap().get_cell(5, 5).unwrap(), 1);
}

#[test]
fn sqlite_grids_reopen_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let id = {
        let store = Arc::new(SqliteCacheStore::open_path(&path).unwrap());
        let memory = MemoryManager::new(store, MemoryManagerConfig::default());
        let grid = grid(&memory, 8, 8, 4);
        grid.set_cell(7, 0, 5).unwrap();
        grid.set_cell(7, 1, 6).unwrap();
        grid.id()
    };

    let store = Arc::new(SqliteCacheStore::open_path(&path).unwrap());
    assert_eq!(store.chunk_ids(id).unwrap(), vec![ChunkId::new(1, 0)]);
    assert!(store.stored_bytes(id).unwrap() > 0);
    let memory = MemoryManager::new(store, MemoryManagerConfig::default());
    let grid = Grid::open(
        memory,
        id,
        options(8, 8, 4).with_statistics(StatisticsMode::Lazy),
    )
    .unwrap();
    assert!(!grid.statistics().is_valid());
    assert_eq!(grid.get_cell(7, 1).unwrap(), 6);
    assert_eq!(grid.statistics().get_n().unwrap(), 2);
}

#[test]
fn cells_iterate_chunk_by_chunk() {
    let memory = memory(1 << 20);
    let grid = grid(&memory, 3, 3, 2);
    for row in 0..3 {
        for col in 0..3 {
            if (row + col) % 2 == 0 {
                grid.set_cell(row, col, row * 3 + col).unwrap();
            }
        }
    }
    grid.swap_out_all().unwrap();

    let cells: Vec<GridCell<i64>> = grid.cells().collect::<Result<_, _>>().unwrap();
    let positions: Vec<(u64, u64)> = cells.iter().map(|cell| (cell.row, cell.col)).collect();
    assert_eq!(
        positions,
        vec![
            (0, 0),
            (0, 1),
            (1, 0),
            (1, 1),
            (0, 2),
            (1, 2),
            (2, 0),
            (2, 1),
            (2, 2),
        ]
    );
    for cell in &cells {
        assert_eq!(cell.value, grid.get_cell(cell.row as i64, cell.col as i64).unwrap());
    }
    assert_eq!(cells[4].value, 2);
    assert_eq!(cells[5].value, NO_DATA);
}

#[test]
fn from_source_loads_every_cell() {
    let memory = memory(1 << 20);
    let values: Vec<i64> = (0..15).map(|v| if v % 4 == 0 { NO_DATA } else { v }).collect();
    let source = VecRasterSource::new(RasterHeader::new(3, 5, NO_DATA), values.clone());
    let grid = Grid::from_source(memory.clone(), source, 2, 2).unwrap();

    for (index, value) in values.iter().enumerate() {
        let (row, col) = ((index / 5) as i64, (index % 5) as i64);
        assert_eq!(grid.get_cell(row, col).unwrap(), *value);
    }
    let statistics = grid.statistics();
    assert_eq!(statistics.rescan_count(), 1);
    assert_eq!(statistics.get_n().unwrap(), 11);
    assert_eq!(statistics.get_min(false).unwrap(), Some((1, 1)));
    assert_eq!(statistics.get_max(false).unwrap(), Some((14, 1)));

    let lazy = Grid::from_source_with(
        memory,
        VecRasterSource::new(RasterHeader::new(3, 5, NO_DATA), values),
        GridOptions::new(0, 0, 0)
            .with_chunk_dimensions(2, 2)
            .with_statistics(StatisticsMode::Lazy),
    )
    .unwrap();
    assert_eq!(lazy.no_data(), &NO_DATA);
    assert!(!lazy.statistics().is_valid());
    assert_eq!(lazy.statistics().get_n().unwrap(), 11);
}

#[test]
fn short_sources_are_rejected() {
    let memory = memory(1 << 20);
    let source = VecRasterSource::new(RasterHeader::new(3, 5, NO_DATA), vec![1; 14]);
    let err = Grid::from_source(memory, source, 2, 2).err().unwrap();
    assert!(matches!(err, GridError::TruncatedSource { expected: 15, read: 14 }), "{err:?}");
}

#[test]
fn imports_larger_than_the_budget_keep_every_cell() {
    let memory = memory(1024);
    let values: Vec<i64> = (0..400).collect();
    let source = VecRasterSource::new(RasterHeader::new(20, 20, NO_DATA), values);
    let grid = Grid::from_source(memory.clone(), source, 4, 4).unwrap();
    assert!(memory.stats_snapshot().chunks_evicted > 0);
    for row in 0..20 {
        for col in 0..20 {
            assert_eq!(grid.get_cell(row, col).unwrap(), row * 20 + col);
        }
    }
    assert_eq!(
        grid.statistics().get_sum().unwrap(),
        BigRational::from_integer((399 * 400 / 2).into())
    );
}
