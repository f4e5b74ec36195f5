use std::collections::HashMap;

use gridstore_model::{BigRational, StatisticsError};
use gridstore_storage::{
    Grid, GridError, GridOptions, MemoryManager, MemoryManagerConfig, StatisticsMode,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

const NO_DATA: i32 = -9999;

fn memory() -> MemoryManager {
    MemoryManager::in_memory(MemoryManagerConfig::default())
}

fn grid(rows: u64, cols: u64, chunk: u32, mode: StatisticsMode) -> Grid<i32> {
    Grid::create(
        memory(),
        GridOptions::new(rows, cols, NO_DATA)
            .with_chunk_dimensions(chunk, chunk)
            .with_statistics(mode),
    )
    .unwrap()
}

fn rational(value: i64) -> BigRational {
    BigRational::from_integer(value.into())
}

#[test]
fn two_writes_on_a_four_by_four_grid() {
    for mode in [StatisticsMode::Eager, StatisticsMode::Lazy] {
        let grid = grid(4, 4, 2, mode);
        let statistics = grid.statistics();
        assert_eq!(statistics.get_n().unwrap(), 0);
        assert_eq!(statistics.get_min(false).unwrap(), None);

        grid.set_cell(1, 1, 5).unwrap();
        assert_eq!(statistics.get_n().unwrap(), 1);
        assert_eq!(statistics.get_sum().unwrap(), rational(5));
        assert_eq!(statistics.get_min(false).unwrap(), Some((5, 1)));
        assert_eq!(statistics.get_max(false).unwrap(), Some((5, 1)));

        grid.set_cell(0, 0, 5).unwrap();
        assert_eq!(statistics.get_n().unwrap(), 2);
        assert_eq!(statistics.get_sum().unwrap(), rational(10));
        assert_eq!(statistics.get_min(false).unwrap(), Some((5, 2)));
        assert_eq!(statistics.get_max(false).unwrap(), Some((5, 2)));
    }
}

#[test]
fn lazy_reads_rescan_once_per_write_burst() {
    let grid = grid(6, 6, 4, StatisticsMode::Lazy);
    let statistics = grid.statistics();
    assert!(!statistics.is_valid());
    assert_eq!(statistics.rescan_count(), 0);

    grid.set_cell(0, 0, 1).unwrap();
    grid.set_cell(5, 5, 3).unwrap();
    assert_eq!(statistics.get_n().unwrap(), 2);
    assert_eq!(statistics.get_sum().unwrap(), rational(4));
    assert_eq!(statistics.get_max(true).unwrap(), Some((3, 1)));
    assert_eq!(statistics.rescan_count(), 1);

    // Rewriting the same value leaves the aggregate valid.
    grid.set_cell(0, 0, 1).unwrap();
    assert!(statistics.is_valid());

    grid.set_cell(0, 0, 2).unwrap();
    assert!(!statistics.is_valid());
    assert_eq!(statistics.get_sum().unwrap(), rational(5));
    assert_eq!(statistics.get_n().unwrap(), 2);
    assert_eq!(statistics.rescan_count(), 2);
}

#[test]
fn stale_minimum_is_recomputed_on_force() {
    let grid = grid(4, 4, 2, StatisticsMode::Eager);
    grid.set_cell(0, 0, 1).unwrap();
    grid.set_cell(3, 3, 2).unwrap();
    grid.set_cell(0, 0, 3).unwrap();

    let statistics = grid.statistics();
    assert_eq!(statistics.get_min(false).unwrap(), Some((1, 0)));
    assert_eq!(statistics.rescan_count(), 0);
    assert_eq!(statistics.get_min(true).unwrap(), Some((2, 1)));
    assert_eq!(statistics.rescan_count(), 1);
    assert_eq!(statistics.get_max(true).unwrap(), Some((3, 1)));
    assert_eq!(statistics.rescan_count(), 1);
}

#[test]
fn switching_to_eager_rebuilds_the_aggregate() {
    let grid = grid(4, 4, 2, StatisticsMode::Lazy);
    grid.set_cell(2, 1, 7).unwrap();
    grid.set_statistics_mode(StatisticsMode::Eager).unwrap();
    let statistics = grid.statistics();
    assert_eq!(statistics.mode(), StatisticsMode::Eager);
    assert!(statistics.is_valid());
    assert_eq!(statistics.rescan_count(), 1);

    grid.set_cell(2, 2, 9).unwrap();
    assert_eq!(statistics.get_sum().unwrap(), rational(16));
    assert_eq!(statistics.rescan_count(), 1);
}

#[test]
fn mean_and_deviation_are_rounded_half_even() {
    let grid = grid(2, 4, 2, StatisticsMode::Eager);
    for (index, value) in [2, 4, 4, 4, 5, 5, 7, 9].into_iter().enumerate() {
        grid.set_cell(index as i64 / 4, index as i64 % 4, value).unwrap();
    }
    let statistics = grid.statistics();
    assert_eq!(statistics.get_arithmetic_mean(2).unwrap().to_string(), "5.00");
    // Sample deviation: sqrt(32 / 7).
    assert_eq!(statistics.get_standard_deviation(3).unwrap().to_string(), "2.138");
}

#[test]
fn empty_population_has_no_mean() {
    let grid = grid(3, 3, 2, StatisticsMode::Eager);
    let err = grid.statistics().get_arithmetic_mean(2).unwrap_err();
    assert!(matches!(
        err,
        GridError::Statistics(StatisticsError::EmptyPopulation)
    ));
    assert_eq!(grid.statistics().get_standard_deviation(2).unwrap().to_string(), "0.00");
}

#[test]
fn quantile_classes_split_by_population() {
    let grid = grid(1, 10, 4, StatisticsMode::Eager);
    for value in 1..=10 {
        grid.set_cell(0, i64::from(value) - 1, value).unwrap();
    }
    let classes = grid.statistics().get_quantile_classes(3).unwrap();
    let summary: Vec<(i32, i32, u64)> = classes
        .classes()
        .iter()
        .map(|class| (class.min, class.max, class.count))
        .collect();
    assert_eq!(summary, vec![(1, 4, 4), (5, 7, 3), (8, 10, 3)]);
    assert_eq!(classes.class_of(&6), Some(1));

    assert!(matches!(
        grid.statistics().get_quantile_classes(0),
        Err(GridError::Statistics(StatisticsError::NoClasses))
    ));
}

#[test]
fn statistics_survive_eviction() {
    let grid = grid(8, 8, 2, StatisticsMode::Lazy);
    for row in 0..8 {
        grid.set_cell(row, row, row as i32 + 1).unwrap();
    }
    grid.swap_out_all().unwrap();
    let statistics = grid.statistics();
    assert_eq!(statistics.get_n().unwrap(), 8);
    assert_eq!(statistics.get_sum().unwrap(), rational(36));
    assert_eq!(statistics.get_min(false).unwrap(), Some((1, 1)));
}

#[derive(Default)]
struct Model {
    cells: HashMap<(i64, i64), i32>,
}

impl Model {
    fn values(&self) -> impl Iterator<Item = i32> + '_ {
        self.cells.values().copied().filter(|value| *value != NO_DATA)
    }

    fn extreme(&self, pick: impl Fn(i32, i32) -> i32) -> Option<(i32, u64)> {
        let value = self.values().reduce(&pick)?;
        Some((value, self.values().filter(|v| *v == value).count() as u64))
    }
}

fn write_strategy() -> impl Strategy<Value = Vec<(i64, i64, i32)>> {
    let value = prop_oneof![Just(NO_DATA), -3i32..4];
    prop::collection::vec((0i64..6, 0i64..5, value), 0..60)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn aggregates_match_a_brute_force_scan(writes in write_strategy()) {
        let eager = grid(6, 5, 2, StatisticsMode::Eager);
        let lazy = grid(6, 5, 2, StatisticsMode::Lazy);
        let mut model = Model::default();
        for (row, col, value) in writes {
            let expected = model.cells.insert((row, col), value).unwrap_or(NO_DATA);
            prop_assert_eq!(eager.set_cell(row, col, value).unwrap(), expected);
            lazy.set_cell(row, col, value).unwrap();
        }

        let n = model.values().count() as u64;
        let sum: i64 = model.values().map(i64::from).sum();
        for grid in [&eager, &lazy] {
            let statistics = grid.statistics();
            prop_assert_eq!(statistics.get_n().unwrap(), n);
            prop_assert_eq!(statistics.get_sum().unwrap(), rational(sum));
            prop_assert_eq!(statistics.get_min(true).unwrap(), model.extreme(i32::min));
            prop_assert_eq!(statistics.get_max(true).unwrap(), model.extreme(i32::max));
        }
        for ((row, col), value) in &model.cells {
            prop_assert_eq!(lazy.get_cell(*row, *col).unwrap(), *value);
        }
    }
}
