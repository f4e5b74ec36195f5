use std::cmp::Ordering;

use gridstore_chunk::{standard_deviation, QuantileClasses, ValueHistogram};
use gridstore_model::{BigRational, Decimal, GridValue, StatisticsError};
use num_traits::Zero;

use crate::error::Result;
use crate::grid::Grid;

/// When aggregates are brought up to date.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum StatisticsMode {
    /// Every write applies its delta immediately.
    #[default]
    Eager,
    /// Writes invalidate; the next read rescans the grid.
    Lazy,
}

/// A tracked minimum or maximum and the number of cells holding it.
///
/// A count of zero marks a stale extreme: every cell that held the value has
/// since been overwritten, so the true extreme lies strictly beyond it.
#[derive(Clone, Debug, PartialEq)]
pub struct Extreme<V> {
    pub value: V,
    pub count: u64,
}

impl<V> Extreme<V> {
    pub fn is_stale(&self) -> bool {
        self.count == 0
    }
}

/// N, exact sum and extremes over every non-no-data cell.
#[derive(Clone, Debug, PartialEq)]
pub struct Aggregate<V> {
    pub n: u64,
    pub sum: BigRational,
    pub min: Option<Extreme<V>>,
    pub max: Option<Extreme<V>>,
}

impl<V: GridValue> Default for Aggregate<V> {
    fn default() -> Self {
        Self {
            n: 0,
            sum: BigRational::zero(),
            min: None,
            max: None,
        }
    }
}

impl<V: GridValue> Aggregate<V> {
    /// Aggregate of `cells` cells all holding `value`.
    pub fn uniform(value: &V, cells: u64, no_data: &V) -> Self {
        if cells == 0 || value.same_value(no_data) {
            return Self::default();
        }
        let extreme = Extreme {
            value: value.clone(),
            count: cells,
        };
        Self {
            n: cells,
            sum: value.to_exact() * BigRational::from_integer(cells.into()),
            min: Some(extreme.clone()),
            max: Some(extreme),
        }
    }

    pub fn from_histogram(histogram: &ValueHistogram<V>) -> Self {
        let extreme = |(value, count): (V, u64)| Extreme { value, count };
        Self {
            n: histogram.n(),
            sum: histogram.sum(),
            min: histogram.min().map(extreme),
            max: histogram.max().map(extreme),
        }
    }

    /// Fold in the aggregate of a disjoint set of cells. Both sides must be
    /// free of stale extremes.
    pub fn merge(&mut self, other: Aggregate<V>) {
        self.n += other.n;
        self.sum += other.sum;
        self.min = merge_extreme(self.min.take(), other.min, Ordering::Less);
        self.max = merge_extreme(self.max.take(), other.max, Ordering::Greater);
    }

    fn add(&mut self, value: &V) {
        self.n += 1;
        self.sum += value.to_exact();
        track(&mut self.min, value, Ordering::Less);
        track(&mut self.max, value, Ordering::Greater);
    }

    fn remove(&mut self, value: &V) {
        self.n -= 1;
        self.sum -= value.to_exact();
        if self.n == 0 {
            self.min = None;
            self.max = None;
            return;
        }
        for extreme in [&mut self.min, &mut self.max].into_iter().flatten() {
            if extreme.value.same_value(value) {
                extreme.count -= 1;
            }
        }
    }

    pub fn has_stale_min(&self) -> bool {
        self.min.as_ref().is_some_and(Extreme::is_stale)
    }

    pub fn has_stale_max(&self) -> bool {
        self.max.as_ref().is_some_and(Extreme::is_stale)
    }
}

/// Apply the extreme rule: a value beyond the tracked one replaces it with a
/// count of one, an equal value adds a tie, anything else is ignored.
fn track<V: GridValue>(extreme: &mut Option<Extreme<V>>, value: &V, beyond: Ordering) {
    let Some(current) = extreme.as_mut() else {
        *extreme = Some(Extreme {
            value: value.clone(),
            count: 1,
        });
        return;
    };
    match value.to_key().cmp(&current.value.to_key()) {
        Ordering::Equal => current.count += 1,
        ordering if ordering == beyond => {
            current.value = value.clone();
            current.count = 1;
        }
        _ => {}
    }
}

fn merge_extreme<V: GridValue>(
    left: Option<Extreme<V>>,
    right: Option<Extreme<V>>,
    beyond: Ordering,
) -> Option<Extreme<V>> {
    match (left, right) {
        (None, other) | (other, None) => other,
        (Some(mut left), Some(right)) => match right.value.to_key().cmp(&left.value.to_key()) {
            Ordering::Equal => {
                left.count += right.count;
                Some(left)
            }
            ordering if ordering == beyond => Some(right),
            _ => Some(left),
        },
    }
}

/// Per-grid aggregate tracker.
#[derive(Clone, Debug)]
pub struct GridStatistics<V> {
    mode: StatisticsMode,
    aggregate: Aggregate<V>,
    valid: bool,
    rescans: u64,
}

impl<V: GridValue> GridStatistics<V> {
    /// Eager statistics start from `initial`; lazy ones start invalid.
    pub(crate) fn new(mode: StatisticsMode, initial: Aggregate<V>) -> Self {
        Self {
            mode,
            valid: mode == StatisticsMode::Eager,
            aggregate: initial,
            rescans: 0,
        }
    }

    pub fn mode(&self) -> StatisticsMode {
        self.mode
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn aggregate(&self) -> &Aggregate<V> {
        &self.aggregate
    }

    /// Number of full rescans performed so far.
    pub fn rescan_count(&self) -> u64 {
        self.rescans
    }

    pub(crate) fn record_write(&mut self, previous: &V, value: &V, no_data: &V) {
        if previous.same_value(value) {
            return;
        }
        match self.mode {
            StatisticsMode::Lazy => self.valid = false,
            StatisticsMode::Eager if self.valid => {
                if !previous.same_value(no_data) {
                    self.aggregate.remove(previous);
                }
                if !value.same_value(no_data) {
                    self.aggregate.add(value);
                }
            }
            StatisticsMode::Eager => {}
        }
    }

    pub(crate) fn invalidate(&mut self) {
        self.valid = false;
    }

    pub(crate) fn needs_rescan(&self, force_min: bool, force_max: bool) -> bool {
        !self.valid
            || (force_min && self.aggregate.has_stale_min())
            || (force_max && self.aggregate.has_stale_max())
    }

    pub(crate) fn replace(&mut self, aggregate: Aggregate<V>) {
        self.aggregate = aggregate;
        self.valid = true;
        self.rescans += 1;
    }

    pub(crate) fn set_mode(&mut self, mode: StatisticsMode) {
        self.mode = mode;
    }
}

/// Statistics view of a grid, returned by [`Grid::statistics`].
///
/// Reads that need an up-to-date aggregate trigger a chunk-by-chunk rescan
/// when the tracker is invalid (lazy mode) or when a forced extreme is stale.
pub struct Statistics<'g, V: GridValue> {
    grid: &'g Grid<V>,
}

impl<'g, V: GridValue> Statistics<'g, V> {
    pub(crate) fn new(grid: &'g Grid<V>) -> Self {
        Self { grid }
    }

    fn aggregate(&self, force_min: bool, force_max: bool) -> Result<Aggregate<V>> {
        self.grid.refresh_statistics(force_min, force_max)?;
        Ok(self.grid.statistics_snapshot().aggregate)
    }

    pub fn mode(&self) -> StatisticsMode {
        self.grid.statistics_snapshot().mode
    }

    pub fn is_valid(&self) -> bool {
        self.grid.statistics_snapshot().valid
    }

    pub fn rescan_count(&self) -> u64 {
        self.grid.statistics_snapshot().rescans
    }

    /// Number of cells not holding no-data.
    pub fn get_n(&self) -> Result<u64> {
        Ok(self.aggregate(false, false)?.n)
    }

    pub fn get_sum(&self) -> Result<BigRational> {
        Ok(self.aggregate(false, false)?.sum)
    }

    /// Minimum value and its tie count.
    ///
    /// Without `force`, a stale minimum is returned as tracked (with a count of
    /// zero); with `force` it is recomputed first.
    pub fn get_min(&self, force: bool) -> Result<Option<(V, u64)>> {
        Ok(self
            .aggregate(force, false)?
            .min
            .map(|extreme| (extreme.value, extreme.count)))
    }

    /// Maximum value and its tie count. See [`Statistics::get_min`].
    pub fn get_max(&self, force: bool) -> Result<Option<(V, u64)>> {
        Ok(self
            .aggregate(false, force)?
            .max
            .map(|extreme| (extreme.value, extreme.count)))
    }

    /// Mean rounded half-even to `precision` fractional digits.
    pub fn get_arithmetic_mean(&self, precision: u32) -> Result<Decimal> {
        let aggregate = self.aggregate(false, false)?;
        if aggregate.n == 0 {
            return Err(StatisticsError::EmptyPopulation.into());
        }
        let mean = aggregate.sum / BigRational::from_integer(aggregate.n.into());
        Ok(Decimal::from_rational(&mean, precision))
    }

    /// Sample standard deviation rounded half-even to `precision` digits.
    ///
    /// Two passes: the exact mean comes from the aggregate, then a fresh scan
    /// sums squared deviations chunk by chunk.
    pub fn get_standard_deviation(&self, precision: u32) -> Result<Decimal> {
        let aggregate = self.aggregate(false, false)?;
        if aggregate.n <= 1 {
            return Ok(Decimal::zero(precision));
        }
        let mean = aggregate.sum / BigRational::from_integer(aggregate.n.into());
        let mut squared_deviations = BigRational::zero();
        self.grid.for_each_histogram(|histogram| {
            squared_deviations += histogram.sum_squared_deviations(&mean);
        })?;
        Ok(standard_deviation(aggregate.n, &squared_deviations, precision))
    }

    /// Partition the non-zero values into `n_classes` classes of roughly equal
    /// population.
    pub fn get_quantile_classes(&self, n_classes: usize) -> Result<QuantileClasses<V>> {
        if n_classes == 0 {
            return Err(StatisticsError::NoClasses.into());
        }
        let mut merged = ValueHistogram::new();
        self.grid.for_each_histogram(|histogram| {
            merged.merge(&histogram.without_zeros());
        })?;
        Ok(merged.quantile_classes(n_classes)?)
    }
}
