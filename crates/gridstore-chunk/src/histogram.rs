#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use gridstore_model::{BigRational, Decimal, GridValue, StatisticsError};
use num_traits::Zero;

/// Value → cardinality summary of a chunk (or of several merged chunks).
///
/// No-data cells are counted separately and never appear as a key. A key with
/// zero cardinality is never present.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueHistogram<V: GridValue> {
    counts: BTreeMap<V::Key, u64>,
    no_data: u64,
}

impl<V: GridValue> Default for ValueHistogram<V> {
    fn default() -> Self {
        Self {
            counts: BTreeMap::new(),
            no_data: 0,
        }
    }
}

impl<V: GridValue> ValueHistogram<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `count` cells holding `value`.
    pub fn add(&mut self, value: &V, count: u64, no_data: &V) {
        if count == 0 {
            return;
        }
        if value.same_value(no_data) {
            self.no_data += count;
        } else {
            self.add_key(value.to_key(), count);
        }
    }

    pub(crate) fn add_key(&mut self, key: V::Key, count: u64) {
        if count > 0 {
            *self.counts.entry(key).or_insert(0) += count;
        }
    }

    pub(crate) fn add_no_data(&mut self, count: u64) {
        self.no_data += count;
    }

    pub fn merge(&mut self, other: &ValueHistogram<V>) {
        for (key, count) in &other.counts {
            self.add_key(key.clone(), *count);
        }
        self.no_data += other.no_data;
    }

    /// Drop zero-valued keys (quantile classes ignore zeros).
    pub fn without_zeros(mut self) -> Self {
        self.counts.retain(|key, _| !V::from_key(key).is_zero());
        self
    }

    /// Number of non-no-data cells.
    pub fn n(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn no_data_count(&self) -> u64 {
        self.no_data
    }

    pub fn distinct(&self) -> usize {
        self.counts.len()
    }

    pub fn count_of(&self, value: &V) -> u64 {
        self.counts.get(&value.to_key()).copied().unwrap_or(0)
    }

    /// `(value, count)` pairs ascending by value.
    pub fn iter(&self) -> impl Iterator<Item = (V, u64)> + '_ {
        self.counts.iter().map(|(key, count)| (V::from_key(key), *count))
    }

    pub fn sum(&self) -> BigRational {
        self.counts
            .iter()
            .fold(BigRational::zero(), |acc, (key, count)| {
                acc + V::from_key(key).to_exact() * BigRational::from_integer((*count).into())
            })
    }

    /// Smallest value and the number of cells holding it.
    pub fn min(&self) -> Option<(V, u64)> {
        self.counts
            .iter()
            .next()
            .map(|(key, count)| (V::from_key(key), *count))
    }

    /// Largest value and the number of cells holding it.
    pub fn max(&self) -> Option<(V, u64)> {
        self.counts
            .iter()
            .next_back()
            .map(|(key, count)| (V::from_key(key), *count))
    }

    /// Most frequent value; ties resolve to the smallest value.
    pub fn mode(&self) -> Option<V> {
        let mut best: Option<(&V::Key, u64)> = None;
        for (key, &count) in &self.counts {
            if best.map_or(true, |(_, best_count)| count > best_count) {
                best = Some((key, count));
            }
        }
        best.map(|(key, _)| V::from_key(key))
    }

    /// Value at 0-based rank `rank` in ascending order.
    fn value_at_rank(&self, rank: u64) -> Option<&V::Key> {
        let mut seen = 0u64;
        for (key, &count) in &self.counts {
            seen += count;
            if rank < seen {
                return Some(key);
            }
        }
        None
    }

    /// Exact median. With an even population this is the mean of the two middle values.
    pub fn median(&self) -> Option<BigRational> {
        let n = self.n();
        if n == 0 {
            return None;
        }
        let upper = V::from_key(self.value_at_rank(n / 2)?).to_exact();
        if n % 2 == 1 {
            return Some(upper);
        }
        let lower = V::from_key(self.value_at_rank(n / 2 - 1)?).to_exact();
        Some((lower + upper) / BigRational::from_integer(2.into()))
    }

    /// Exact arithmetic mean.
    pub fn mean(&self) -> Result<BigRational, StatisticsError> {
        let n = self.n();
        if n == 0 {
            return Err(StatisticsError::EmptyPopulation);
        }
        Ok(self.sum() / BigRational::from_integer(n.into()))
    }

    /// Σ count · (value − mean)², exact.
    pub fn sum_squared_deviations(&self, mean: &BigRational) -> BigRational {
        self.counts
            .iter()
            .fold(BigRational::zero(), |acc, (key, count)| {
                let deviation = V::from_key(key).to_exact() - mean;
                acc + &deviation * &deviation * BigRational::from_integer((*count).into())
            })
    }

    /// Sample standard deviation of this histogram alone.
    pub fn standard_deviation(&self, precision: u32) -> Decimal {
        match self.mean() {
            Ok(mean) => {
                standard_deviation(self.n(), &self.sum_squared_deviations(&mean), precision)
            }
            Err(_) => Decimal::zero(precision),
        }
    }

    /// Partition the recorded values into `n_classes` classes of roughly equal
    /// population. See [`QuantileClasses`].
    pub fn quantile_classes(
        &self,
        n_classes: usize,
    ) -> Result<QuantileClasses<V>, StatisticsError> {
        QuantileClasses::from_histogram(self, n_classes)
    }
}

/// Standard deviation from a population size and an exact sum of squared
/// deviations: `sqrt(ss / (n - 1))` when `n > 1`, otherwise zero.
pub fn standard_deviation(n: u64, sum_squared_deviations: &BigRational, precision: u32) -> Decimal {
    if n <= 1 {
        return Decimal::zero(precision);
    }
    let variance = sum_squared_deviations / BigRational::from_integer((n - 1).into());
    Decimal::sqrt_rational(&variance, precision).unwrap_or_else(|| Decimal::zero(precision))
}

/// One quantile class: an inclusive value range and its population.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantileClass<V> {
    pub min: V,
    pub max: V,
    pub count: u64,
}

/// Values partitioned into ascending, non-overlapping classes of roughly equal
/// population.
///
/// Values are assigned in ascending order. Each class targets
/// `ceil(remaining / classes_left)` cells; once a class reaches its target the
/// surplus spills into the next class up. All cells sharing a value land in the
/// same class, so a heavily repeated value can overfill its class and leave
/// fewer (possibly zero) classes above it.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantileClasses<V> {
    classes: Vec<QuantileClass<V>>,
}

impl<V: GridValue> QuantileClasses<V> {
    fn from_histogram(
        histogram: &ValueHistogram<V>,
        n_classes: usize,
    ) -> Result<Self, StatisticsError> {
        if n_classes == 0 {
            return Err(StatisticsError::NoClasses);
        }
        let mut remaining = histogram.n();
        let mut classes: Vec<QuantileClass<V>> = Vec::with_capacity(n_classes);
        let mut current: Option<QuantileClass<V>> = None;
        let mut target = 0u64;

        for (value, count) in histogram.iter() {
            if current.is_none() {
                let classes_left = (n_classes - classes.len()).max(1) as u64;
                target = remaining.div_ceil(classes_left);
                current = Some(QuantileClass {
                    min: value.clone(),
                    max: value.clone(),
                    count: 0,
                });
            }
            let Some(class) = current.as_mut() else {
                continue;
            };
            class.max = value;
            class.count += count;
            remaining -= count;
            let last_class = classes.len() + 1 == n_classes;
            if class.count >= target && !last_class {
                classes.extend(current.take());
            }
        }
        classes.extend(current);
        Ok(Self { classes })
    }

    pub fn classes(&self) -> &[QuantileClass<V>] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Index of the class whose range contains `value`.
    pub fn class_of(&self, value: &V) -> Option<usize> {
        let key = value.to_key();
        self.classes
            .iter()
            .position(|class| class.min.to_key() <= key && key <= class.max.to_key())
    }
}
