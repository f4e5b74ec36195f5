#![forbid(unsafe_code)]

use gridstore_model::{AllocationFailure, GridValue};
use serde::{Deserialize, Serialize};

use crate::histogram::ValueHistogram;

/// One slot per cell, row-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct DenseChunk<V: GridValue> {
    values: Vec<V>,
}

impl<V: GridValue> DenseChunk<V> {
    /// Allocate `cells` slots holding `fill`.
    ///
    /// The buffer is reserved with `try_reserve_exact`, so exhausting memory
    /// surfaces as an [`AllocationFailure`] the caller can recover from.
    pub fn filled(cells: usize, fill: &V) -> Result<Self, AllocationFailure> {
        let mut values = Vec::new();
        values
            .try_reserve_exact(cells)
            .map_err(|_| AllocationFailure::new(cells.saturating_mul(std::mem::size_of::<V>())))?;
        values.resize(cells, fill.clone());
        Ok(Self { values })
    }

    pub fn from_values(values: Vec<V>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[V] {
        &self.values
    }

    pub fn into_values(self) -> Vec<V> {
        self.values
    }

    #[inline]
    pub fn get(&self, offset: usize) -> &V {
        &self.values[offset]
    }

    /// Replace the value at `offset`, returning the previous value.
    #[inline]
    pub fn set(&mut self, offset: usize, value: V) -> V {
        std::mem::replace(&mut self.values[offset], value)
    }

    pub fn histogram(&self, no_data: &V) -> ValueHistogram<V> {
        let mut histogram = ValueHistogram::new();
        for value in &self.values {
            histogram.add(value, 1, no_data);
        }
        histogram
    }

    pub fn estimated_bytes(&self) -> usize {
        let slots = self.values.capacity() * std::mem::size_of::<V>();
        if V::HAS_HEAP {
            slots + self.values.iter().map(GridValue::heap_bytes).sum::<usize>()
        } else {
            slots
        }
    }
}
