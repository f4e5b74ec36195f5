#![forbid(unsafe_code)]

use gridstore_model::GridValue;
use serde::{Deserialize, Serialize};

use crate::histogram::ValueHistogram;

/// Every cell holds the same value; nothing is stored per cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SingletChunk<V: GridValue> {
    value: V,
}

impl<V: GridValue> SingletChunk<V> {
    pub fn new(value: V) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    /// Whether writing `value` can be absorbed without changing encoding.
    pub fn accepts(&self, value: &V) -> bool {
        self.value.same_value(value)
    }

    pub fn histogram(&self, cells: usize, no_data: &V) -> ValueHistogram<V> {
        let mut histogram = ValueHistogram::new();
        histogram.add(&self.value, cells as u64, no_data);
        histogram
    }

    pub fn estimated_bytes(&self) -> usize {
        std::mem::size_of::<V>() + self.value.heap_bytes()
    }
}
