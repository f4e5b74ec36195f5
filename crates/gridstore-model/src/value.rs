use std::fmt;
use std::hash::Hash;

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::Zero;
use ordered_float::OrderedFloat;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Element type stored in a grid.
///
/// Grids are generic over one element type; the no-data sentinel is chosen per
/// grid. Values are compared through [`GridValue::Key`], which carries a total
/// order and a hash so it can key the sparse encoding's value buckets and the
/// statistics histograms.
pub trait GridValue:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Totally ordered, hashable view of a value.
    type Key: Ord
        + Hash
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    fn to_key(&self) -> Self::Key;

    fn from_key(key: &Self::Key) -> Self;

    /// Exact rational value, used for sums, means and deviations.
    fn to_exact(&self) -> BigRational;

    fn is_zero(&self) -> bool;

    /// Whether the value may be written into a grid (e.g. finite floats only).
    fn is_storable(&self) -> bool {
        true
    }

    /// Whether values own heap memory, i.e. whether [`GridValue::heap_bytes`]
    /// can be non-zero. Lets memory estimates skip per-cell scans.
    const HAS_HEAP: bool = false;

    /// Heap bytes owned by the value, on top of `size_of::<Self>()`.
    fn heap_bytes(&self) -> usize {
        0
    }

    #[inline]
    fn same_value(&self, other: &Self) -> bool {
        self.to_key() == other.to_key()
    }
}

macro_rules! impl_integer_value {
    ($($ty:ty),*) => {
        $(
            impl GridValue for $ty {
                type Key = $ty;

                #[inline]
                fn to_key(&self) -> Self::Key {
                    *self
                }

                #[inline]
                fn from_key(key: &Self::Key) -> Self {
                    *key
                }

                fn to_exact(&self) -> BigRational {
                    BigRational::from_integer(BigInt::from(*self))
                }

                #[inline]
                fn is_zero(&self) -> bool {
                    *self == 0
                }

                #[inline]
                fn same_value(&self, other: &Self) -> bool {
                    self == other
                }
            }
        )*
    };
}

impl_integer_value!(i16, i32, i64);

impl GridValue for f64 {
    type Key = OrderedFloat<f64>;

    #[inline]
    fn to_key(&self) -> Self::Key {
        OrderedFloat(*self)
    }

    #[inline]
    fn from_key(key: &Self::Key) -> Self {
        key.0
    }

    fn to_exact(&self) -> BigRational {
        // Non-finite values never reach the statistics engine (see `is_storable`),
        // except as a no-data sentinel, which is excluded before summing.
        BigRational::from_float(*self).unwrap_or_else(BigRational::zero)
    }

    #[inline]
    fn is_zero(&self) -> bool {
        *self == 0.0
    }

    fn is_storable(&self) -> bool {
        self.is_finite()
    }
}

impl GridValue for BigRational {
    type Key = BigRational;

    const HAS_HEAP: bool = true;

    fn to_key(&self) -> Self::Key {
        self.clone()
    }

    fn from_key(key: &Self::Key) -> Self {
        key.clone()
    }

    fn to_exact(&self) -> BigRational {
        self.clone()
    }

    fn is_zero(&self) -> bool {
        Zero::is_zero(self)
    }

    fn heap_bytes(&self) -> usize {
        let bits = self.numer().bits() + self.denom().bits();
        usize::try_from(bits.div_ceil(8)).unwrap_or(usize::MAX)
    }

    #[inline]
    fn same_value(&self, other: &Self) -> bool {
        self == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_keys_order_totally() {
        let mut keys = vec![3.5f64.to_key(), (-1.0f64).to_key(), 0.0f64.to_key()];
        keys.sort();
        assert_eq!(
            keys.iter().map(f64::from_key).collect::<Vec<_>>(),
            vec![-1.0, 0.0, 3.5]
        );
    }

    #[test]
    fn float_exact_is_lossless() {
        let exact = 0.1f64.to_exact();
        // 0.1 is not representable; the exact value is the nearest binary fraction.
        assert_ne!(exact, BigRational::new(1.into(), 10.into()));
        assert_eq!(exact, BigRational::from_float(0.1f64).unwrap());
        assert_eq!(2.5f64.to_exact(), BigRational::new(5.into(), 2.into()));
    }

    #[test]
    fn non_finite_floats_are_not_storable() {
        assert!(!f64::NAN.is_storable());
        assert!(!f64::INFINITY.is_storable());
        assert!((-9999.0f64).is_storable());
    }

    #[test]
    fn rational_values_round_trip_through_keys() {
        let value = BigRational::new(7.into(), 3.into());
        assert!(value.same_value(&BigRational::from_key(&value.to_key())));
        assert!(value.heap_bytes() > 0);
    }
}
