use std::fmt;
use std::str::FromStr;

use num_bigint::{BigInt, Sign};
use num_integer::Integer;
use num_rational::BigRational;
use num_traits::{Signed, Zero};
use thiserror::Error;

/// A fixed-scale decimal: `unscaled / 10^scale`.
///
/// Statistics that divide (means, deviations) are reported as decimals rounded
/// half-even to a caller-chosen number of fractional digits.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Decimal {
    unscaled: BigInt,
    scale: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid decimal literal: {0:?}")]
pub struct DecimalParseError(String);

fn pow10(exp: u32) -> BigInt {
    BigInt::from(10u32).pow(exp)
}

/// Round `numer / denom` (with `denom > 0`) to the nearest integer, ties to even.
fn round_half_even(numer: &BigInt, denom: &BigInt) -> BigInt {
    let (quot, rem) = numer.div_mod_floor(denom);
    let twice = &rem * 2u32;
    match twice.cmp(denom) {
        std::cmp::Ordering::Less => quot,
        std::cmp::Ordering::Greater => quot + 1u32,
        std::cmp::Ordering::Equal => {
            if quot.is_even() {
                quot
            } else {
                quot + 1u32
            }
        }
    }
}

impl Decimal {
    pub fn new(unscaled: BigInt, scale: u32) -> Self {
        Self { unscaled, scale }
    }

    pub fn zero(scale: u32) -> Self {
        Self::new(BigInt::zero(), scale)
    }

    pub fn unscaled(&self) -> &BigInt {
        &self.unscaled
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Round an exact rational to `scale` fractional digits, ties to even.
    pub fn from_rational(value: &BigRational, scale: u32) -> Self {
        let numer = value.numer() * pow10(scale);
        // `Ratio` keeps its denominator positive.
        let unscaled = round_half_even(&numer, value.denom());
        Self { unscaled, scale }
    }

    /// Square root of a non-negative rational, rounded half-even to `scale`
    /// fractional digits. Returns `None` for negative input.
    pub fn sqrt_rational(value: &BigRational, scale: u32) -> Option<Self> {
        if value.is_negative() {
            return None;
        }
        // x = value * 10^(2*scale); the result is round(sqrt(x)).
        let numer = value.numer() * pow10(scale.saturating_mul(2));
        let denom = value.denom();
        // floor(sqrt(x)) == isqrt(floor(x)).
        let root = numer.div_floor(denom).sqrt();
        // Compare sqrt(x) against root + 1/2, i.e. 4*numer against (2*root + 1)^2 * denom.
        let lhs = &numer * 4u32;
        let midpoint = &root * 2u32 + 1u32;
        let rhs = &midpoint * &midpoint * denom;
        let unscaled = match lhs.cmp(&rhs) {
            std::cmp::Ordering::Less => root,
            std::cmp::Ordering::Greater => root + 1u32,
            std::cmp::Ordering::Equal => {
                if root.is_even() {
                    root
                } else {
                    root + 1u32
                }
            }
        };
        Some(Self { unscaled, scale })
    }

    pub fn to_rational(&self) -> BigRational {
        BigRational::new(self.unscaled.clone(), pow10(self.scale))
    }

    /// Nearest `f64` (via the decimal string, which is exact up to parsing).
    pub fn to_f64(&self) -> f64 {
        self.to_string().parse().unwrap_or(f64::NAN)
    }

    /// Change the scale, rounding half-even when digits are dropped.
    pub fn with_scale(&self, scale: u32) -> Self {
        Self::from_rational(&self.to_rational(), scale)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.unscaled.abs().to_string();
        if self.unscaled.sign() == Sign::Minus {
            f.write_str("-")?;
        }
        let scale = self.scale as usize;
        if scale == 0 {
            return f.write_str(&digits);
        }
        if digits.len() > scale {
            let (int, frac) = digits.split_at(digits.len() - scale);
            write!(f, "{int}.{frac}")
        } else {
            write!(f, "0.{}{digits}", "0".repeat(scale - digits.len()))
        }
    }
}

impl FromStr for Decimal {
    type Err = DecimalParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || DecimalParseError(s.to_string());
        let trimmed = s.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (int, frac) = body.split_once('.').unwrap_or((body, ""));
        if int.is_empty() && frac.is_empty() {
            return Err(err());
        }
        if !int.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
            return Err(err());
        }
        let mut unscaled: BigInt = format!("0{int}{frac}").parse().map_err(|_| err())?;
        if negative {
            unscaled = -unscaled;
        }
        let scale = u32::try_from(frac.len()).map_err(|_| err())?;
        Ok(Self { unscaled, scale })
    }
}

impl From<i64> for Decimal {
    fn from(value: i64) -> Self {
        Self::new(BigInt::from(value), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ratio(n: i64, d: i64) -> BigRational {
        BigRational::new(n.into(), d.into())
    }

    #[test]
    fn rounds_half_even() {
        assert_eq!(Decimal::from_rational(&ratio(5, 2), 0).to_string(), "2");
        assert_eq!(Decimal::from_rational(&ratio(7, 2), 0).to_string(), "4");
        assert_eq!(Decimal::from_rational(&ratio(-5, 2), 0).to_string(), "-2");
        assert_eq!(Decimal::from_rational(&ratio(1, 8), 2).to_string(), "0.12");
        assert_eq!(Decimal::from_rational(&ratio(3, 8), 2).to_string(), "0.38");
        assert_eq!(Decimal::from_rational(&ratio(10, 3), 4).to_string(), "3.3333");
    }

    #[test]
    fn formats_small_and_negative_values() {
        assert_eq!(Decimal::new(BigInt::from(5), 3).to_string(), "0.005");
        assert_eq!(Decimal::new(BigInt::from(-1234), 2).to_string(), "-12.34");
        assert_eq!(Decimal::zero(2).to_string(), "0.00");
    }

    #[test]
    fn sqrt_is_exact_and_rounded() {
        assert_eq!(Decimal::sqrt_rational(&ratio(4, 1), 3).unwrap().to_string(), "2.000");
        assert_eq!(Decimal::sqrt_rational(&ratio(2, 1), 5).unwrap().to_string(), "1.41421");
        assert_eq!(Decimal::sqrt_rational(&ratio(1, 4), 1).unwrap().to_string(), "0.5");
        // sqrt(0.0225) = 0.15 exactly; at one digit the tie goes to even.
        assert_eq!(Decimal::sqrt_rational(&ratio(225, 10000), 1).unwrap().to_string(), "0.2");
        assert!(Decimal::sqrt_rational(&ratio(-1, 1), 2).is_none());
    }

    #[test]
    fn parses_literals() {
        let value: Decimal = "-12.340".parse().unwrap();
        assert_eq!(value, Decimal::new(BigInt::from(-12340), 3));
        assert_eq!(".5".parse::<Decimal>().unwrap().to_string(), "0.5");
        assert!("1.2.3".parse::<Decimal>().is_err());
        assert!("".parse::<Decimal>().is_err());
        assert_eq!(value.to_f64(), -12.34);
    }

    #[test]
    fn rescaling_rounds() {
        let value: Decimal = "2.345".parse().unwrap();
        assert_eq!(value.with_scale(2).to_string(), "2.34");
        assert_eq!(value.to_rational(), ratio(469, 200));
    }
}
