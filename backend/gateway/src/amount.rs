use std::{fmt, iter::Sum};

use serde::{Deserialize, Serialize};

/// Minor units (paise, cents) in one major unit.
pub const MINOR_UNITS_PER_MAJOR: u64 = 100;

/// Money in integer minor units.
///
/// Floating point only appears at the edge, in [`Amount::from_major`]. Values stay within
/// `i64`, the range of Redis integer counters.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const MAX: Amount = Amount(i64::MAX as u64);

    pub const fn from_minor(minor: u64) -> Self {
        Self(minor)
    }

    /// Converts a caller supplied major unit value, rounding to the nearest minor unit.
    ///
    /// Returns `None` for non-finite, non-positive, sub-minor-unit or above [`Amount::MAX`]
    /// values.
    pub fn from_major(major: f64) -> Option<Self> {
        if !major.is_finite() || major <= 0.0 {
            return None;
        }

        let minor = (major * MINOR_UNITS_PER_MAJOR as f64).round();
        if minor < 1.0 || minor >= Self::MAX.0 as f64 {
            return None;
        }

        Some(Self(minor as u64))
    }

    pub const fn minor(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// `None` past [`Amount::MAX`].
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0
            .checked_add(other.0)
            .filter(|sum| *sum <= Self::MAX.0)
            .map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:02}",
            self.0 / MINOR_UNITS_PER_MAJOR,
            self.0 % MINOR_UNITS_PER_MAJOR
        )
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        Amount(iter.map(|amount| amount.0).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::Amount;

    #[test]
    fn test_from_major_rounds_to_minor() {
        assert_eq!(Amount::from_major(25.0), Some(Amount::from_minor(2500)));
        assert_eq!(Amount::from_major(19.99), Some(Amount::from_minor(1999)));
        assert_eq!(Amount::from_major(10.004), Some(Amount::from_minor(1000)));
    }

    #[test]
    fn test_from_major_rejects_invalid() {
        assert_eq!(Amount::from_major(0.0), None);
        assert_eq!(Amount::from_major(-5.0), None);
        assert_eq!(Amount::from_major(0.001), None);
        assert_eq!(Amount::from_major(f64::NAN), None);
        assert_eq!(Amount::from_major(f64::INFINITY), None);
    }

    #[test]
    fn test_from_major_stays_within_i64() {
        assert_eq!(Amount::from_major(1e17), None);
        assert_eq!(Amount::from_major(u64::MAX as f64), None);

        let large = Amount::from_major(9e16).unwrap();
        assert_eq!(large.minor(), 9_000_000_000_000_000_000);
        assert!(large <= Amount::MAX);
    }

    #[test]
    fn test_display() {
        assert_eq!(Amount::from_minor(2500).to_string(), "25.00");
        assert_eq!(Amount::from_minor(7).to_string(), "0.07");
    }

    #[test]
    fn test_sum_and_checked_add() {
        let total: Amount = [2500, 1000, 1].into_iter().map(Amount::from_minor).sum();
        assert_eq!(total, Amount::from_minor(3501));

        assert_eq!(Amount::from_minor(u64::MAX).checked_add(Amount::from_minor(1)), None);
        assert_eq!(Amount::MAX.checked_add(Amount::from_minor(1)), None);
        assert_eq!(
            Amount::MAX.checked_add(Amount::ZERO),
            Some(Amount::from_minor(i64::MAX as u64))
        );
    }
}
