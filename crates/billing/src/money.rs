//! Money amounts in the minor units of the configured currency

use serde::{Deserialize, Serialize};

/// Minor units per major unit (e.g. paisa per rupee, cents per dollar)
pub const MINOR_UNITS_PER_MAJOR: i64 = 100;

/// Default minimum chargeable amount, in minor units
pub const DEFAULT_MINIMUM_CHARGE_MINOR: i64 = 100;

/// An amount of money, stored as integer minor units.
///
/// Plans and payment records are priced in major units by humans; `from_major`
/// is the single place that converts them. Gateways receive `minor_units()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_major(major: i64) -> Self {
        Self(major.saturating_mul(MINOR_UNITS_PER_MAJOR))
    }

    pub fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub fn minor_units(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Difference clamped at zero
    pub fn saturating_sub(self, other: Money) -> Money {
        Money((self.0 - other.0).max(0))
    }

    /// True when a positive amount is too small for the gateway to accept
    pub fn is_below_minimum(self, minimum: Money) -> bool {
        self.is_positive() && self < minimum
    }
}

impl std::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let per = MINOR_UNITS_PER_MAJOR as u64;
        write!(f, "{}{}.{:02}", sign, abs / per, abs % per)
    }
}
