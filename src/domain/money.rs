//! Fixed-point USD amounts at micro-dollar precision.
//!
//! Monetary fields throughout the data model (`spec.md` §3) are specified
//! as "fixed-point decimal with micro-dollar precision" rather than
//! floating point, so budget sums never drift across repeated ledger
//! additions.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

/// A USD amount stored as integer micro-dollars (1 USD = 1_000_000 micros).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Usd(i64);

impl Usd {
    pub const ZERO: Usd = Usd(0);

    #[must_use]
    pub fn from_dollars(dollars: f64) -> Self {
        Usd((dollars * 1_000_000.0).round() as i64)
    }

    #[must_use]
    pub fn micros(micros: i64) -> Self {
        Usd(micros)
    }

    #[must_use]
    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    #[must_use]
    pub fn as_micros(self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn checked_sub(self, other: Usd) -> Option<Usd> {
        self.0.checked_sub(other.0).map(Usd)
    }

    /// `self <= limit * tolerance`, used for the project overspend check.
    #[must_use]
    pub fn within_tolerance(self, limit: Usd, tolerance: f64) -> bool {
        (self.0 as f64) <= (limit.0 as f64) * tolerance
    }
}

impl Add for Usd {
    type Output = Usd;
    fn add(self, rhs: Usd) -> Usd {
        Usd(self.0 + rhs.0)
    }
}

impl AddAssign for Usd {
    fn add_assign(&mut self, rhs: Usd) {
        self.0 += rhs.0;
    }
}

impl Sub for Usd {
    type Output = Usd;
    fn sub(self, rhs: Usd) -> Usd {
        Usd(self.0 - rhs.0)
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.as_dollars())
    }
}

impl std::iter::Sum for Usd {
    fn sum<I: Iterator<Item = Usd>>(iter: I) -> Usd {
        iter.fold(Usd::ZERO, Add::add)
    }
}

impl From<Usd> for String {
    fn from(value: Usd) -> Self {
        value.0.to_string()
    }
}

impl TryFrom<String> for Usd {
    type Error = std::num::ParseIntError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse::<i64>().map(Usd)
    }
}
