use std::fmt;

use serde::{Deserialize, Serialize};

/// Whole number of crystals. Balances and stakes are never fractional and never negative.
///
/// Checked arithmetic refuses to go above [`Crystals::MAX`], which keeps every
/// balance representable as a signed ledger delta.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Crystals(u64);

impl Crystals {
    pub const ZERO: Crystals = Crystals(0);
    pub const MAX: Crystals = Crystals(i64::MAX as u64);

    pub const fn new(value: u64) -> Self {
        Crystals(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Signed view used for ledger deltas and profit sums. Exact for every
    /// value up to [`Crystals::MAX`].
    pub fn signed(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    /// Payout for a winning stake.
    pub fn doubled(self) -> Option<Self> {
        self.checked_add(self)
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0
            .checked_add(rhs.0)
            .filter(|sum| *sum <= Self::MAX.0)
            .map(Crystals)
    }

    /// For reporting totals across accounts, which may exceed any one balance.
    pub fn saturating_add(self, rhs: Self) -> Self {
        self.checked_add(rhs).unwrap_or(Self::MAX)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Crystals)
    }
}

impl From<u64> for Crystals {
    fn from(value: u64) -> Self {
        Crystals(value)
    }
}

impl fmt::Display for Crystals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
