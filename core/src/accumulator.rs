//! Per-child aggregates kept by branch nodes.
//!
//! Every branch entry summarizes its child as `[count, sum]`: the number of leaf elements
//! below the child and the sum of the leaf's indexed column. Mutations produce an
//! accumulator *delta* which is added to each ancestor's entry on the way to the root.

use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// The number of columns in an accumulator.
pub const ACCUMULATOR_WIDTH: usize = 2;

/// Column holding the element count.
pub const COUNT: usize = 0;
/// Column holding the sum of the indexed leaf column.
pub const SUM: usize = 1;

/// A fixed-width tuple of signed aggregates.
///
/// Absolute totals are never negative. Deltas may be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Accumulator([i64; ACCUMULATOR_WIDTH]);

impl Accumulator {
    /// The all-zero accumulator.
    pub const ZERO: Accumulator = Accumulator([0; ACCUMULATOR_WIDTH]);

    pub fn new(count: i64, sum: i64) -> Self {
        Accumulator([count, sum])
    }

    /// Build an accumulator from absolute, unsigned totals.
    ///
    /// Totals must not exceed `i64::MAX`. Callers keep the values they aggregate within that
    /// range.
    pub fn from_totals(totals: [u64; ACCUMULATOR_WIDTH]) -> Self {
        let mut acc = Self::ZERO;
        for (dst, src) in acc.0.iter_mut().zip(totals) {
            debug_assert!(src <= i64::MAX as u64, "total {src} out of accumulator range");
            *dst = src as i64;
        }
        acc
    }

    pub fn count(&self) -> i64 {
        self.0[COUNT]
    }

    pub fn sum(&self) -> i64 {
        self.0[SUM]
    }

    pub fn get(&self, column: usize) -> i64 {
        self.0[column]
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0)
    }

    /// Apply this delta to a row of absolute totals.
    ///
    /// Returns `None` if any column would leave the `u64` range, which means the delta does
    /// not belong to these totals.
    pub fn apply(&self, totals: [u64; ACCUMULATOR_WIDTH]) -> Option<[u64; ACCUMULATOR_WIDTH]> {
        let mut out = [0u64; ACCUMULATOR_WIDTH];
        for i in 0..ACCUMULATOR_WIDTH {
            out[i] = totals[i].checked_add_signed(self.0[i])?;
        }
        Some(out)
    }

    /// Convert to absolute totals. `None` if any column is negative.
    pub fn to_totals(&self) -> Option<[u64; ACCUMULATOR_WIDTH]> {
        self.apply([0; ACCUMULATOR_WIDTH])
    }
}

impl Add for Accumulator {
    type Output = Accumulator;

    fn add(mut self, rhs: Accumulator) -> Accumulator {
        self += rhs;
        self
    }
}

impl AddAssign for Accumulator {
    fn add_assign(&mut self, rhs: Accumulator) {
        for (a, b) in self.0.iter_mut().zip(rhs.0) {
            *a += b;
        }
    }
}

impl Sub for Accumulator {
    type Output = Accumulator;

    fn sub(mut self, rhs: Accumulator) -> Accumulator {
        self -= rhs;
        self
    }
}

impl SubAssign for Accumulator {
    fn sub_assign(&mut self, rhs: Accumulator) {
        for (a, b) in self.0.iter_mut().zip(rhs.0) {
            *a -= b;
        }
    }
}

impl Neg for Accumulator {
    type Output = Accumulator;

    fn neg(self) -> Accumulator {
        Self::ZERO - self
    }
}

impl std::iter::Sum for Accumulator {
    fn sum<I: Iterator<Item = Accumulator>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |a, b| a + b)
    }
}
