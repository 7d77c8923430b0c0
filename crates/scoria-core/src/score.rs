//! # Score Types
//!
//! The score abstraction the evaluation network maintains incrementally.
//!
//! A score is an ordered, additive value; the network only ever adds a
//! contribution when a constraint matches and subtracts the exact same
//! contribution when the match retracts. All arithmetic is saturating
//! integer arithmetic.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::fmt::{self, Debug, Display};
use std::ops::{Add, Sub};

// =============================================================================
// SCORE TRAIT
// =============================================================================

/// The contract every score type fulfills.
///
/// Scoring nodes compute `constraint_weight.scale(match_weight)` per
/// matching tuple and fold the results with `+`/`-`. Implementations must
/// make subtraction the exact inverse of addition (short of i64
/// saturation) so that insert/retract round-trips restore the score
/// bit-for-bit.
pub trait Score:
    Copy
    + Clone
    + Debug
    + Display
    + Default
    + PartialEq
    + Eq
    + PartialOrd
    + Ord
    + Add<Output = Self>
    + Sub<Output = Self>
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// The neutral score. Equal to `Self::default()`.
    #[must_use]
    fn zero() -> Self {
        Self::default()
    }

    /// Multiply every level of this score by an integer match weight.
    #[must_use]
    fn scale(self, multiplier: i64) -> Self;

    /// Whether a solution with this score is feasible (no hard violations).
    #[must_use]
    fn feasible(&self) -> bool;
}

// =============================================================================
// SIMPLE SCORE
// =============================================================================

/// A single-level score. Higher is better; constraints typically penalize
/// into the negatives.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SimpleScore(pub i64);

impl SimpleScore {
    /// Create a score with the given value.
    #[must_use]
    pub const fn of(value: i64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl Add for SimpleScore {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for SimpleScore {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Display for SimpleScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Score for SimpleScore {
    fn scale(self, multiplier: i64) -> Self {
        Self(self.0.saturating_mul(multiplier))
    }

    fn feasible(&self) -> bool {
        true
    }
}

// =============================================================================
// HARD/SOFT SCORE
// =============================================================================

/// A two-level score: the hard level dominates the soft level entirely.
///
/// A solution is feasible when its hard level is non-negative; soft score
/// only ranks solutions that are equally feasible. The derived `Ord`
/// compares hard first, then soft, which is exactly the required
/// dominance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct HardSoftScore {
    /// The hard-constraint level. Negative means infeasible.
    pub hard: i64,
    /// The soft-constraint level. Tie-breaks equally-hard solutions.
    pub soft: i64,
}

impl HardSoftScore {
    /// Create a score with both levels.
    #[must_use]
    pub const fn of(hard: i64, soft: i64) -> Self {
        Self { hard, soft }
    }

    /// Create a hard-only score.
    #[must_use]
    pub const fn of_hard(hard: i64) -> Self {
        Self { hard, soft: 0 }
    }

    /// Create a soft-only score.
    #[must_use]
    pub const fn of_soft(soft: i64) -> Self {
        Self { hard: 0, soft }
    }
}

impl Add for HardSoftScore {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            hard: self.hard.saturating_add(rhs.hard),
            soft: self.soft.saturating_add(rhs.soft),
        }
    }
}

impl Sub for HardSoftScore {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            hard: self.hard.saturating_sub(rhs.hard),
            soft: self.soft.saturating_sub(rhs.soft),
        }
    }
}

impl Display for HardSoftScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}hard/{}soft", self.hard, self.soft)
    }
}

impl Score for HardSoftScore {
    fn scale(self, multiplier: i64) -> Self {
        Self {
            hard: self.hard.saturating_mul(multiplier),
            soft: self.soft.saturating_mul(multiplier),
        }
    }

    fn feasible(&self) -> bool {
        self.hard >= 0
    }
}

// =============================================================================
// TESTS
// =============================================================================
