//! # Joiner Module
//!
//! Structural join conditions for join-bridge and exists-bridge pairs.
//!
//! A single `Joiner` is a comparison kind plus a left and a right key
//! mapping. A `CompositeJoiner` is a flattened conjunction of single
//! joiners; composing zero joiners is rejected at build time. The equality
//! joiners of a composite form the exact-lookup part of the shared join
//! index; the ordering joiners are checked per candidate.

use crate::tuple::{TupleKeyFn, TupleView};
use crate::{Key, PlanningFact, ScoriaError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// JOINER TYPE
// =============================================================================

/// The comparison kind of a single join condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JoinerType {
    /// Left key equals right key. Indexable exactly.
    EqualTo,
    /// Left key is strictly less than right key.
    LessThan,
    /// Left key is at most right key.
    LessThanOrEqualTo,
    /// Left key is strictly greater than right key.
    GreaterThan,
    /// Left key is at least right key.
    GreaterThanOrEqualTo,
}

impl JoinerType {
    /// The mirrored comparison: the type that holds for (right, left)
    /// exactly when `self` holds for (left, right).
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::EqualTo => Self::EqualTo,
            Self::LessThan => Self::GreaterThan,
            Self::LessThanOrEqualTo => Self::GreaterThanOrEqualTo,
            Self::GreaterThan => Self::LessThan,
            Self::GreaterThanOrEqualTo => Self::LessThanOrEqualTo,
        }
    }

    /// Evaluate this comparison for a (left, right) key pair.
    #[must_use]
    pub fn matches(self, left: &Key, right: &Key) -> bool {
        match self {
            Self::EqualTo => left == right,
            Self::LessThan => left < right,
            Self::LessThanOrEqualTo => left <= right,
            Self::GreaterThan => left > right,
            Self::GreaterThanOrEqualTo => left >= right,
        }
    }
}

// =============================================================================
// SINGLE JOINER
// =============================================================================

/// One structural join condition: a comparison kind plus the key
/// extraction functions for both sides.
pub struct Joiner<F> {
    joiner_type: JoinerType,
    left: TupleKeyFn<F>,
    right: TupleKeyFn<F>,
}

impl<F> Clone for Joiner<F> {
    fn clone(&self) -> Self {
        Self {
            joiner_type: self.joiner_type,
            left: Arc::clone(&self.left),
            right: Arc::clone(&self.right),
        }
    }
}

impl<F: PlanningFact> Joiner<F> {
    /// The comparison kind of this condition.
    #[must_use]
    pub fn joiner_type(&self) -> JoinerType {
        self.joiner_type
    }

    /// Extract the left-side key from a left tuple.
    #[must_use]
    pub fn left_key(&self, view: &TupleView<'_, F>) -> Key {
        (self.left)(view)
    }

    /// Extract the right-side key from a right tuple.
    #[must_use]
    pub fn right_key(&self, view: &TupleView<'_, F>) -> Key {
        (self.right)(view)
    }
}

/// Raw joiner constructor: an explicit comparison type with both mappings.
pub fn on<F, L, R>(left: L, joiner_type: JoinerType, right: R) -> Joiner<F>
where
    F: PlanningFact,
    L: Fn(&TupleView<'_, F>) -> Key + Send + Sync + 'static,
    R: Fn(&TupleView<'_, F>) -> Key + Send + Sync + 'static,
{
    Joiner {
        joiner_type,
        left: Arc::new(left),
        right: Arc::new(right),
    }
}

/// `left == right` join condition.
pub fn equal_to<F, L, R>(left: L, right: R) -> Joiner<F>
where
    F: PlanningFact,
    L: Fn(&TupleView<'_, F>) -> Key + Send + Sync + 'static,
    R: Fn(&TupleView<'_, F>) -> Key + Send + Sync + 'static,
{
    on(left, JoinerType::EqualTo, right)
}

/// `left < right` join condition.
pub fn less_than<F, L, R>(left: L, right: R) -> Joiner<F>
where
    F: PlanningFact,
    L: Fn(&TupleView<'_, F>) -> Key + Send + Sync + 'static,
    R: Fn(&TupleView<'_, F>) -> Key + Send + Sync + 'static,
{
    on(left, JoinerType::LessThan, right)
}

/// `left <= right` join condition.
pub fn less_than_or_equal_to<F, L, R>(left: L, right: R) -> Joiner<F>
where
    F: PlanningFact,
    L: Fn(&TupleView<'_, F>) -> Key + Send + Sync + 'static,
    R: Fn(&TupleView<'_, F>) -> Key + Send + Sync + 'static,
{
    on(left, JoinerType::LessThanOrEqualTo, right)
}

/// `left > right` join condition.
pub fn greater_than<F, L, R>(left: L, right: R) -> Joiner<F>
where
    F: PlanningFact,
    L: Fn(&TupleView<'_, F>) -> Key + Send + Sync + 'static,
    R: Fn(&TupleView<'_, F>) -> Key + Send + Sync + 'static,
{
    on(left, JoinerType::GreaterThan, right)
}

/// `left >= right` join condition.
pub fn greater_than_or_equal_to<F, L, R>(left: L, right: R) -> Joiner<F>
where
    F: PlanningFact,
    L: Fn(&TupleView<'_, F>) -> Key + Send + Sync + 'static,
    R: Fn(&TupleView<'_, F>) -> Key + Send + Sync + 'static,
{
    on(left, JoinerType::GreaterThanOrEqualTo, right)
}

// =============================================================================
// COMPOSITE JOINER
// =============================================================================

/// A flattened conjunction of single joiners.
///
/// Invariant: a composite contains at least one joiner. The equality
/// conditions are kept separate from the ordering conditions so that the
/// shared join index can do exact bucket lookups on the equality part.
pub struct CompositeJoiner<F> {
    equals: Vec<Joiner<F>>,
    comparisons: Vec<Joiner<F>>,
}

impl<F> Clone for CompositeJoiner<F> {
    fn clone(&self) -> Self {
        Self {
            equals: self.equals.clone(),
            comparisons: self.comparisons.clone(),
        }
    }
}

impl<F: PlanningFact> CompositeJoiner<F> {
    /// Flatten single joiners into a composite conjunction.
    ///
    /// Rejects an empty composition: a join with no condition is a
    /// configuration error, not a cross join.
    pub fn new(joiners: Vec<Joiner<F>>) -> Result<Self, ScoriaError> {
        if joiners.is_empty() {
            return Err(ScoriaError::EmptyJoiner);
        }
        let mut equals = Vec::new();
        let mut comparisons = Vec::new();
        for joiner in joiners {
            match joiner.joiner_type() {
                JoinerType::EqualTo => equals.push(joiner),
                _ => comparisons.push(joiner),
            }
        }
        Ok(Self {
            equals,
            comparisons,
        })
    }

    /// Append further conditions, keeping the flattened shape.
    #[must_use]
    pub fn and(mut self, joiner: Joiner<F>) -> Self {
        match joiner.joiner_type() {
            JoinerType::EqualTo => self.equals.push(joiner),
            _ => self.comparisons.push(joiner),
        }
        self
    }

    /// Total number of conditions in the conjunction.
    #[must_use]
    pub fn len(&self) -> usize {
        self.equals.len().saturating_add(self.comparisons.len())
    }

    /// A composite is never empty by construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The exact-lookup bucket key of a left tuple: all equality-condition
    /// left keys, composed in condition order.
    #[must_use]
    pub fn left_bucket_key(&self, view: &TupleView<'_, F>) -> Key {
        Key::composite(self.equals.iter().map(|j| j.left_key(view)))
    }

    /// The exact-lookup bucket key of a right tuple.
    #[must_use]
    pub fn right_bucket_key(&self, view: &TupleView<'_, F>) -> Key {
        Key::composite(self.equals.iter().map(|j| j.right_key(view)))
    }

    /// The ordering-condition keys of a left tuple, in condition order.
    #[must_use]
    pub fn left_comparison_keys(&self, view: &TupleView<'_, F>) -> Vec<Key> {
        self.comparisons.iter().map(|j| j.left_key(view)).collect()
    }

    /// The ordering-condition keys of a right tuple, in condition order.
    #[must_use]
    pub fn right_comparison_keys(&self, view: &TupleView<'_, F>) -> Vec<Key> {
        self.comparisons.iter().map(|j| j.right_key(view)).collect()
    }

    /// Evaluate all ordering conditions for stored (left, right) key rows.
    ///
    /// Both slices were produced by the `*_comparison_keys` methods and
    /// therefore align with the condition order.
    #[must_use]
    pub fn comparisons_match(&self, left_keys: &[Key], right_keys: &[Key]) -> bool {
        self.comparisons
            .iter()
            .zip(left_keys.iter().zip(right_keys.iter()))
            .all(|(joiner, (left, right))| joiner.joiner_type().matches(left, right))
    }
}

// =============================================================================
// TESTS
// =============================================================================
