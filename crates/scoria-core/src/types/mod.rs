//! # Core Type Definitions
//!
//! This module contains the foundational types for the Scoria evaluation
//! network:
//! - Identifiers (`FactId`, `FactTypeId`, `TupleId`, `NodeIndex`, `StreamId`,
//!   `ConstraintMatchId`)
//! - The `Key` ordering enum used for join keys, group keys and collector
//!   results
//! - The tuple lifecycle state (`TupleState`)
//! - The `PlanningFact` trait implemented by user fact types
//! - Error types (`ScoriaError`)
//!
//! ## Determinism Guarantees
//!
//! All types in this module:
//! - Use integer arithmetic only (no floating-point)
//! - Implement `Ord` for deterministic ordering in `BTreeMap`/`BTreeSet`

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Unique identifier for a problem fact in the external world.
///
/// Facts have identity semantics: two facts are the same if and only if
/// their `FactId`s are equal, regardless of their field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactId(pub u64);

/// Runtime type tag of a fact, used to dispatch inserts to source nodes.
///
/// Several source nodes may subscribe to the same `FactTypeId`; all of
/// them receive every fact carrying that tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactTypeId(pub u32);

/// Unique identifier for a tuple in the session's tuple arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TupleId(pub u64);

/// Position of a node in the topologically-sorted node arena.
///
/// Assigned once at graph build and immutable afterward. Data always flows
/// from a smaller index to a larger one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIndex(pub usize);

/// Handle to a stream definition inside a `ConstraintModel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub usize);

/// Unique identifier for one constraint match instance.
///
/// Two matches with identical justifications are still distinct matches;
/// deduplication is deliberately not performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConstraintMatchId(pub u64);

// =============================================================================
// KEY
// =============================================================================

/// A comparison key extracted from tuple facts.
///
/// Keys are the values that join indexes, group maps and collector results
/// are built from. The set of variants is closed so that `BTreeMap`
/// ordering stays total and deterministic; there is no float variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Key {
    /// A signed integer key.
    Int(i64),
    /// A boolean key.
    Bool(bool),
    /// A text key.
    Text(String),
    /// A fact-identity key.
    Fact(FactId),
    /// An ordered composition of keys, compared element-wise.
    Composite(Vec<Key>),
}

impl Key {
    /// Build a composite key from parts.
    #[must_use]
    pub fn composite(parts: impl IntoIterator<Item = Key>) -> Self {
        Self::Composite(parts.into_iter().collect())
    }

    /// Extract the integer value, if this is an `Int` key.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Key {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<FactId> for Key {
    fn from(v: FactId) -> Self {
        Self::Fact(v)
    }
}

// =============================================================================
// TUPLE STATE
// =============================================================================

/// Lifecycle state of a tuple within the current propagation batch.
///
/// `Ok` tuples are stable between batches. `Dead` tuples are removed from
/// the arena at the end of the batch and must never be referenced again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TupleState {
    /// Created in this batch; becomes `Ok` when the batch settles.
    Creating,
    /// Stable between batches.
    Ok,
    /// Modified in this batch; becomes `Ok` when the batch settles.
    Updating,
    /// Retracted in this batch; becomes `Dead` when the batch settles.
    Dying,
    /// Removed. Terminal state.
    Dead,
}

// =============================================================================
// PLANNING FACT TRAIT
// =============================================================================

/// The trait implemented by user fact types fed into a `Session`.
///
/// The engine never inspects fact fields itself; predicates and key
/// mappings supplied with the constraint model do. The trait only exposes
/// the two properties the network needs: identity and runtime type.
pub trait PlanningFact: 'static {
    /// The identity of this fact. Must be unique per live fact and stable
    /// across `update` calls.
    fn fact_id(&self) -> FactId;

    /// The runtime type tag used to dispatch this fact to source nodes.
    fn fact_type(&self) -> FactTypeId;
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the Scoria engine.
///
/// Three distinct fault classes, none of them retried:
/// - Configuration errors are caught at graph-build time and abort the
///   build.
/// - Invariant violations at runtime indicate a caller bug or diverged
///   tuple bookkeeping; continuing would silently corrupt the score, so
///   they surface as hard failures.
/// - Disabled-feature errors flag a caller configuration mistake, distinct
///   from internal corruption.
#[derive(Debug, Error)]
pub enum ScoriaError {
    // --- Configuration errors (graph build) ---
    /// A composite joiner was built from zero joiners.
    #[error("A join requires at least one joiner")]
    EmptyJoiner,

    /// A join or exists output would exceed the maximum tuple arity.
    #[error("Combined tuple arity {left} + {right} exceeds the maximum of {max}")]
    ArityOverflow {
        /// Arity of the left input stream.
        left: usize,
        /// Arity of the right input stream.
        right: usize,
        /// The arity ceiling.
        max: usize,
    },

    /// A group-by requested more key mappings or collectors than supported.
    #[error("Group-by with {mappings} key mapping(s) and {collectors} collector(s) exceeds the output arity limit")]
    CollectorLimit {
        /// Number of requested key mappings.
        mappings: usize,
        /// Number of requested collectors.
        collectors: usize,
    },

    /// A group-by requested neither key mappings nor collectors.
    #[error("Group-by requires at least one key mapping or collector")]
    EmptyGroupBy,

    /// A stream handle does not refer to a definition in this model.
    #[error("Unknown stream handle: {0:?}")]
    UnknownStream(StreamId),

    /// A constraint definition is structurally invalid.
    #[error("Malformed constraint definition: {0}")]
    MalformedConstraint(String),

    // --- Invariant violations (runtime, caller bug / diverged bookkeeping) ---
    /// A fact was inserted while already present in the session.
    #[error("Fact {0:?} was already inserted")]
    FactAlreadyInserted(FactId),

    /// A fact was updated or retracted without ever being inserted, or was
    /// retracted twice.
    #[error("Fact {0:?} was never inserted or was already retracted")]
    FactNotFound(FactId),

    /// Node bookkeeping referenced a tuple that is not in the arena.
    #[error("Tuple {0:?} is not in the arena; bookkeeping has diverged")]
    TupleNotFound(TupleId),

    /// The same upstream tuple was delivered twice to one node.
    #[error("Tuple {0:?} was delivered twice to the same node")]
    DuplicateTuple(TupleId),

    /// A fact slot was read as a value slot, or vice versa.
    #[error("Tuple slot {index} holds a different slot kind than requested")]
    SlotKindMismatch {
        /// The offending slot position.
        index: usize,
    },

    /// A collector received an accumulator state it did not create.
    #[error("Collector state mismatch: {0}")]
    CollectorStateMismatch(&'static str),

    /// A constraint match retraction failed to find the expected entry.
    #[error("Constraint match {0:?} is not in its match total; bookkeeping has diverged")]
    MatchNotFound(ConstraintMatchId),

    /// An indictment retraction failed to find the expected entry.
    #[error("Fact {0:?} has no indictment entry for the retracted match")]
    IndictmentNotFound(FactId),

    // --- Disabled-feature errors ---
    /// Constraint match or indictment data was requested from a session
    /// built without match tracking.
    #[error("Constraint match tracking is disabled for this session")]
    MatchTrackingDisabled,
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ordering_is_total_within_variant() {
        assert!(Key::Int(1) < Key::Int(2));
        assert!(Key::Text("a".into()) < Key::Text("b".into()));
        assert!(Key::Fact(FactId(1)) < Key::Fact(FactId(2)));
    }

    #[test]
    fn composite_key_compares_elementwise() {
        let a = Key::composite([Key::Int(1), Key::Int(5)]);
        let b = Key::composite([Key::Int(1), Key::Int(9)]);
        let c = Key::composite([Key::Int(2), Key::Int(0)]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn key_conversions() {
        assert_eq!(Key::from(42i64), Key::Int(42));
        assert_eq!(Key::from("ward"), Key::Text("ward".into()));
        assert_eq!(Key::from(FactId(7)), Key::Fact(FactId(7)));
        assert_eq!(Key::Int(3).as_int(), Some(3));
        assert_eq!(Key::Bool(true).as_int(), None);
    }

    #[test]
    fn error_classes_have_distinct_messages() {
        let config = ScoriaError::EmptyJoiner.to_string();
        let invariant = ScoriaError::FactNotFound(FactId(3)).to_string();
        let disabled = ScoriaError::MatchTrackingDisabled.to_string();
        assert!(config.contains("joiner"));
        assert!(invariant.contains("retracted"));
        assert!(disabled.contains("disabled"));
    }
}
