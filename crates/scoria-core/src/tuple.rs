//! # Tuple Module
//!
//! The unit of data flowing through the evaluation network.
//!
//! A tuple is a fixed-arity (1–4) ordered row of slots plus a lifecycle
//! state. A slot holds either a fact reference (identity semantics) or a
//! computed value (a group key or collector result). Tuples live in a
//! session-owned arena; nodes reference them by `TupleId` only, never by
//! raw reference, so the whole graph state can be dropped or inspected
//! cheaply and tuple identity is stable for the tuple's entire lifetime.

use crate::{FactId, Key, PlanningFact, ScoriaError, TupleId, TupleState};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// SLOTS
// =============================================================================

/// One slot of a tuple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Datum {
    /// A reference to a live fact, by identity.
    Fact(FactId),
    /// A computed value: a group key or a collector result.
    Value(Key),
}

// =============================================================================
// TUPLE
// =============================================================================

/// A fixed-arity row of slots tagged with lifecycle state.
#[derive(Debug, Clone)]
pub struct Tuple {
    /// Arena identity of this tuple.
    pub id: TupleId,
    /// The ordered slots. Length is the arity, 1–4.
    pub slots: Vec<Datum>,
    /// Where in the current propagation batch this tuple is.
    pub state: TupleState,
}

// =============================================================================
// TUPLE ARENA
// =============================================================================

/// Session-owned storage for all live tuples.
///
/// `BTreeMap` keyed by `TupleId` for deterministic iteration.
#[derive(Debug, Default)]
pub struct TupleArena {
    tuples: BTreeMap<TupleId, Tuple>,
    next_id: u64,
}

impl TupleArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new tuple in state `Creating`.
    pub fn create(&mut self, slots: Vec<Datum>) -> TupleId {
        let id = TupleId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        self.tuples.insert(
            id,
            Tuple {
                id,
                slots,
                state: TupleState::Creating,
            },
        );
        id
    }

    /// Look up a tuple. Absence is a bookkeeping invariant violation.
    pub fn get(&self, id: TupleId) -> Result<&Tuple, ScoriaError> {
        self.tuples.get(&id).ok_or(ScoriaError::TupleNotFound(id))
    }

    /// Look up a tuple mutably. Absence is a bookkeeping invariant violation.
    pub fn get_mut(&mut self, id: TupleId) -> Result<&mut Tuple, ScoriaError> {
        self.tuples
            .get_mut(&id)
            .ok_or(ScoriaError::TupleNotFound(id))
    }

    /// Remove a dead tuple from the arena.
    pub fn remove(&mut self, id: TupleId) -> Option<Tuple> {
        self.tuples.remove(&id)
    }

    /// Whether the tuple is still in the arena.
    #[must_use]
    pub fn contains(&self, id: TupleId) -> bool {
        self.tuples.contains_key(&id)
    }

    /// Number of live tuples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    /// Whether the arena holds no tuples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Iterate all live tuples in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = &Tuple> {
        self.tuples.values()
    }
}

// =============================================================================
// TUPLE VIEW
// =============================================================================

/// A read-only view of a tuple's slots, resolved against the fact store.
///
/// This is what user-supplied predicates, key mappings and weighers
/// receive. The view borrows; nothing here can retain a fact reference
/// across propagation batches.
pub struct TupleView<'a, F> {
    slots: &'a [Datum],
    facts: &'a BTreeMap<FactId, F>,
}

impl<'a, F: PlanningFact> TupleView<'a, F> {
    /// Create a view over the given slots and fact store.
    #[must_use]
    pub fn new(slots: &'a [Datum], facts: &'a BTreeMap<FactId, F>) -> Self {
        Self { slots, facts }
    }

    /// The arity of the underlying tuple.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.slots.len()
    }

    /// Resolve slot `index` as a fact. `None` if the slot is out of range,
    /// holds a value, or the fact is no longer live.
    #[must_use]
    pub fn fact(&self, index: usize) -> Option<&'a F> {
        match self.slots.get(index) {
            Some(Datum::Fact(id)) => self.facts.get(id),
            _ => None,
        }
    }

    /// The fact identity in slot `index`, if it is a fact slot.
    #[must_use]
    pub fn fact_id(&self, index: usize) -> Option<FactId> {
        match self.slots.get(index) {
            Some(Datum::Fact(id)) => Some(*id),
            _ => None,
        }
    }

    /// The computed value in slot `index`, if it is a value slot.
    #[must_use]
    pub fn value(&self, index: usize) -> Option<&'a Key> {
        match self.slots.get(index) {
            Some(Datum::Value(key)) => Some(key),
            _ => None,
        }
    }

    /// Shorthand: the integer value in slot `index`, if it is an
    /// `Key::Int` value slot.
    #[must_use]
    pub fn int(&self, index: usize) -> Option<i64> {
        self.value(index).and_then(Key::as_int)
    }

    /// All fact identities in slot order, skipping value slots.
    ///
    /// This is the default justification list of a constraint match.
    #[must_use]
    pub fn fact_ids(&self) -> Vec<FactId> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                Datum::Fact(id) => Some(*id),
                Datum::Value(_) => None,
            })
            .collect()
    }
}

// =============================================================================
// USER FUNCTION ALIASES
// =============================================================================

/// A predicate over a tuple's resolved slots.
pub type TuplePredicate<F> = Arc<dyn Fn(&TupleView<'_, F>) -> bool + Send + Sync>;

/// A mapping from a tuple to a comparison or grouping key.
pub type TupleKeyFn<F> = Arc<dyn Fn(&TupleView<'_, F>) -> Key + Send + Sync>;

/// A mapping from a tuple to an integer match weight.
pub type MatchWeigher<F> = Arc<dyn Fn(&TupleView<'_, F>) -> i64 + Send + Sync>;

/// A mapping from a tuple to the facts justifying a constraint match.
pub type JustificationFn<F> = Arc<dyn Fn(&TupleView<'_, F>) -> Vec<FactId> + Send + Sync>;

/// Wrap a closure as a shareable [`TupleKeyFn`].
pub fn key_fn<F>(f: impl Fn(&TupleView<'_, F>) -> Key + Send + Sync + 'static) -> TupleKeyFn<F> {
    Arc::new(f)
}

/// Wrap a closure as a shareable [`TuplePredicate`].
pub fn predicate<F>(
    f: impl Fn(&TupleView<'_, F>) -> bool + Send + Sync + 'static,
) -> TuplePredicate<F> {
    Arc::new(f)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FactTypeId;

    #[derive(Debug)]
    struct Item {
        id: FactId,
        size: i64,
    }

    impl PlanningFact for Item {
        fn fact_id(&self) -> FactId {
            self.id
        }

        fn fact_type(&self) -> FactTypeId {
            FactTypeId(1)
        }
    }

    fn store() -> BTreeMap<FactId, Item> {
        let mut facts = BTreeMap::new();
        facts.insert(
            FactId(1),
            Item {
                id: FactId(1),
                size: 40,
            },
        );
        facts
    }

    #[test]
    fn arena_allocates_sequential_ids_in_creating_state() {
        let mut arena = TupleArena::new();
        let a = arena.create(vec![Datum::Fact(FactId(1))]);
        let b = arena.create(vec![Datum::Fact(FactId(2))]);
        assert!(a < b);
        assert_eq!(arena.get(a).expect("get").state, TupleState::Creating);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn arena_lookup_after_remove_is_invariant_violation() {
        let mut arena = TupleArena::new();
        let id = arena.create(vec![Datum::Fact(FactId(1))]);
        arena.remove(id);
        assert!(matches!(
            arena.get(id),
            Err(ScoriaError::TupleNotFound(t)) if t == id
        ));
    }

    #[test]
    fn view_resolves_fact_and_value_slots() {
        let facts = store();
        let slots = vec![Datum::Fact(FactId(1)), Datum::Value(Key::Int(3))];
        let view = TupleView::new(&slots, &facts);

        assert_eq!(view.arity(), 2);
        assert_eq!(view.fact(0).map(|item| item.size), Some(40));
        assert_eq!(view.int(1), Some(3));
        // Kind mismatches resolve to None, not to a wrong value.
        assert!(view.fact(1).is_none());
        assert!(view.value(0).is_none());
        assert_eq!(view.fact_ids(), vec![FactId(1)]);
    }
}
