//! # Constraint Collectors
//!
//! Incremental aggregation for group nodes.
//!
//! A collector is a supplier/accumulate/finish triple. `supply` creates a
//! fresh mutable accumulator per group; `accumulate` folds one tuple in
//! and returns an undo action that exactly reverses that fold; `finish`
//! derives the externally visible result. Applying accumulate and then
//! its undo restores the accumulator to its prior state.
//!
//! The accumulator state is a closed, deterministic enum (integer
//! registers and a `BTreeMap` multiset) rather than type-erased storage:
//! external logic is injected only through the triple's closures, never
//! through opaque state. A collector handed a state shape it did not
//! create reports `CollectorStateMismatch` instead of corrupting it.

use crate::tuple::TupleView;
use crate::{Key, PlanningFact, ScoriaError};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// ACCUMULATOR STATE
// =============================================================================

/// Mutable per-group accumulator state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccState {
    /// A plain counter register.
    Count(i64),
    /// A running-sum register.
    Sum(i64),
    /// A key multiset, for order statistics such as min and max.
    Bag(BTreeMap<Key, i64>),
}

/// An undo action returned by one accumulate call.
///
/// Consumed exactly once, against the same accumulator the accumulate ran
/// on.
pub type UndoFold = Box<dyn FnOnce(&mut AccState) -> Result<(), ScoriaError> + Send>;

// =============================================================================
// COLLECTOR
// =============================================================================

/// An incremental aggregation function usable in a group-by.
pub struct Collector<F> {
    supplier: Arc<dyn Fn() -> AccState + Send + Sync>,
    accumulate: Arc<
        dyn Fn(&mut AccState, &TupleView<'_, F>) -> Result<UndoFold, ScoriaError> + Send + Sync,
    >,
    finish: Arc<dyn Fn(&AccState) -> Result<Key, ScoriaError> + Send + Sync>,
}

impl<F> Clone for Collector<F> {
    fn clone(&self) -> Self {
        Self {
            supplier: Arc::clone(&self.supplier),
            accumulate: Arc::clone(&self.accumulate),
            finish: Arc::clone(&self.finish),
        }
    }
}

impl<F: PlanningFact> Collector<F> {
    /// Build a custom collector from its three parts.
    pub fn from_parts(
        supplier: impl Fn() -> AccState + Send + Sync + 'static,
        accumulate: impl Fn(&mut AccState, &TupleView<'_, F>) -> Result<UndoFold, ScoriaError>
        + Send
        + Sync
        + 'static,
        finish: impl Fn(&AccState) -> Result<Key, ScoriaError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            supplier: Arc::new(supplier),
            accumulate: Arc::new(accumulate),
            finish: Arc::new(finish),
        }
    }

    /// Create a fresh accumulator for a new group.
    #[must_use]
    pub fn supply(&self) -> AccState {
        (self.supplier)()
    }

    /// Fold one tuple into the accumulator; the returned action undoes
    /// exactly this fold.
    pub fn accumulate(
        &self,
        acc: &mut AccState,
        view: &TupleView<'_, F>,
    ) -> Result<UndoFold, ScoriaError> {
        (self.accumulate)(acc, view)
    }

    /// Derive the externally visible result from the accumulator.
    pub fn finish(&self, acc: &AccState) -> Result<Key, ScoriaError> {
        (self.finish)(acc)
    }
}

// =============================================================================
// BUILT-IN COLLECTORS
// =============================================================================

/// Count the tuples in each group.
#[must_use]
pub fn count<F: PlanningFact>() -> Collector<F> {
    Collector::from_parts(
        || AccState::Count(0),
        |acc, _view| {
            let AccState::Count(register) = acc else {
                return Err(ScoriaError::CollectorStateMismatch("count"));
            };
            *register = register.saturating_add(1);
            Ok(Box::new(|acc: &mut AccState| {
                let AccState::Count(register) = acc else {
                    return Err(ScoriaError::CollectorStateMismatch("count undo"));
                };
                *register = register.saturating_sub(1);
                Ok(())
            }))
        },
        |acc| {
            let AccState::Count(register) = acc else {
                return Err(ScoriaError::CollectorStateMismatch("count finish"));
            };
            Ok(Key::Int(*register))
        },
    )
}

/// Sum an integer mapping over the tuples in each group.
pub fn sum<F: PlanningFact>(
    mapping: impl Fn(&TupleView<'_, F>) -> i64 + Send + Sync + 'static,
) -> Collector<F> {
    let mapping = Arc::new(mapping);
    Collector::from_parts(
        || AccState::Sum(0),
        move |acc, view| {
            let AccState::Sum(register) = acc else {
                return Err(ScoriaError::CollectorStateMismatch("sum"));
            };
            let amount = mapping(view);
            *register = register.saturating_add(amount);
            Ok(Box::new(move |acc: &mut AccState| {
                let AccState::Sum(register) = acc else {
                    return Err(ScoriaError::CollectorStateMismatch("sum undo"));
                };
                *register = register.saturating_sub(amount);
                Ok(())
            }))
        },
        |acc| {
            let AccState::Sum(register) = acc else {
                return Err(ScoriaError::CollectorStateMismatch("sum finish"));
            };
            Ok(Key::Int(*register))
        },
    )
}

/// Fold a key into a bag and return the undo that takes it back out.
fn bag_accumulate(acc: &mut AccState, key: Key) -> Result<UndoFold, ScoriaError> {
    let AccState::Bag(bag) = acc else {
        return Err(ScoriaError::CollectorStateMismatch("bag"));
    };
    let slot = bag.entry(key.clone()).or_insert(0);
    *slot = slot.saturating_add(1);
    Ok(Box::new(move |acc: &mut AccState| {
        let AccState::Bag(bag) = acc else {
            return Err(ScoriaError::CollectorStateMismatch("bag undo"));
        };
        let Some(slot) = bag.get_mut(&key) else {
            return Err(ScoriaError::CollectorStateMismatch("bag undo: key absent"));
        };
        *slot = slot.saturating_sub(1);
        if *slot == 0 {
            bag.remove(&key);
        }
        Ok(())
    }))
}

/// The minimum of a key mapping over the tuples in each group.
///
/// Never finished on an empty group: a group with zero contributors is
/// retracted before its finishers run.
pub fn min<F: PlanningFact>(
    mapping: impl Fn(&TupleView<'_, F>) -> Key + Send + Sync + 'static,
) -> Collector<F> {
    let mapping = Arc::new(mapping);
    Collector::from_parts(
        || AccState::Bag(BTreeMap::new()),
        move |acc, view| bag_accumulate(acc, mapping(view)),
        |acc| {
            let AccState::Bag(bag) = acc else {
                return Err(ScoriaError::CollectorStateMismatch("min finish"));
            };
            bag.first_key_value()
                .map(|(key, _)| key.clone())
                .ok_or(ScoriaError::CollectorStateMismatch("min of empty group"))
        },
    )
}

/// The maximum of a key mapping over the tuples in each group.
///
/// Never finished on an empty group, like [`min`].
pub fn max<F: PlanningFact>(
    mapping: impl Fn(&TupleView<'_, F>) -> Key + Send + Sync + 'static,
) -> Collector<F> {
    let mapping = Arc::new(mapping);
    Collector::from_parts(
        || AccState::Bag(BTreeMap::new()),
        move |acc, view| bag_accumulate(acc, mapping(view)),
        |acc| {
            let AccState::Bag(bag) = acc else {
                return Err(ScoriaError::CollectorStateMismatch("max finish"));
            };
            bag.last_key_value()
                .map(|(key, _)| key.clone())
                .ok_or(ScoriaError::CollectorStateMismatch("max of empty group"))
        },
    )
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::Datum;
    use crate::{FactId, FactTypeId};

    #[derive(Debug)]
    struct Load {
        id: FactId,
        weight: i64,
    }

    impl PlanningFact for Load {
        fn fact_id(&self) -> FactId {
            self.id
        }

        fn fact_type(&self) -> FactTypeId {
            FactTypeId(0)
        }
    }

    fn store(weights: &[i64]) -> BTreeMap<FactId, Load> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &weight)| {
                let id = FactId(i as u64);
                (id, Load { id, weight })
            })
            .collect()
    }

    fn view_of(facts: &BTreeMap<FactId, Load>, id: u64) -> (Vec<Datum>, &BTreeMap<FactId, Load>) {
        (vec![Datum::Fact(FactId(id))], facts)
    }

    #[test]
    fn count_accumulate_then_undo_restores_state() {
        let collector: Collector<Load> = count();
        let facts = store(&[5]);
        let (slots, facts_ref) = view_of(&facts, 0);
        let view = TupleView::new(&slots, facts_ref);

        let mut acc = collector.supply();
        let before = acc.clone();
        let undo = collector.accumulate(&mut acc, &view).expect("accumulate");
        assert_eq!(collector.finish(&acc).expect("finish"), Key::Int(1));
        undo(&mut acc).expect("undo");
        assert_eq!(acc, before);
    }

    #[test]
    fn sum_folds_mapping_and_undoes_exact_amount() {
        let collector: Collector<Load> =
            sum(|t: &TupleView<'_, Load>| t.fact(0).map_or(0, |load| load.weight));
        let facts = store(&[5, 12]);
        let mut acc = collector.supply();

        let slots_a = vec![Datum::Fact(FactId(0))];
        let slots_b = vec![Datum::Fact(FactId(1))];
        let undo_a = collector
            .accumulate(&mut acc, &TupleView::new(&slots_a, &facts))
            .expect("accumulate");
        let _undo_b = collector
            .accumulate(&mut acc, &TupleView::new(&slots_b, &facts))
            .expect("accumulate");
        assert_eq!(collector.finish(&acc).expect("finish"), Key::Int(17));

        undo_a(&mut acc).expect("undo");
        assert_eq!(collector.finish(&acc).expect("finish"), Key::Int(12));
    }

    #[test]
    fn min_max_track_duplicates_through_the_bag() {
        let min_collector: Collector<Load> =
            min(|t: &TupleView<'_, Load>| Key::Int(t.fact(0).map_or(0, |l| l.weight)));
        let facts = store(&[3, 3, 9]);
        let mut acc = min_collector.supply();

        let mut undos = Vec::new();
        for id in 0..3u64 {
            let slots = vec![Datum::Fact(FactId(id))];
            let view = TupleView::new(&slots, &facts);
            undos.push(min_collector.accumulate(&mut acc, &view).expect("accumulate"));
        }
        assert_eq!(min_collector.finish(&acc).expect("finish"), Key::Int(3));

        // Removing one of the duplicate minimums keeps the other.
        undos.remove(0)(&mut acc).expect("undo");
        assert_eq!(min_collector.finish(&acc).expect("finish"), Key::Int(3));
        undos.remove(0)(&mut acc).expect("undo");
        assert_eq!(min_collector.finish(&acc).expect("finish"), Key::Int(9));
    }

    #[test]
    fn foreign_state_is_rejected_not_corrupted() {
        let collector: Collector<Load> = count();
        let facts = store(&[1]);
        let slots = vec![Datum::Fact(FactId(0))];
        let view = TupleView::new(&slots, &facts);

        let mut wrong = AccState::Sum(0);
        assert!(matches!(
            collector.accumulate(&mut wrong, &view),
            Err(ScoriaError::CollectorStateMismatch(_))
        ));
        assert_eq!(wrong, AccState::Sum(0));
    }
}
