//! # Join & Existence Bridges
//!
//! Shared state behind a bridge pair: two graph nodes (one per upstream
//! chain) feeding a single store owned by the session.
//!
//! [`JoinStore`] maintains the live set of combined tuples for an
//! equi-join with optional ordering joiners and an optional post-join
//! filter. [`ExistsStore`] maintains a per-left match count for
//! `if_exists` / `if_not_exists` and forwards the left tuple through
//! only while the condition holds.
//!
//! Both stores index each side by the composite equality key, with the
//! ordering-comparison keys stored per tuple, so a probe touches exactly
//! one bucket. Retract paths consume stored state (pair maps, matched
//! sets) instead of re-evaluating predicates, so a fact mutation between
//! events can never strand bookkeeping.

use crate::index::SideIndex;
use crate::joiner::CompositeJoiner;
use crate::node::{EventOp, NetCtx, OutEvent};
use crate::tuple::{Datum, TuplePredicate, TupleView};
use crate::{Key, PlanningFact, ScoriaError, TupleId};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// SIDE
// =============================================================================

/// Which upstream chain of a bridge pair an event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The first (left) parent chain.
    Left,
    /// The second (right) parent chain.
    Right,
}

/// Orient a (this, other) tuple pair into (left, right).
fn orient(side: Side, this: TupleId, other: TupleId) -> (TupleId, TupleId) {
    match side {
        Side::Left => (this, other),
        Side::Right => (other, this),
    }
}

/// Concatenated slots of a (left, right) pair, in that order.
fn combined_slots<F: PlanningFact>(
    ctx: &NetCtx<'_, F>,
    left: TupleId,
    right: TupleId,
) -> Result<Vec<Datum>, ScoriaError> {
    let mut slots = ctx.snapshot(left)?;
    slots.extend(ctx.snapshot(right)?);
    Ok(slots)
}

// =============================================================================
// JOIN STORE
// =============================================================================

/// Shared state of one join bridge pair.
///
/// Every live pair owns a combined tuple in the arena, recorded in both
/// orientations so either side can enumerate its pairs by range scan.
pub struct JoinStore<F> {
    joiners: CompositeJoiner<F>,
    filter: Option<TuplePredicate<F>>,
    left: SideIndex,
    right: SideIndex,
    left_keys: BTreeMap<TupleId, Key>,
    right_keys: BTreeMap<TupleId, Key>,
    out_by_left: BTreeMap<(TupleId, TupleId), TupleId>,
    out_by_right: BTreeMap<(TupleId, TupleId), TupleId>,
}

impl<F: PlanningFact> JoinStore<F> {
    /// Create the store for one join pair.
    #[must_use]
    pub fn new(joiners: CompositeJoiner<F>, filter: Option<TuplePredicate<F>>) -> Self {
        Self {
            joiners,
            filter,
            left: SideIndex::new(),
            right: SideIndex::new(),
            left_keys: BTreeMap::new(),
            right_keys: BTreeMap::new(),
            out_by_left: BTreeMap::new(),
            out_by_right: BTreeMap::new(),
        }
    }

    /// Number of live combined tuples.
    #[must_use]
    pub fn pair_count(&self) -> usize {
        self.out_by_left.len()
    }

    fn side_keys(&self, side: Side, view: &TupleView<'_, F>) -> (Key, Vec<Key>) {
        match side {
            Side::Left => (
                self.joiners.left_bucket_key(view),
                self.joiners.left_comparison_keys(view),
            ),
            Side::Right => (
                self.joiners.right_bucket_key(view),
                self.joiners.right_comparison_keys(view),
            ),
        }
    }

    /// Whether the pair matches the ordering joiners and the filter.
    /// Returns the combined slots alongside so the caller can reuse them.
    fn pair_passes(
        &self,
        ctx: &NetCtx<'_, F>,
        side: Side,
        this_cmp: &[Key],
        other_cmp: &[Key],
        left: TupleId,
        right: TupleId,
    ) -> Result<Option<Vec<Datum>>, ScoriaError> {
        let (left_cmp, right_cmp) = match side {
            Side::Left => (this_cmp, other_cmp),
            Side::Right => (other_cmp, this_cmp),
        };
        if !self.joiners.comparisons_match(left_cmp, right_cmp) {
            return Ok(None);
        }
        let slots = combined_slots(ctx, left, right)?;
        if let Some(filter) = &self.filter
            && !filter(&TupleView::new(&slots, ctx.facts))
        {
            return Ok(None);
        }
        Ok(Some(slots))
    }

    fn record_pair(&mut self, left: TupleId, right: TupleId, out: TupleId) {
        self.out_by_left.insert((left, right), out);
        self.out_by_right.insert((right, left), out);
    }

    fn erase_pair(&mut self, left: TupleId, right: TupleId) -> Option<TupleId> {
        let out = self.out_by_left.remove(&(left, right));
        self.out_by_right.remove(&(right, left));
        out
    }

    /// All live pairs involving a tuple of the given side, as
    /// (left, right, out) triples.
    fn pairs_of(&self, side: Side, tuple: TupleId) -> Vec<(TupleId, TupleId, TupleId)> {
        let span = (tuple, TupleId(u64::MIN))..=(tuple, TupleId(u64::MAX));
        match side {
            Side::Left => self
                .out_by_left
                .range(span)
                .map(|(&(left, right), &out)| (left, right, out))
                .collect(),
            Side::Right => self
                .out_by_right
                .range(span)
                .map(|(&(right, left), &out)| (left, right, out))
                .collect(),
        }
    }

    /// Handle one upstream event arriving on the given side.
    pub fn apply(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        side: Side,
        op: EventOp,
        tuple: TupleId,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        match op {
            EventOp::Insert => self.insert_side(ctx, side, tuple),
            EventOp::Update => self.update_side(ctx, side, tuple),
            EventOp::Retract => self.retract_side(ctx, side, tuple),
        }
    }

    fn insert_side(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        side: Side,
        tuple: TupleId,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        let slots = ctx.snapshot(tuple)?;
        let (bucket, cmp) = self.side_keys(side, &TupleView::new(&slots, ctx.facts));
        let (keys, index, probe) = match side {
            Side::Left => (&mut self.left_keys, &mut self.left, &self.right),
            Side::Right => (&mut self.right_keys, &mut self.right, &self.left),
        };
        if keys.insert(tuple, bucket.clone()).is_some() {
            return Err(ScoriaError::DuplicateTuple(tuple));
        }
        index.insert(bucket.clone(), tuple, cmp.clone());
        let candidates: Vec<(TupleId, Vec<Key>)> = probe
            .bucket(&bucket)
            .map(|(id, keys)| (id, keys.to_vec()))
            .collect();

        let mut events = Vec::new();
        for (other, other_cmp) in candidates {
            let (left, right) = orient(side, tuple, other);
            if let Some(combined) = self.pair_passes(ctx, side, &cmp, &other_cmp, left, right)? {
                let out = ctx.create(combined);
                self.record_pair(left, right, out);
                events.push(OutEvent::new(EventOp::Insert, out));
            }
        }
        Ok(events)
    }

    fn retract_side(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        side: Side,
        tuple: TupleId,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        let (keys, index) = match side {
            Side::Left => (&mut self.left_keys, &mut self.left),
            Side::Right => (&mut self.right_keys, &mut self.right),
        };
        let bucket = keys
            .remove(&tuple)
            .ok_or(ScoriaError::TupleNotFound(tuple))?;
        index.remove(&bucket, tuple)?;

        let mut events = Vec::new();
        for (left, right, out) in self.pairs_of(side, tuple) {
            self.erase_pair(left, right);
            ctx.mark_dying(out)?;
            events.push(OutEvent::new(EventOp::Retract, out));
        }
        Ok(events)
    }

    fn update_side(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        side: Side,
        tuple: TupleId,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        let slots = ctx.snapshot(tuple)?;
        let (bucket, cmp) = self.side_keys(side, &TupleView::new(&slots, ctx.facts));
        let old_bucket = match side {
            Side::Left => self.left_keys.get(&tuple),
            Side::Right => self.right_keys.get(&tuple),
        }
        .cloned()
        .ok_or(ScoriaError::TupleNotFound(tuple))?;

        if old_bucket != bucket {
            // The equality key moved: relocate the tuple. Downstream sees
            // the old pairs retract and the new ones insert.
            let mut events = self.retract_side(ctx, side, tuple)?;
            events.extend(self.insert_side(ctx, side, tuple)?);
            return Ok(events);
        }

        let (index, probe) = match side {
            Side::Left => (&mut self.left, &self.right),
            Side::Right => (&mut self.right, &self.left),
        };
        index.update_comparisons(&bucket, tuple, cmp.clone())?;
        let candidates: Vec<(TupleId, Vec<Key>)> = probe
            .bucket(&bucket)
            .map(|(id, keys)| (id, keys.to_vec()))
            .collect();

        // Rematch every candidate in the bucket: pairs can survive, die,
        // or newly form, and surviving pairs refresh their slots.
        let mut events = Vec::new();
        for (other, other_cmp) in candidates {
            let (left, right) = orient(side, tuple, other);
            let passes = self.pair_passes(ctx, side, &cmp, &other_cmp, left, right)?;
            let existing = self.out_by_left.get(&(left, right)).copied();
            match (existing, passes) {
                (Some(out), Some(combined)) => {
                    ctx.refresh(out, combined)?;
                    events.push(OutEvent::new(EventOp::Update, out));
                }
                (Some(out), None) => {
                    self.erase_pair(left, right);
                    ctx.mark_dying(out)?;
                    events.push(OutEvent::new(EventOp::Retract, out));
                }
                (None, Some(combined)) => {
                    let out = ctx.create(combined);
                    self.record_pair(left, right, out);
                    events.push(OutEvent::new(EventOp::Insert, out));
                }
                (None, None) => {}
            }
        }
        Ok(events)
    }
}

// =============================================================================
// EXISTS STORE
// =============================================================================

/// Shared state of one conditional-existence bridge pair.
///
/// For each left tuple the store tracks how many right tuples currently
/// match it, and forwards a clone of the left tuple while the condition
/// holds (`count > 0`, or `count == 0` when negated). Right-side churn
/// that does not flip the condition forwards nothing.
pub struct ExistsStore<F> {
    joiners: CompositeJoiner<F>,
    filter: Option<TuplePredicate<F>>,
    negated: bool,
    left: SideIndex,
    right: SideIndex,
    left_keys: BTreeMap<TupleId, Key>,
    right_keys: BTreeMap<TupleId, Key>,
    /// Lefts each right tuple currently matches. Retract paths consume
    /// this instead of re-evaluating, keeping counts exact under
    /// fact mutation.
    matched: BTreeMap<TupleId, BTreeSet<TupleId>>,
    counts: BTreeMap<TupleId, i64>,
    out: BTreeMap<TupleId, TupleId>,
}

impl<F: PlanningFact> ExistsStore<F> {
    /// Create the store for one exists pair. `negated` selects
    /// `if_not_exists` semantics.
    #[must_use]
    pub fn new(
        joiners: CompositeJoiner<F>,
        filter: Option<TuplePredicate<F>>,
        negated: bool,
    ) -> Self {
        Self {
            joiners,
            filter,
            negated,
            left: SideIndex::new(),
            right: SideIndex::new(),
            left_keys: BTreeMap::new(),
            right_keys: BTreeMap::new(),
            matched: BTreeMap::new(),
            counts: BTreeMap::new(),
            out: BTreeMap::new(),
        }
    }

    fn forwards(&self, count: i64) -> bool {
        if self.negated { count == 0 } else { count > 0 }
    }

    /// Whether a left/right candidate pair matches ordering joiners
    /// and filter.
    fn pair_matches(
        &self,
        ctx: &NetCtx<'_, F>,
        left_cmp: &[Key],
        right_cmp: &[Key],
        left: TupleId,
        right: TupleId,
    ) -> Result<bool, ScoriaError> {
        if !self.joiners.comparisons_match(left_cmp, right_cmp) {
            return Ok(false);
        }
        match &self.filter {
            Some(filter) => {
                let slots = combined_slots(ctx, left, right)?;
                Ok(filter(&TupleView::new(&slots, ctx.facts)))
            }
            None => Ok(true),
        }
    }

    /// Handle one upstream event arriving on the given side.
    pub fn apply(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        side: Side,
        op: EventOp,
        tuple: TupleId,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        match (side, op) {
            (Side::Left, EventOp::Insert) => self.insert_left(ctx, tuple),
            (Side::Left, EventOp::Update) => self.update_left(ctx, tuple),
            (Side::Left, EventOp::Retract) => self.retract_left(ctx, tuple),
            (Side::Right, EventOp::Insert) => self.insert_right(ctx, tuple),
            (Side::Right, EventOp::Update) => self.update_right(ctx, tuple),
            (Side::Right, EventOp::Retract) => self.retract_right(ctx, tuple),
        }
    }

    /// Matching rights for a left tuple, by bucket probe.
    fn matching_rights(
        &self,
        ctx: &NetCtx<'_, F>,
        left: TupleId,
        bucket: &Key,
        left_cmp: &[Key],
    ) -> Result<Vec<TupleId>, ScoriaError> {
        let candidates: Vec<(TupleId, Vec<Key>)> = self
            .right
            .bucket(bucket)
            .map(|(id, keys)| (id, keys.to_vec()))
            .collect();
        let mut rights = Vec::new();
        for (right, right_cmp) in candidates {
            if self.pair_matches(ctx, left_cmp, &right_cmp, left, right)? {
                rights.push(right);
            }
        }
        Ok(rights)
    }

    /// Matching lefts for a right tuple, by bucket probe.
    fn matching_lefts(
        &self,
        ctx: &NetCtx<'_, F>,
        right: TupleId,
        bucket: &Key,
        right_cmp: &[Key],
    ) -> Result<BTreeSet<TupleId>, ScoriaError> {
        let candidates: Vec<(TupleId, Vec<Key>)> = self
            .left
            .bucket(bucket)
            .map(|(id, keys)| (id, keys.to_vec()))
            .collect();
        let mut lefts = BTreeSet::new();
        for (left, left_cmp) in candidates {
            if self.pair_matches(ctx, &left_cmp, right_cmp, left, right)? {
                lefts.insert(left);
            }
        }
        Ok(lefts)
    }

    /// Adjust one left's count and translate a condition flip into an
    /// output event.
    fn shift_count(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        left: TupleId,
        delta: i64,
    ) -> Result<Option<OutEvent>, ScoriaError> {
        let old = *self
            .counts
            .get(&left)
            .ok_or(ScoriaError::TupleNotFound(left))?;
        let new = old.saturating_add(delta);
        self.counts.insert(left, new);
        match (self.forwards(old), self.forwards(new)) {
            (false, true) => {
                let slots = ctx.snapshot(left)?;
                let out = ctx.create(slots);
                self.out.insert(left, out);
                Ok(Some(OutEvent::new(EventOp::Insert, out)))
            }
            (true, false) => {
                let out = self
                    .out
                    .remove(&left)
                    .ok_or(ScoriaError::TupleNotFound(left))?;
                ctx.mark_dying(out)?;
                Ok(Some(OutEvent::new(EventOp::Retract, out)))
            }
            _ => Ok(None),
        }
    }

    fn insert_left(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        tuple: TupleId,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        let slots = ctx.snapshot(tuple)?;
        let view = TupleView::new(&slots, ctx.facts);
        let bucket = self.joiners.left_bucket_key(&view);
        let cmp = self.joiners.left_comparison_keys(&view);
        if self.left_keys.insert(tuple, bucket.clone()).is_some() {
            return Err(ScoriaError::DuplicateTuple(tuple));
        }
        self.left.insert(bucket.clone(), tuple, cmp.clone());

        let rights = self.matching_rights(ctx, tuple, &bucket, &cmp)?;
        let count = i64::try_from(rights.len()).unwrap_or(i64::MAX);
        for right in rights {
            self.matched.entry(right).or_default().insert(tuple);
        }
        self.counts.insert(tuple, count);

        if self.forwards(count) {
            let out = ctx.create(slots);
            self.out.insert(tuple, out);
            return Ok(vec![OutEvent::new(EventOp::Insert, out)]);
        }
        Ok(Vec::new())
    }

    fn retract_left(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        tuple: TupleId,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        let bucket = self
            .left_keys
            .remove(&tuple)
            .ok_or(ScoriaError::TupleNotFound(tuple))?;
        self.left.remove(&bucket, tuple)?;
        for lefts in self.matched.values_mut() {
            lefts.remove(&tuple);
        }
        self.counts
            .remove(&tuple)
            .ok_or(ScoriaError::TupleNotFound(tuple))?;

        if let Some(out) = self.out.remove(&tuple) {
            ctx.mark_dying(out)?;
            return Ok(vec![OutEvent::new(EventOp::Retract, out)]);
        }
        Ok(Vec::new())
    }

    fn update_left(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        tuple: TupleId,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        let slots = ctx.snapshot(tuple)?;
        let view = TupleView::new(&slots, ctx.facts);
        let bucket = self.joiners.left_bucket_key(&view);
        let cmp = self.joiners.left_comparison_keys(&view);
        let old_bucket = self
            .left_keys
            .get(&tuple)
            .cloned()
            .ok_or(ScoriaError::TupleNotFound(tuple))?;
        if old_bucket == bucket {
            self.left.update_comparisons(&bucket, tuple, cmp.clone())?;
        } else {
            self.left.remove(&old_bucket, tuple)?;
            self.left.insert(bucket.clone(), tuple, cmp.clone());
            self.left_keys.insert(tuple, bucket.clone());
        }

        // Full recount: membership in every right's matched set is
        // rebuilt for this left.
        for lefts in self.matched.values_mut() {
            lefts.remove(&tuple);
        }
        let rights = self.matching_rights(ctx, tuple, &bucket, &cmp)?;
        let count = i64::try_from(rights.len()).unwrap_or(i64::MAX);
        for right in rights {
            self.matched.entry(right).or_default().insert(tuple);
        }
        self.counts.insert(tuple, count);

        let was = self.out.get(&tuple).copied();
        match (was, self.forwards(count)) {
            (Some(out), true) => {
                ctx.refresh(out, slots)?;
                Ok(vec![OutEvent::new(EventOp::Update, out)])
            }
            (Some(out), false) => {
                self.out.remove(&tuple);
                ctx.mark_dying(out)?;
                Ok(vec![OutEvent::new(EventOp::Retract, out)])
            }
            (None, true) => {
                let out = ctx.create(slots);
                self.out.insert(tuple, out);
                Ok(vec![OutEvent::new(EventOp::Insert, out)])
            }
            (None, false) => Ok(Vec::new()),
        }
    }

    fn insert_right(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        tuple: TupleId,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        let slots = ctx.snapshot(tuple)?;
        let view = TupleView::new(&slots, ctx.facts);
        let bucket = self.joiners.right_bucket_key(&view);
        let cmp = self.joiners.right_comparison_keys(&view);
        if self.right_keys.insert(tuple, bucket.clone()).is_some() {
            return Err(ScoriaError::DuplicateTuple(tuple));
        }
        self.right.insert(bucket.clone(), tuple, cmp.clone());

        let lefts = self.matching_lefts(ctx, tuple, &bucket, &cmp)?;
        let mut events = Vec::new();
        for left in &lefts {
            if let Some(event) = self.shift_count(ctx, *left, 1)? {
                events.push(event);
            }
        }
        self.matched.insert(tuple, lefts);
        Ok(events)
    }

    fn retract_right(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        tuple: TupleId,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        let bucket = self
            .right_keys
            .remove(&tuple)
            .ok_or(ScoriaError::TupleNotFound(tuple))?;
        self.right.remove(&bucket, tuple)?;
        let lefts = self.matched.remove(&tuple).unwrap_or_default();

        let mut events = Vec::new();
        for left in lefts {
            if let Some(event) = self.shift_count(ctx, left, -1)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn update_right(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        tuple: TupleId,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        let slots = ctx.snapshot(tuple)?;
        let view = TupleView::new(&slots, ctx.facts);
        let bucket = self.joiners.right_bucket_key(&view);
        let cmp = self.joiners.right_comparison_keys(&view);
        let old_bucket = self
            .right_keys
            .get(&tuple)
            .cloned()
            .ok_or(ScoriaError::TupleNotFound(tuple))?;
        if old_bucket == bucket {
            self.right.update_comparisons(&bucket, tuple, cmp.clone())?;
        } else {
            self.right.remove(&old_bucket, tuple)?;
            self.right.insert(bucket.clone(), tuple, cmp.clone());
            self.right_keys.insert(tuple, bucket.clone());
        }

        // Diff the old and new matched sets; lefts matched both before
        // and after see no count change and forward nothing.
        let old_lefts = self.matched.remove(&tuple).unwrap_or_default();
        let new_lefts = self.matching_lefts(ctx, tuple, &bucket, &cmp)?;
        let mut events = Vec::new();
        for left in old_lefts.difference(&new_lefts) {
            if let Some(event) = self.shift_count(ctx, *left, -1)? {
                events.push(event);
            }
        }
        for left in new_lefts.difference(&old_lefts) {
            if let Some(event) = self.shift_count(ctx, *left, 1)? {
                events.push(event);
            }
        }
        self.matched.insert(tuple, new_lefts);
        Ok(events)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::joiner;
    use crate::tuple::TupleArena;
    use crate::{FactId, FactTypeId};
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    struct Shift {
        id: FactId,
        room: i64,
        start: i64,
    }

    impl PlanningFact for Shift {
        fn fact_id(&self) -> FactId {
            self.id
        }
        fn fact_type(&self) -> FactTypeId {
            FactTypeId(1)
        }
    }

    fn shift(id: u64, room: i64, start: i64) -> Shift {
        Shift {
            id: FactId(id),
            room,
            start,
        }
    }

    fn room_joiner() -> CompositeJoiner<Shift> {
        CompositeJoiner::new(vec![joiner::equal_to(
            |t: &TupleView<'_, Shift>| Key::Int(t.fact(0).map_or(0, |s| s.room)),
            |t: &TupleView<'_, Shift>| Key::Int(t.fact(0).map_or(0, |s| s.room)),
        )])
        .expect("joiner list is non-empty")
    }

    struct Rig {
        arena: TupleArena,
        facts: std::collections::BTreeMap<FactId, Shift>,
        dirty: Vec<TupleId>,
    }

    impl Rig {
        fn new(facts: Vec<Shift>) -> Self {
            Self {
                arena: TupleArena::new(),
                facts: facts.into_iter().map(|f| (f.fact_id(), f)).collect(),
                dirty: Vec::new(),
            }
        }

        fn seed(&mut self, fact: u64) -> TupleId {
            self.arena.create(vec![Datum::Fact(FactId(fact))])
        }

        fn ctx(&mut self) -> NetCtx<'_, Shift> {
            NetCtx {
                tuples: &mut self.arena,
                facts: &self.facts,
                dirty: &mut self.dirty,
            }
        }
    }

    #[test]
    fn join_pairs_form_only_inside_equality_bucket() {
        let mut rig = Rig::new(vec![shift(1, 10, 0), shift(2, 10, 5), shift(3, 99, 0)]);
        let t1 = rig.seed(1);
        let t2 = rig.seed(2);
        let t3 = rig.seed(3);
        let mut store = JoinStore::new(room_joiner(), None);

        let mut ctx = rig.ctx();
        assert!(store.apply(&mut ctx, Side::Left, EventOp::Insert, t1).expect("insert").is_empty());
        let events = store.apply(&mut ctx, Side::Right, EventOp::Insert, t2).expect("insert");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, EventOp::Insert);
        let events = store.apply(&mut ctx, Side::Right, EventOp::Insert, t3).expect("insert");
        assert!(events.is_empty());
        assert_eq!(store.pair_count(), 1);
    }

    #[test]
    fn join_retract_tears_down_all_pairs_of_the_side() {
        let mut rig = Rig::new(vec![shift(1, 10, 0), shift(2, 10, 1), shift(3, 10, 2)]);
        let left = rig.seed(1);
        let r1 = rig.seed(2);
        let r2 = rig.seed(3);
        let mut store = JoinStore::new(room_joiner(), None);

        let mut ctx = rig.ctx();
        store.apply(&mut ctx, Side::Left, EventOp::Insert, left).expect("insert");
        store.apply(&mut ctx, Side::Right, EventOp::Insert, r1).expect("insert");
        store.apply(&mut ctx, Side::Right, EventOp::Insert, r2).expect("insert");
        assert_eq!(store.pair_count(), 2);

        let events = store.apply(&mut ctx, Side::Left, EventOp::Retract, left).expect("retract");
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.op == EventOp::Retract));
        assert_eq!(store.pair_count(), 0);
    }

    #[test]
    fn join_update_moving_bucket_retracts_then_reinserts() {
        let mut rig = Rig::new(vec![shift(1, 10, 0), shift(2, 10, 1)]);
        let left = rig.seed(1);
        let right = rig.seed(2);
        let mut store = JoinStore::new(room_joiner(), None);

        {
            let mut ctx = rig.ctx();
            store.apply(&mut ctx, Side::Left, EventOp::Insert, left).expect("insert");
            store.apply(&mut ctx, Side::Right, EventOp::Insert, right).expect("insert");
        }
        assert_eq!(store.pair_count(), 1);

        // Move the left shift's room: the pair dies.
        rig.facts.insert(FactId(1), shift(1, 42, 0));
        let mut ctx = rig.ctx();
        let events = store.apply(&mut ctx, Side::Left, EventOp::Update, left).expect("update");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, EventOp::Retract);
        assert_eq!(store.pair_count(), 0);
    }

    #[test]
    fn join_filter_gates_pair_formation() {
        let close: TuplePredicate<Shift> = Arc::new(|t| {
            let a = t.fact(0).map_or(0, |s| s.start);
            let b = t.fact(1).map_or(0, |s| s.start);
            (a - b).abs() < 3
        });
        let mut rig = Rig::new(vec![shift(1, 10, 0), shift(2, 10, 100)]);
        let left = rig.seed(1);
        let right = rig.seed(2);
        let mut store = JoinStore::new(room_joiner(), Some(close));

        let mut ctx = rig.ctx();
        store.apply(&mut ctx, Side::Left, EventOp::Insert, left).expect("insert");
        let events = store.apply(&mut ctx, Side::Right, EventOp::Insert, right).expect("insert");
        assert!(events.is_empty());

        // Pull the right shift within range: the pair forms on update.
        rig.facts.insert(FactId(2), shift(2, 10, 1));
        let mut ctx = rig.ctx();
        let events = store.apply(&mut ctx, Side::Right, EventOp::Update, right).expect("update");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, EventOp::Insert);
    }

    #[test]
    fn exists_forwards_left_only_while_a_right_matches() {
        let mut rig = Rig::new(vec![shift(1, 10, 0), shift(2, 10, 1)]);
        let left = rig.seed(1);
        let right = rig.seed(2);
        let mut store = ExistsStore::new(room_joiner(), None, false);

        let mut ctx = rig.ctx();
        assert!(store.insert_left(&mut ctx, left).expect("insert").is_empty());

        let events = store.insert_right(&mut ctx, right).expect("insert");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, EventOp::Insert);

        let events = store.retract_right(&mut ctx, right).expect("retract");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, EventOp::Retract);
    }

    #[test]
    fn not_exists_forwards_left_while_no_right_matches() {
        let mut rig = Rig::new(vec![shift(1, 10, 0), shift(2, 10, 1)]);
        let left = rig.seed(1);
        let right = rig.seed(2);
        let mut store = ExistsStore::new(room_joiner(), None, true);

        let mut ctx = rig.ctx();
        let events = store.insert_left(&mut ctx, left).expect("insert");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, EventOp::Insert);

        let events = store.insert_right(&mut ctx, right).expect("insert");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, EventOp::Retract);
    }

    #[test]
    fn exists_right_churn_without_condition_flip_is_silent() {
        let mut rig = Rig::new(vec![shift(1, 10, 0), shift(2, 10, 1), shift(3, 10, 2)]);
        let left = rig.seed(1);
        let r1 = rig.seed(2);
        let r2 = rig.seed(3);
        let mut store = ExistsStore::new(room_joiner(), None, false);

        let mut ctx = rig.ctx();
        store.insert_left(&mut ctx, left).expect("insert");
        store.insert_right(&mut ctx, r1).expect("insert");
        // Second matching right: already forwarded, nothing new.
        assert!(store.insert_right(&mut ctx, r2).expect("insert").is_empty());
        // One of two matching rights leaves: still forwarded.
        assert!(store.retract_right(&mut ctx, r1).expect("retract").is_empty());
        // The last one leaves: condition flips.
        let events = store.retract_right(&mut ctx, r2).expect("retract");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, EventOp::Retract);
    }
}
