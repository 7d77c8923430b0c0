//! # Evaluation Nodes
//!
//! The closed set of node kinds the constraint graph is built from, plus
//! the propagation context their handlers run in.
//!
//! Every node consumes tuple events from upstream and produces events for
//! its children. A node never stores a raw upstream reference: downstream
//! state is keyed by upstream `TupleId`, and every producing node owns its
//! own derived tuples in the session arena. Dispatch over the node kinds
//! is a single exhaustive match in the session's propagation driver.
//!
//! The join- and exists-bridge node state lives in [`crate::bridge`]; the
//! node entry here is just a handle (store index + side) into the shared
//! store, so both bridges of a pair mutate one index structure.

use crate::bridge::Side;
use crate::collector::{AccState, Collector, UndoFold};
use crate::explain::{ConstraintId, Scoreboard};
use crate::score::Score;
use crate::tuple::{
    Datum, JustificationFn, MatchWeigher, TupleArena, TupleKeyFn, TuplePredicate, TupleView,
};
use crate::{
    ConstraintMatchId, FactId, FactTypeId, Key, NodeIndex, PlanningFact, ScoriaError, TupleId,
    TupleState,
};
use std::collections::BTreeMap;
use std::marker::PhantomData;

// =============================================================================
// EVENTS & CONTEXT
// =============================================================================

/// The three tuple event kinds that flow along graph edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOp {
    /// A new tuple appeared upstream.
    Insert,
    /// An existing upstream tuple changed in place (same identity).
    Update,
    /// An upstream tuple is going away.
    Retract,
}

/// One event a node emits for all of its children.
#[derive(Debug, Clone, Copy)]
pub struct OutEvent {
    /// What happened to the tuple.
    pub op: EventOp,
    /// The emitting node's own tuple the event is about.
    pub tuple: TupleId,
}

impl OutEvent {
    /// Shorthand constructor.
    #[must_use]
    pub fn new(op: EventOp, tuple: TupleId) -> Self {
        Self { op, tuple }
    }
}

/// The mutable network state a node handler runs against.
///
/// Split borrows over the session's arenas: the tuple arena and dirty
/// list are written, the fact store is read-only during propagation.
pub struct NetCtx<'a, F> {
    /// The session tuple arena.
    pub tuples: &'a mut TupleArena,
    /// The session fact store, read-only while propagating.
    pub facts: &'a BTreeMap<FactId, F>,
    /// Tuples whose state must be settled when the batch ends.
    pub dirty: &'a mut Vec<TupleId>,
}

impl<F: PlanningFact> NetCtx<'_, F> {
    /// Allocate a derived tuple in state `Creating` and mark it dirty.
    pub fn create(&mut self, slots: Vec<Datum>) -> TupleId {
        let id = self.tuples.create(slots);
        self.dirty.push(id);
        id
    }

    /// Clone a tuple's slots for evaluation.
    pub fn snapshot(&self, id: TupleId) -> Result<Vec<Datum>, ScoriaError> {
        Ok(self.tuples.get(id)?.slots.clone())
    }

    /// Replace a tuple's slots and flag it as updated in this batch.
    ///
    /// A tuple still in `Creating` stays `Creating`: it was born and
    /// modified in the same batch and settles to `Ok` either way.
    pub fn refresh(&mut self, id: TupleId, slots: Vec<Datum>) -> Result<(), ScoriaError> {
        let tuple = self.tuples.get_mut(id)?;
        tuple.slots = slots;
        if tuple.state == TupleState::Ok {
            tuple.state = TupleState::Updating;
            self.dirty.push(id);
        }
        Ok(())
    }

    /// Flag a tuple as going away; it is removed when the batch settles.
    pub fn mark_dying(&mut self, id: TupleId) -> Result<(), ScoriaError> {
        let tuple = self.tuples.get_mut(id)?;
        tuple.state = TupleState::Dying;
        self.dirty.push(id);
        Ok(())
    }
}

// =============================================================================
// SOURCE NODE
// =============================================================================

/// Graph entry point for one subscribed fact type.
///
/// Update strategy: a fact update propagates as a true in-place `Update`
/// of the same tuple row, never as retract-plus-reinsert. This holds
/// uniformly for the whole graph, so downstream aggregation sees a single
/// modify instead of an add/remove pair.
pub struct SourceNode {
    /// The fact type this source subscribes to.
    pub fact_type: FactTypeId,
    /// Downstream nodes, in attachment order.
    pub children: Vec<NodeIndex>,
    rows: BTreeMap<FactId, TupleId>,
}

impl SourceNode {
    /// Create a source for a fact type with no children yet.
    #[must_use]
    pub fn new(fact_type: FactTypeId) -> Self {
        Self {
            fact_type,
            children: Vec::new(),
            rows: BTreeMap::new(),
        }
    }

    /// A fact of the subscribed type was inserted.
    pub fn insert_fact<F: PlanningFact>(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        fact: FactId,
    ) -> Result<OutEvent, ScoriaError> {
        if self.rows.contains_key(&fact) {
            return Err(ScoriaError::FactAlreadyInserted(fact));
        }
        let tuple = ctx.create(vec![Datum::Fact(fact)]);
        self.rows.insert(fact, tuple);
        Ok(OutEvent::new(EventOp::Insert, tuple))
    }

    /// A fact of the subscribed type changed in place.
    pub fn update_fact<F: PlanningFact>(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        fact: FactId,
    ) -> Result<OutEvent, ScoriaError> {
        let tuple = *self
            .rows
            .get(&fact)
            .ok_or(ScoriaError::FactNotFound(fact))?;
        // Same row, same slots; only the fact behind the slot changed.
        let slots = ctx.snapshot(tuple)?;
        ctx.refresh(tuple, slots)?;
        Ok(OutEvent::new(EventOp::Update, tuple))
    }

    /// A fact of the subscribed type was retracted. Retracting a fact that
    /// was never inserted, or twice, is a fatal caller bug.
    pub fn retract_fact<F: PlanningFact>(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        fact: FactId,
    ) -> Result<OutEvent, ScoriaError> {
        let tuple = self
            .rows
            .remove(&fact)
            .ok_or(ScoriaError::FactNotFound(fact))?;
        ctx.mark_dying(tuple)?;
        Ok(OutEvent::new(EventOp::Retract, tuple))
    }
}

// =============================================================================
// FILTER NODE
// =============================================================================

/// Predicate gate over one upstream chain.
///
/// The four-way update table: true→true forwards an update, false→false
/// is a no-op, true→false retracts, false→true inserts.
pub struct FilterNode<F> {
    /// Downstream nodes, in attachment order.
    pub children: Vec<NodeIndex>,
    predicate: TuplePredicate<F>,
    passed: BTreeMap<TupleId, TupleId>,
}

impl<F: PlanningFact> FilterNode<F> {
    /// Create a filter with the given predicate.
    #[must_use]
    pub fn new(predicate: TuplePredicate<F>) -> Self {
        Self {
            children: Vec::new(),
            predicate,
            passed: BTreeMap::new(),
        }
    }

    /// Handle one upstream event.
    pub fn apply(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        op: EventOp,
        upstream: TupleId,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        match op {
            EventOp::Insert => {
                let slots = ctx.snapshot(upstream)?;
                if !(self.predicate)(&TupleView::new(&slots, ctx.facts)) {
                    return Ok(Vec::new());
                }
                let out = ctx.create(slots);
                if self.passed.insert(upstream, out).is_some() {
                    return Err(ScoriaError::DuplicateTuple(upstream));
                }
                Ok(vec![OutEvent::new(EventOp::Insert, out)])
            }
            EventOp::Update => {
                let slots = ctx.snapshot(upstream)?;
                let passes = (self.predicate)(&TupleView::new(&slots, ctx.facts));
                match (self.passed.get(&upstream).copied(), passes) {
                    (Some(out), true) => {
                        ctx.refresh(out, slots)?;
                        Ok(vec![OutEvent::new(EventOp::Update, out)])
                    }
                    (Some(out), false) => {
                        self.passed.remove(&upstream);
                        ctx.mark_dying(out)?;
                        Ok(vec![OutEvent::new(EventOp::Retract, out)])
                    }
                    (None, true) => {
                        let out = ctx.create(slots);
                        self.passed.insert(upstream, out);
                        Ok(vec![OutEvent::new(EventOp::Insert, out)])
                    }
                    (None, false) => Ok(Vec::new()),
                }
            }
            EventOp::Retract => match self.passed.remove(&upstream) {
                Some(out) => {
                    ctx.mark_dying(out)?;
                    Ok(vec![OutEvent::new(EventOp::Retract, out)])
                }
                // The tuple never made it through the predicate.
                None => Ok(Vec::new()),
            },
        }
    }
}

// =============================================================================
// GROUP NODE
// =============================================================================

/// Per-group bookkeeping: accumulators, one undo set per contributing
/// upstream tuple, and the forwarded group-result tuple.
struct GroupState {
    accs: Vec<AccState>,
    undos: BTreeMap<TupleId, Vec<UndoFold>>,
    out: TupleId,
    key_parts: Vec<Key>,
    last_results: Vec<Key>,
}

/// Aggregation node: groups upstream tuples by key mappings and maintains
/// one accumulator per collector per distinct group key.
pub struct GroupNode<F> {
    /// Downstream nodes, in attachment order.
    pub children: Vec<NodeIndex>,
    key_mappings: Vec<TupleKeyFn<F>>,
    collectors: Vec<Collector<F>>,
    groups: BTreeMap<Key, GroupState>,
    by_tuple: BTreeMap<TupleId, Key>,
}

/// Fold one tuple into every accumulator, collecting the undo set.
fn fold_in<F: PlanningFact>(
    collectors: &[Collector<F>],
    accs: &mut [AccState],
    view: &TupleView<'_, F>,
) -> Result<Vec<UndoFold>, ScoriaError> {
    collectors
        .iter()
        .zip(accs.iter_mut())
        .map(|(collector, acc)| collector.accumulate(acc, view))
        .collect()
}

/// Run every collector's finisher over the group's accumulators.
fn finish_all<F: PlanningFact>(
    collectors: &[Collector<F>],
    accs: &[AccState],
) -> Result<Vec<Key>, ScoriaError> {
    collectors
        .iter()
        .zip(accs.iter())
        .map(|(collector, acc)| collector.finish(acc))
        .collect()
}

/// The slots of a group-result tuple: key parts, then finisher results.
///
/// A fact-identity key stays a fact slot, so downstream views resolve
/// the grouped fact's fields and default justifications still name it.
fn group_slots(key_parts: &[Key], results: &[Key]) -> Vec<Datum> {
    key_parts
        .iter()
        .chain(results.iter())
        .cloned()
        .map(|key| match key {
            Key::Fact(id) => Datum::Fact(id),
            other => Datum::Value(other),
        })
        .collect()
}

impl<F: PlanningFact> GroupNode<F> {
    /// Create a group node. The model validated the shape already.
    #[must_use]
    pub fn new(key_mappings: Vec<TupleKeyFn<F>>, collectors: Vec<Collector<F>>) -> Self {
        Self {
            children: Vec::new(),
            key_mappings,
            collectors,
            groups: BTreeMap::new(),
            by_tuple: BTreeMap::new(),
        }
    }

    fn keys_of(&self, view: &TupleView<'_, F>) -> (Vec<Key>, Key) {
        let parts: Vec<Key> = self.key_mappings.iter().map(|m| m(view)).collect();
        let composite = Key::composite(parts.clone());
        (parts, composite)
    }

    /// Handle one upstream event.
    pub fn apply(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        op: EventOp,
        upstream: TupleId,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        match op {
            EventOp::Insert => self.add_contribution(ctx, upstream),
            EventOp::Retract => self.drop_contribution(ctx, upstream),
            EventOp::Update => {
                let old_key = self
                    .by_tuple
                    .get(&upstream)
                    .cloned()
                    .ok_or(ScoriaError::TupleNotFound(upstream))?;
                let slots = ctx.snapshot(upstream)?;
                let (_, new_key) = self.keys_of(&TupleView::new(&slots, ctx.facts));
                if old_key == new_key {
                    self.refold_in_place(ctx, upstream, &old_key)
                } else {
                    // Group migration: the contribution moves between groups.
                    let mut events = self.drop_contribution(ctx, upstream)?;
                    events.extend(self.add_contribution(ctx, upstream)?);
                    Ok(events)
                }
            }
        }
    }

    fn add_contribution(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        upstream: TupleId,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        let slots = ctx.snapshot(upstream)?;
        let view = TupleView::new(&slots, ctx.facts);
        let (key_parts, key) = self.keys_of(&view);
        self.by_tuple.insert(upstream, key.clone());

        if let Some(state) = self.groups.get_mut(&key) {
            let undos = fold_in(&self.collectors, &mut state.accs, &view)?;
            if state.undos.insert(upstream, undos).is_some() {
                return Err(ScoriaError::DuplicateTuple(upstream));
            }
            let results = finish_all(&self.collectors, &state.accs)?;
            if results == state.last_results {
                return Ok(Vec::new());
            }
            state.last_results = results.clone();
            let out = state.out;
            ctx.refresh(out, group_slots(&state.key_parts, &results))?;
            Ok(vec![OutEvent::new(EventOp::Update, out)])
        } else {
            let mut accs: Vec<AccState> = self.collectors.iter().map(Collector::supply).collect();
            let undos = fold_in(&self.collectors, &mut accs, &view)?;
            let results = finish_all(&self.collectors, &accs)?;
            let out = ctx.create(group_slots(&key_parts, &results));
            let mut contributor_undos = BTreeMap::new();
            contributor_undos.insert(upstream, undos);
            self.groups.insert(
                key,
                GroupState {
                    accs,
                    undos: contributor_undos,
                    out,
                    key_parts,
                    last_results: results,
                },
            );
            Ok(vec![OutEvent::new(EventOp::Insert, out)])
        }
    }

    fn drop_contribution(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        upstream: TupleId,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        let key = self
            .by_tuple
            .remove(&upstream)
            .ok_or(ScoriaError::TupleNotFound(upstream))?;
        let state = self
            .groups
            .get_mut(&key)
            .ok_or(ScoriaError::TupleNotFound(upstream))?;
        let undos = state
            .undos
            .remove(&upstream)
            .ok_or(ScoriaError::TupleNotFound(upstream))?;
        run_undos(undos, &mut state.accs)?;

        if state.undos.is_empty() {
            // Last contributor gone: the group itself goes away.
            let out = state.out;
            self.groups.remove(&key);
            ctx.mark_dying(out)?;
            return Ok(vec![OutEvent::new(EventOp::Retract, out)]);
        }

        let results = finish_all(&self.collectors, &state.accs)?;
        if results == state.last_results {
            return Ok(Vec::new());
        }
        state.last_results = results.clone();
        let out = state.out;
        let slots = group_slots(&state.key_parts, &results);
        ctx.refresh(out, slots)?;
        Ok(vec![OutEvent::new(EventOp::Update, out)])
    }

    fn refold_in_place(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        upstream: TupleId,
        key: &Key,
    ) -> Result<Vec<OutEvent>, ScoriaError> {
        let slots = ctx.snapshot(upstream)?;
        let view = TupleView::new(&slots, ctx.facts);
        let state = self
            .groups
            .get_mut(key)
            .ok_or(ScoriaError::TupleNotFound(upstream))?;
        let undos = state
            .undos
            .remove(&upstream)
            .ok_or(ScoriaError::TupleNotFound(upstream))?;
        run_undos(undos, &mut state.accs)?;
        let undos = fold_in(&self.collectors, &mut state.accs, &view)?;
        state.undos.insert(upstream, undos);

        let results = finish_all(&self.collectors, &state.accs)?;
        if results == state.last_results {
            return Ok(Vec::new());
        }
        state.last_results = results.clone();
        let out = state.out;
        let out_slots = group_slots(&state.key_parts, &results);
        ctx.refresh(out, out_slots)?;
        Ok(vec![OutEvent::new(EventOp::Update, out)])
    }
}

/// Run a contributor's undo set. Undos align with `accs` in collector
/// order, one per accumulator.
fn run_undos(undos: Vec<UndoFold>, accs: &mut [AccState]) -> Result<(), ScoriaError> {
    for (undo, acc) in undos.into_iter().zip(accs.iter_mut()) {
        undo(acc)?;
    }
    Ok(())
}

// =============================================================================
// SCORING NODE
// =============================================================================

/// Per-matched-tuple scoring bookkeeping.
struct ScoreEntry<S> {
    contribution: S,
    match_id: Option<ConstraintMatchId>,
    justification: Vec<FactId>,
}

/// Terminal node of a constraint's chain: converts matching tuples into
/// weighted score contributions and, when tracking is enabled,
/// explanation records.
pub struct ScoringNode<F, S> {
    /// The constraint this node scores.
    pub constraint: ConstraintId,
    weight: S,
    negate: bool,
    weigher: Option<MatchWeigher<F>>,
    justifier: Option<JustificationFn<F>>,
    entries: BTreeMap<TupleId, ScoreEntry<S>>,
    score: S,
    _facts: PhantomData<fn(F)>,
}

impl<F: PlanningFact, S: Score> ScoringNode<F, S> {
    /// Create a scoring node. `negate` subtracts (penalize); otherwise the
    /// weight is added (reward).
    #[must_use]
    pub fn new(
        constraint: ConstraintId,
        weight: S,
        negate: bool,
        weigher: Option<MatchWeigher<F>>,
        justifier: Option<JustificationFn<F>>,
    ) -> Self {
        Self {
            constraint,
            weight,
            negate,
            weigher,
            justifier,
            entries: BTreeMap::new(),
            score: S::zero(),
            _facts: PhantomData,
        }
    }

    /// The running score of this constraint, maintained incrementally.
    #[must_use]
    pub fn score(&self) -> S {
        self.score
    }

    /// Handle one upstream event. Terminal: emits nothing downstream.
    ///
    /// `Update` is retract-then-insert of the bookkeeping entry:
    /// correctness under re-weighting takes priority over saving the
    /// extra lookups.
    pub fn apply(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        scoreboard: &mut Scoreboard<S>,
        op: EventOp,
        upstream: TupleId,
    ) -> Result<(), ScoriaError> {
        match op {
            EventOp::Insert => self.add_match(ctx, scoreboard, upstream),
            EventOp::Retract => self.remove_match(scoreboard, upstream),
            EventOp::Update => {
                self.remove_match(scoreboard, upstream)?;
                self.add_match(ctx, scoreboard, upstream)
            }
        }
    }

    fn add_match(
        &mut self,
        ctx: &mut NetCtx<'_, F>,
        scoreboard: &mut Scoreboard<S>,
        upstream: TupleId,
    ) -> Result<(), ScoriaError> {
        if self.entries.contains_key(&upstream) {
            return Err(ScoriaError::DuplicateTuple(upstream));
        }
        let slots = ctx.snapshot(upstream)?;
        let view = TupleView::new(&slots, ctx.facts);
        let multiplier = self.weigher.as_ref().map_or(1, |weigher| weigher(&view));
        let signed = if self.negate {
            multiplier.saturating_neg()
        } else {
            multiplier
        };
        let contribution = self.weight.scale(signed);
        self.score = self.score + contribution;

        let justification = self
            .justifier
            .as_ref()
            .map_or_else(|| view.fact_ids(), |justify| justify(&view));
        let match_id = scoreboard.is_tracking().then(|| {
            scoreboard.record_match(&self.constraint, justification.clone(), contribution)
        });
        self.entries.insert(
            upstream,
            ScoreEntry {
                contribution,
                match_id,
                justification,
            },
        );
        Ok(())
    }

    fn remove_match(
        &mut self,
        scoreboard: &mut Scoreboard<S>,
        upstream: TupleId,
    ) -> Result<(), ScoriaError> {
        let entry = self
            .entries
            .remove(&upstream)
            .ok_or(ScoriaError::TupleNotFound(upstream))?;
        self.score = self.score - entry.contribution;
        if let Some(match_id) = entry.match_id {
            scoreboard.retract_match(match_id, &self.constraint, &entry.justification)?;
        }
        Ok(())
    }
}

// =============================================================================
// NODE KIND
// =============================================================================

/// A bridge node entry: one handle of a join or exists pair.
pub struct BridgeRef {
    /// Index into the session's store arena for this pair.
    pub store: usize,
    /// Which side of the pair this node feeds.
    pub side: Side,
    /// Downstream nodes, in attachment order. Both bridges of a pair
    /// carry the same children.
    pub children: Vec<NodeIndex>,
}

/// The closed set of node kinds. Exhaustively matched in the session's
/// propagation driver.
pub enum NodeKind<F, S> {
    /// Graph entry point per subscribed fact type.
    Source(SourceNode),
    /// Predicate gate.
    Filter(FilterNode<F>),
    /// One side of a join pair sharing a `JoinStore`.
    JoinBridge(BridgeRef),
    /// One side of a conditional-existence pair sharing an `ExistsStore`.
    ExistsBridge(BridgeRef),
    /// Group-by with collectors.
    Group(GroupNode<F>),
    /// Terminal constraint scorer.
    Scoring(ScoringNode<F, S>),
}

impl<F, S> NodeKind<F, S> {
    /// The downstream nodes this node's output events fan out to.
    #[must_use]
    pub fn children(&self) -> &[NodeIndex] {
        match self {
            Self::Source(node) => &node.children,
            Self::Filter(node) => &node.children,
            Self::JoinBridge(node) | Self::ExistsBridge(node) => &node.children,
            Self::Group(node) => &node.children,
            Self::Scoring(_) => &[],
        }
    }

    /// Register a downstream node.
    pub fn attach_child(&mut self, child: NodeIndex) {
        match self {
            Self::Source(node) => node.children.push(child),
            Self::Filter(node) => node.children.push(child),
            Self::JoinBridge(node) | Self::ExistsBridge(node) => node.children.push(child),
            Self::Group(node) => node.children.push(child),
            Self::Scoring(_) => {}
        }
    }

    /// A short display name for diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Source(_) => "source",
            Self::Filter(_) => "filter",
            Self::JoinBridge(_) => "join-bridge",
            Self::ExistsBridge(_) => "exists-bridge",
            Self::Group(_) => "group",
            Self::Scoring(_) => "scoring",
        }
    }
}
