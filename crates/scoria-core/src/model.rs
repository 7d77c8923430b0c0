//! # Constraint Model
//!
//! The build-time definition of a constraint network: a list of stream
//! definitions (each referring back to earlier ones by [`StreamId`]) and
//! the constraints terminating them.
//!
//! Definition order is compilation order. [`ConstraintModel::build_session`]
//! lowers the definitions into the node arena front to back, so every
//! node's index is strictly greater than its parents' indices. The
//! session's batch queue drains in ascending index order, which makes
//! that property the whole scheduling story: a parent always finishes
//! its events before a child starts. Building the same model twice
//! yields an identical topology.

use crate::bridge::{ExistsStore, JoinStore, Side};
use crate::collector::Collector;
use crate::explain::{ConstraintId, Scoreboard};
use crate::joiner::{self, CompositeJoiner, Joiner};
use crate::node::{BridgeRef, FilterNode, GroupNode, NodeKind, ScoringNode, SourceNode};
use crate::primitives::{MAX_GROUP_COLLECTORS, MAX_GROUP_KEY_MAPPINGS, MAX_TUPLE_ARITY};
use crate::score::Score;
use crate::session::Session;
use crate::tuple::{JustificationFn, MatchWeigher, TupleKeyFn, TuplePredicate, TupleView};
use crate::{FactId, FactTypeId, Key, NodeIndex, PlanningFact, ScoriaError, StreamId};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// STREAM DEFINITIONS
// =============================================================================

enum StreamDef<F> {
    Source {
        fact_type: FactTypeId,
    },
    Filter {
        parent: StreamId,
        predicate: TuplePredicate<F>,
    },
    Join {
        left: StreamId,
        right: StreamId,
        joiners: CompositeJoiner<F>,
        filter: Option<TuplePredicate<F>>,
    },
    Exists {
        parent: StreamId,
        partner: StreamId,
        joiners: CompositeJoiner<F>,
        filter: Option<TuplePredicate<F>>,
        negated: bool,
    },
    Group {
        parent: StreamId,
        key_mappings: Vec<TupleKeyFn<F>>,
        collectors: Vec<Collector<F>>,
    },
}

struct ConstraintDef<F, S> {
    stream: StreamId,
    constraint: ConstraintId,
    weight: S,
    negate: bool,
    weigher: Option<MatchWeigher<F>>,
    justifier: Option<JustificationFn<F>>,
}

// =============================================================================
// MODEL
// =============================================================================

/// Build-time definition of a constraint network.
///
/// A model is immutable once sessions are built from it and can build
/// any number of independent sessions.
pub struct ConstraintModel<F, S> {
    streams: Vec<StreamDef<F>>,
    arities: Vec<usize>,
    constraints: Vec<ConstraintDef<F, S>>,
}

impl<F: PlanningFact, S: Score> Default for ConstraintModel<F, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: PlanningFact, S: Score> ConstraintModel<F, S> {
    /// An empty model.
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
            arities: Vec::new(),
            constraints: Vec::new(),
        }
    }

    fn push_stream(&mut self, def: StreamDef<F>, arity: usize) -> StreamId {
        let id = StreamId(self.streams.len());
        self.streams.push(def);
        self.arities.push(arity);
        id
    }

    fn check_stream(&self, stream: StreamId) -> Result<usize, ScoriaError> {
        self.arities
            .get(stream.0)
            .copied()
            .ok_or(ScoriaError::UnknownStream(stream))
    }

    /// A stream of one tuple per live fact of the given type.
    pub fn for_each(&mut self, fact_type: FactTypeId) -> StreamId {
        self.push_stream(StreamDef::Source { fact_type }, 1)
    }

    /// A stream of each unordered pair of distinct facts of one type
    /// matching the joiners, seen exactly once per pair.
    ///
    /// Implemented as a self-join with an extra `LessThan` condition on
    /// fact identity, so `(a, b)` and `(b, a)` collapse to the ordered
    /// one.
    pub fn for_each_unique_pair(
        &mut self,
        fact_type: FactTypeId,
        joiners: Vec<Joiner<F>>,
    ) -> Result<StreamId, ScoriaError> {
        let source = self.for_each(fact_type);
        let identity = joiner::less_than(
            |view: &TupleView<'_, F>| Key::Fact(view.fact_id(0).unwrap_or(FactId(0))),
            |view: &TupleView<'_, F>| Key::Fact(view.fact_id(0).unwrap_or(FactId(0))),
        );
        // Seeded with the identity condition, so an empty joiner list
        // means every unordered pair rather than a configuration error.
        let mut composite = CompositeJoiner::new(vec![identity])?;
        for joiner in joiners {
            composite = composite.and(joiner);
        }
        self.join_composite(source, source, composite, None)
    }

    /// Keep only tuples matching the predicate.
    pub fn filter(
        &mut self,
        parent: StreamId,
        predicate: impl Fn(&TupleView<'_, F>) -> bool + Send + Sync + 'static,
    ) -> Result<StreamId, ScoriaError> {
        let arity = self.check_stream(parent)?;
        Ok(self.push_stream(
            StreamDef::Filter {
                parent,
                predicate: Arc::new(predicate),
            },
            arity,
        ))
    }

    /// Join two streams on the given conditions. The output tuple is the
    /// left slots followed by the right slots.
    pub fn join(
        &mut self,
        left: StreamId,
        right: StreamId,
        joiners: Vec<Joiner<F>>,
    ) -> Result<StreamId, ScoriaError> {
        self.join_composite(left, right, CompositeJoiner::new(joiners)?, None)
    }

    /// Join with an additional predicate over the combined tuple.
    pub fn join_filtered(
        &mut self,
        left: StreamId,
        right: StreamId,
        joiners: Vec<Joiner<F>>,
        filter: impl Fn(&TupleView<'_, F>) -> bool + Send + Sync + 'static,
    ) -> Result<StreamId, ScoriaError> {
        self.join_composite(
            left,
            right,
            CompositeJoiner::new(joiners)?,
            Some(Arc::new(filter) as TuplePredicate<F>),
        )
    }

    fn join_composite(
        &mut self,
        left: StreamId,
        right: StreamId,
        joiners: CompositeJoiner<F>,
        filter: Option<TuplePredicate<F>>,
    ) -> Result<StreamId, ScoriaError> {
        let left_arity = self.check_stream(left)?;
        let right_arity = self.check_stream(right)?;
        let arity = left_arity.saturating_add(right_arity);
        if arity > MAX_TUPLE_ARITY {
            return Err(ScoriaError::ArityOverflow {
                left: left_arity,
                right: right_arity,
                max: MAX_TUPLE_ARITY,
            });
        }
        Ok(self.push_stream(
            StreamDef::Join {
                left,
                right,
                joiners,
                filter,
            },
            arity,
        ))
    }

    /// Keep parent tuples for which at least one partner tuple matches
    /// the conditions. The parent tuple passes through unchanged.
    pub fn if_exists(
        &mut self,
        parent: StreamId,
        partner: StreamId,
        joiners: Vec<Joiner<F>>,
    ) -> Result<StreamId, ScoriaError> {
        self.exists(parent, partner, joiners, None, false)
    }

    /// Keep parent tuples for which no partner tuple matches.
    pub fn if_not_exists(
        &mut self,
        parent: StreamId,
        partner: StreamId,
        joiners: Vec<Joiner<F>>,
    ) -> Result<StreamId, ScoriaError> {
        self.exists(parent, partner, joiners, None, true)
    }

    /// `if_exists` with an extra predicate over the (parent, partner)
    /// candidate pair.
    pub fn if_exists_filtered(
        &mut self,
        parent: StreamId,
        partner: StreamId,
        joiners: Vec<Joiner<F>>,
        filter: impl Fn(&TupleView<'_, F>) -> bool + Send + Sync + 'static,
    ) -> Result<StreamId, ScoriaError> {
        self.exists(
            parent,
            partner,
            joiners,
            Some(Arc::new(filter) as TuplePredicate<F>),
            false,
        )
    }

    /// `if_not_exists` with an extra predicate over the candidate pair.
    pub fn if_not_exists_filtered(
        &mut self,
        parent: StreamId,
        partner: StreamId,
        joiners: Vec<Joiner<F>>,
        filter: impl Fn(&TupleView<'_, F>) -> bool + Send + Sync + 'static,
    ) -> Result<StreamId, ScoriaError> {
        self.exists(
            parent,
            partner,
            joiners,
            Some(Arc::new(filter) as TuplePredicate<F>),
            true,
        )
    }

    fn exists(
        &mut self,
        parent: StreamId,
        partner: StreamId,
        joiners: Vec<Joiner<F>>,
        filter: Option<TuplePredicate<F>>,
        negated: bool,
    ) -> Result<StreamId, ScoriaError> {
        let parent_arity = self.check_stream(parent)?;
        let partner_arity = self.check_stream(partner)?;
        if parent_arity.saturating_add(partner_arity) > MAX_TUPLE_ARITY {
            return Err(ScoriaError::ArityOverflow {
                left: parent_arity,
                right: partner_arity,
                max: MAX_TUPLE_ARITY,
            });
        }
        let joiners = CompositeJoiner::new(joiners)?;
        Ok(self.push_stream(
            StreamDef::Exists {
                parent,
                partner,
                joiners,
                filter,
                negated,
            },
            parent_arity,
        ))
    }

    /// Group the parent stream by the key mappings and aggregate each
    /// group with the collectors. The output tuple carries the key
    /// values followed by the finisher results.
    pub fn group_by(
        &mut self,
        parent: StreamId,
        key_mappings: Vec<TupleKeyFn<F>>,
        collectors: Vec<Collector<F>>,
    ) -> Result<StreamId, ScoriaError> {
        self.check_stream(parent)?;
        if key_mappings.is_empty() && collectors.is_empty() {
            return Err(ScoriaError::EmptyGroupBy);
        }
        let arity = key_mappings.len().saturating_add(collectors.len());
        if key_mappings.len() > MAX_GROUP_KEY_MAPPINGS
            || collectors.len() > MAX_GROUP_COLLECTORS
            || arity > MAX_TUPLE_ARITY
        {
            return Err(ScoriaError::CollectorLimit {
                mappings: key_mappings.len(),
                collectors: collectors.len(),
            });
        }
        Ok(self.push_stream(
            StreamDef::Group {
                parent,
                key_mappings,
                collectors,
            },
            arity,
        ))
    }

    /// Subtract the weight from the score once per matching tuple.
    pub fn penalize(
        &mut self,
        stream: StreamId,
        constraint: ConstraintId,
        weight: S,
    ) -> Result<(), ScoriaError> {
        self.impact(stream, constraint, weight, true, None, None)
    }

    /// Penalize with a per-match integer multiplier.
    pub fn penalize_weighted(
        &mut self,
        stream: StreamId,
        constraint: ConstraintId,
        weight: S,
        weigher: impl Fn(&TupleView<'_, F>) -> i64 + Send + Sync + 'static,
    ) -> Result<(), ScoriaError> {
        self.impact(stream, constraint, weight, true, Some(Arc::new(weigher)), None)
    }

    /// Add the weight to the score once per matching tuple.
    pub fn reward(
        &mut self,
        stream: StreamId,
        constraint: ConstraintId,
        weight: S,
    ) -> Result<(), ScoriaError> {
        self.impact(stream, constraint, weight, false, None, None)
    }

    /// Reward with a per-match integer multiplier.
    pub fn reward_weighted(
        &mut self,
        stream: StreamId,
        constraint: ConstraintId,
        weight: S,
        weigher: impl Fn(&TupleView<'_, F>) -> i64 + Send + Sync + 'static,
    ) -> Result<(), ScoriaError> {
        self.impact(stream, constraint, weight, false, Some(Arc::new(weigher)), None)
    }

    /// The fully general constraint terminator. `negate` subtracts the
    /// weight; the justifier overrides the default justification (all
    /// fact slots of the matching tuple).
    pub fn impact(
        &mut self,
        stream: StreamId,
        constraint: ConstraintId,
        weight: S,
        negate: bool,
        weigher: Option<MatchWeigher<F>>,
        justifier: Option<JustificationFn<F>>,
    ) -> Result<(), ScoriaError> {
        self.check_stream(stream)?;
        if self.constraints.iter().any(|def| def.constraint == constraint) {
            return Err(ScoriaError::MalformedConstraint(format!(
                "constraint {constraint} is registered twice"
            )));
        }
        self.constraints.push(ConstraintDef {
            stream,
            constraint,
            weight,
            negate,
            weigher,
            justifier,
        });
        Ok(())
    }

    // =========================================================================
    // COMPILATION
    // =========================================================================

    /// Compile the model into a fresh, empty session.
    ///
    /// `match_tracking` enables per-constraint match totals and per-fact
    /// indictments at the cost of bookkeeping per match.
    pub fn build_session(&self, match_tracking: bool) -> Result<Session<F, S>, ScoriaError> {
        let mut nodes: Vec<NodeKind<F, S>> = Vec::new();
        let mut join_stores: Vec<JoinStore<F>> = Vec::new();
        let mut exists_stores: Vec<ExistsStore<F>> = Vec::new();
        // Per stream: the node(s) downstream consumers attach to. Join
        // and exists streams expose both bridges; their events merge.
        let mut outlets: Vec<Vec<NodeIndex>> = Vec::new();

        for def in &self.streams {
            match def {
                StreamDef::Source { fact_type } => {
                    let index = NodeIndex(nodes.len());
                    nodes.push(NodeKind::Source(SourceNode::new(*fact_type)));
                    outlets.push(vec![index]);
                }
                StreamDef::Filter { parent, predicate } => {
                    let index = NodeIndex(nodes.len());
                    nodes.push(NodeKind::Filter(FilterNode::new(Arc::clone(predicate))));
                    attach(&mut nodes, &outlets[parent.0], index);
                    outlets.push(vec![index]);
                }
                StreamDef::Join {
                    left,
                    right,
                    joiners,
                    filter,
                } => {
                    let store = join_stores.len();
                    join_stores.push(JoinStore::new(joiners.clone(), filter.clone()));
                    let left_index = NodeIndex(nodes.len());
                    nodes.push(NodeKind::JoinBridge(BridgeRef {
                        store,
                        side: Side::Left,
                        children: Vec::new(),
                    }));
                    let right_index = NodeIndex(nodes.len());
                    nodes.push(NodeKind::JoinBridge(BridgeRef {
                        store,
                        side: Side::Right,
                        children: Vec::new(),
                    }));
                    attach(&mut nodes, &outlets[left.0], left_index);
                    attach(&mut nodes, &outlets[right.0], right_index);
                    outlets.push(vec![left_index, right_index]);
                }
                StreamDef::Exists {
                    parent,
                    partner,
                    joiners,
                    filter,
                    negated,
                } => {
                    let store = exists_stores.len();
                    exists_stores.push(ExistsStore::new(
                        joiners.clone(),
                        filter.clone(),
                        *negated,
                    ));
                    let left_index = NodeIndex(nodes.len());
                    nodes.push(NodeKind::ExistsBridge(BridgeRef {
                        store,
                        side: Side::Left,
                        children: Vec::new(),
                    }));
                    let right_index = NodeIndex(nodes.len());
                    nodes.push(NodeKind::ExistsBridge(BridgeRef {
                        store,
                        side: Side::Right,
                        children: Vec::new(),
                    }));
                    attach(&mut nodes, &outlets[parent.0], left_index);
                    attach(&mut nodes, &outlets[partner.0], right_index);
                    outlets.push(vec![left_index, right_index]);
                }
                StreamDef::Group {
                    parent,
                    key_mappings,
                    collectors,
                } => {
                    let index = NodeIndex(nodes.len());
                    nodes.push(NodeKind::Group(GroupNode::new(
                        key_mappings.clone(),
                        collectors.clone(),
                    )));
                    attach(&mut nodes, &outlets[parent.0], index);
                    outlets.push(vec![index]);
                }
            }
        }

        for def in &self.constraints {
            let index = NodeIndex(nodes.len());
            nodes.push(NodeKind::Scoring(ScoringNode::new(
                def.constraint.clone(),
                def.weight,
                def.negate,
                def.weigher.clone(),
                def.justifier.clone(),
            )));
            attach(&mut nodes, &outlets[def.stream.0], index);
        }

        let mut sources_by_type: BTreeMap<FactTypeId, Vec<NodeIndex>> = BTreeMap::new();
        for (position, node) in nodes.iter().enumerate() {
            if let NodeKind::Source(source) = node {
                sources_by_type
                    .entry(source.fact_type)
                    .or_default()
                    .push(NodeIndex(position));
            }
        }

        Ok(Session::from_parts(
            nodes,
            sources_by_type,
            join_stores,
            exists_stores,
            Scoreboard::new(match_tracking),
        ))
    }
}

/// Register one downstream node with every outlet of its parent stream.
fn attach<F, S>(nodes: &mut [NodeKind<F, S>], outlets: &[NodeIndex], child: NodeIndex) {
    for &outlet in outlets {
        if let Some(node) = nodes.get_mut(outlet.0) {
            node.attach_child(child);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
