//! # Session
//!
//! The runtime instance of a compiled constraint network: the node
//! arena, the tuple arena, the live fact store, the shared bridge
//! stores, and the scoreboard.
//!
//! Each mutation (`insert`, `update`, `retract`) runs one batch: the
//! subscribed source nodes seed events, and the batch queue drains in
//! ascending node index order. Because the model compiles parents to
//! smaller indices than their children, a node always sees the complete
//! effect of its parents' events before it runs. After the queue drains,
//! the settle pass folds transient tuple states back to `Ok` and frees
//! the dead ones. Scores are read from the terminal scoring registers,
//! so `calculate_score` is a sum over constraints, never a rescan.

use crate::bridge::{ExistsStore, JoinStore};
use crate::explain::{ConstraintId, ConstraintMatchTotal, Indictment, Scoreboard};
use crate::node::{EventOp, NetCtx, NodeKind};
use crate::score::Score;
use crate::tuple::TupleArena;
use crate::{FactId, FactTypeId, NodeIndex, PlanningFact, ScoriaError, TupleId, TupleState};
use std::collections::{BTreeMap, VecDeque};

// =============================================================================
// SESSION
// =============================================================================

/// A live, stateful instance of a constraint network.
pub struct Session<F, S> {
    nodes: Vec<NodeKind<F, S>>,
    sources_by_type: BTreeMap<FactTypeId, Vec<NodeIndex>>,
    join_stores: Vec<JoinStore<F>>,
    exists_stores: Vec<ExistsStore<F>>,
    facts: BTreeMap<FactId, F>,
    tuples: TupleArena,
    scoreboard: Scoreboard<S>,
    dirty: Vec<TupleId>,
}

impl<F: PlanningFact, S: Score> Session<F, S> {
    pub(crate) fn from_parts(
        nodes: Vec<NodeKind<F, S>>,
        sources_by_type: BTreeMap<FactTypeId, Vec<NodeIndex>>,
        join_stores: Vec<JoinStore<F>>,
        exists_stores: Vec<ExistsStore<F>>,
        scoreboard: Scoreboard<S>,
    ) -> Self {
        Self {
            nodes,
            sources_by_type,
            join_stores,
            exists_stores,
            facts: BTreeMap::new(),
            tuples: TupleArena::new(),
            scoreboard,
            dirty: Vec::new(),
        }
    }

    // =========================================================================
    // MUTATION
    // =========================================================================

    /// Insert a fact into the working set.
    ///
    /// A fact whose type no stream subscribes to is stored and never
    /// propagated; inserting the same `FactId` twice is an error.
    pub fn insert(&mut self, fact: F) -> Result<(), ScoriaError> {
        let id = fact.fact_id();
        let fact_type = fact.fact_type();
        if self.facts.contains_key(&id) {
            return Err(ScoriaError::FactAlreadyInserted(id));
        }
        self.facts.insert(id, fact);
        let seeds = self.seed_sources(fact_type, id, EventOp::Insert)?;
        self.pump(seeds)?;
        self.settle();
        Ok(())
    }

    /// Report an in-place change of a fact's fields.
    ///
    /// The change propagates as a single `Update` along every chain; no
    /// tuple loses its identity unless a join key moved it between
    /// index buckets.
    pub fn update(&mut self, fact: F) -> Result<(), ScoriaError> {
        let id = fact.fact_id();
        let fact_type = fact.fact_type();
        if !self.facts.contains_key(&id) {
            return Err(ScoriaError::FactNotFound(id));
        }
        // Replace first: downstream key extraction must see new fields.
        self.facts.insert(id, fact);
        let seeds = self.seed_sources(fact_type, id, EventOp::Update)?;
        self.pump(seeds)?;
        self.settle();
        Ok(())
    }

    /// Remove a fact from the working set.
    pub fn retract(&mut self, id: FactId) -> Result<(), ScoriaError> {
        let fact_type = self
            .facts
            .get(&id)
            .ok_or(ScoriaError::FactNotFound(id))?
            .fact_type();
        let seeds = self.seed_sources(fact_type, id, EventOp::Retract)?;
        self.pump(seeds)?;
        self.settle();
        // The fact stays resolvable until every node has let go of it.
        self.facts.remove(&id);
        Ok(())
    }

    /// Run the subscribed source nodes for one fact event, collecting
    /// the initial batch.
    fn seed_sources(
        &mut self,
        fact_type: FactTypeId,
        fact: FactId,
        op: EventOp,
    ) -> Result<Vec<(NodeIndex, EventOp, TupleId)>, ScoriaError> {
        let Self {
            nodes,
            sources_by_type,
            facts,
            tuples,
            dirty,
            ..
        } = self;
        let mut seeds = Vec::new();
        let Some(subscribed) = sources_by_type.get(&fact_type) else {
            return Ok(seeds);
        };
        for &index in subscribed {
            let Some(NodeKind::Source(source)) = nodes.get_mut(index.0) else {
                return Err(ScoriaError::MalformedConstraint(format!(
                    "node {} registered as a source is not one",
                    index.0
                )));
            };
            let mut ctx = NetCtx {
                tuples: &mut *tuples,
                facts: &*facts,
                dirty: &mut *dirty,
            };
            let event = match op {
                EventOp::Insert => source.insert_fact(&mut ctx, fact)?,
                EventOp::Update => source.update_fact(&mut ctx, fact)?,
                EventOp::Retract => source.retract_fact(&mut ctx, fact)?,
            };
            for &child in &source.children {
                seeds.push((child, event.op, event.tuple));
            }
        }
        Ok(seeds)
    }

    /// Drain one batch in ascending node index order.
    fn pump(&mut self, seeds: Vec<(NodeIndex, EventOp, TupleId)>) -> Result<(), ScoriaError> {
        let mut queue: BTreeMap<usize, VecDeque<(EventOp, TupleId)>> = BTreeMap::new();
        for (node, op, tuple) in seeds {
            queue.entry(node.0).or_default().push_back((op, tuple));
        }
        let Self {
            nodes,
            join_stores,
            exists_stores,
            facts,
            tuples,
            scoreboard,
            dirty,
            ..
        } = self;

        loop {
            let Some((&index, bucket)) = queue.iter_mut().next() else {
                break;
            };
            let front = bucket.pop_front();
            let drained = bucket.is_empty();
            if drained {
                queue.remove(&index);
            }
            let Some((op, tuple)) = front else {
                continue;
            };

            let mut ctx = NetCtx {
                tuples: &mut *tuples,
                facts: &*facts,
                dirty: &mut *dirty,
            };
            let node = nodes.get_mut(index).ok_or_else(|| {
                ScoriaError::MalformedConstraint(format!("event routed to unknown node {index}"))
            })?;
            let (events, children): (Vec<_>, &[NodeIndex]) = match node {
                NodeKind::Source(_) => (Vec::new(), &[]),
                NodeKind::Filter(filter) => (filter.apply(&mut ctx, op, tuple)?, &filter.children),
                NodeKind::JoinBridge(bridge) => {
                    let store = join_stores.get_mut(bridge.store).ok_or_else(|| {
                        ScoriaError::MalformedConstraint(format!(
                            "join bridge {index} points at a missing store"
                        ))
                    })?;
                    (
                        store.apply(&mut ctx, bridge.side, op, tuple)?,
                        &bridge.children,
                    )
                }
                NodeKind::ExistsBridge(bridge) => {
                    let store = exists_stores.get_mut(bridge.store).ok_or_else(|| {
                        ScoriaError::MalformedConstraint(format!(
                            "exists bridge {index} points at a missing store"
                        ))
                    })?;
                    (
                        store.apply(&mut ctx, bridge.side, op, tuple)?,
                        &bridge.children,
                    )
                }
                NodeKind::Group(group) => (group.apply(&mut ctx, op, tuple)?, &group.children),
                NodeKind::Scoring(scoring) => {
                    scoring.apply(&mut ctx, scoreboard, op, tuple)?;
                    (Vec::new(), &[])
                }
            };
            for event in events {
                for &child in children {
                    queue
                        .entry(child.0)
                        .or_default()
                        .push_back((event.op, event.tuple));
                }
            }
        }
        Ok(())
    }

    /// Fold transient tuple states back to steady state and free the
    /// dead ones. Runs after every batch.
    fn settle(&mut self) {
        let flagged = std::mem::take(&mut self.dirty);
        for id in flagged {
            let Ok(tuple) = self.tuples.get_mut(id) else {
                // Flagged more than once and already freed.
                continue;
            };
            match tuple.state {
                TupleState::Creating | TupleState::Updating => tuple.state = TupleState::Ok,
                TupleState::Dying => {
                    tuple.state = TupleState::Dead;
                    self.tuples.remove(id);
                }
                TupleState::Ok | TupleState::Dead => {}
            }
        }
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// The overall score: the sum of every constraint's running
    /// register. Incremental; nothing is re-evaluated here.
    #[must_use]
    pub fn calculate_score(&self) -> S {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                NodeKind::Scoring(scoring) => Some(scoring.score()),
                _ => None,
            })
            .fold(S::zero(), |total, score| total + score)
    }

    /// Per-constraint match totals. Fails when the session was built
    /// without match tracking.
    pub fn constraint_match_totals(
        &self,
    ) -> Result<&BTreeMap<ConstraintId, ConstraintMatchTotal<S>>, ScoriaError> {
        self.scoreboard.totals()
    }

    /// Per-fact indictments. Fails when the session was built without
    /// match tracking.
    pub fn indictments(&self) -> Result<&BTreeMap<FactId, Indictment<S>>, ScoriaError> {
        self.scoreboard.indictments()
    }

    /// Whether this session records match-level explanations.
    #[must_use]
    pub fn is_match_tracking(&self) -> bool {
        self.scoreboard.is_tracking()
    }

    /// A fact currently in the working set.
    #[must_use]
    pub fn fact(&self, id: FactId) -> Option<&F> {
        self.facts.get(&id)
    }

    /// Number of facts in the working set.
    #[must_use]
    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    // =========================================================================
    // DIAGNOSTICS
    // =========================================================================

    /// Number of live tuples across all nodes.
    #[must_use]
    pub fn live_tuple_count(&self) -> usize {
        self.tuples.len()
    }

    /// Number of nodes in the compiled network.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The compiled topology as (kind, children) rows in node index
    /// order. Stable across builds of the same model.
    #[must_use]
    pub fn topology(&self) -> Vec<(&'static str, Vec<NodeIndex>)> {
        self.nodes
            .iter()
            .map(|node| (node.kind_name(), node.children().to_vec()))
            .collect()
    }
}
