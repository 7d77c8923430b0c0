//! # Stream Scenario Tests
//!
//! End-to-end coverage of compiled constraint networks: each test builds
//! a model, runs a mutation sequence against a session, and checks the
//! score and explanations the engine maintains incrementally.

use scoria_core::score::SimpleScore;
use scoria_core::{
    Collector, ConstraintId, ConstraintModel, FactId, FactTypeId, Joiner, Key, PlanningFact,
    ScoriaError, Session, TupleView, collector, joiner, key_fn,
};

// =============================================================================
// TEST DOMAIN
// =============================================================================

const ENTITY: FactTypeId = FactTypeId(1);
const VALUE_GROUP: FactTypeId = FactTypeId(2);

/// A minimal planning fact: entities carry a group key and a value,
/// value groups carry only the group key.
#[derive(Debug, Clone)]
struct Fact {
    id: FactId,
    type_id: FactTypeId,
    group: i64,
    value: i64,
}

impl PlanningFact for Fact {
    fn fact_id(&self) -> FactId {
        self.id
    }
    fn fact_type(&self) -> FactTypeId {
        self.type_id
    }
}

fn entity(id: u64, group: i64, value: i64) -> Fact {
    Fact {
        id: FactId(id),
        type_id: ENTITY,
        group,
        value,
    }
}

fn value_group(id: u64, group: i64) -> Fact {
    Fact {
        id: FactId(id),
        type_id: VALUE_GROUP,
        group,
        value: 0,
    }
}

fn by_group() -> Joiner<Fact> {
    joiner::equal_to(
        |t: &TupleView<'_, Fact>| Key::Int(t.fact(0).map_or(0, |f| f.group)),
        |t: &TupleView<'_, Fact>| Key::Int(t.fact(0).map_or(0, |f| f.group)),
    )
}

/// A constant-key equality joiner: every left matches every right.
fn cross() -> Joiner<Fact> {
    joiner::equal_to(|_: &TupleView<'_, Fact>| Key::Int(0), |_: &TupleView<'_, Fact>| {
        Key::Int(0)
    })
}

fn count_collector() -> Collector<Fact> {
    collector::count()
}

type Model = ConstraintModel<Fact, SimpleScore>;

// =============================================================================
// JOIN
// =============================================================================

#[test]
fn equal_join_scores_the_cross_product_within_each_key() {
    let mut model = Model::new();
    let entities = model.for_each(ENTITY);
    let groups = model.for_each(VALUE_GROUP);
    let joined = model.join(entities, groups, vec![by_group()]).expect("join");
    model
        .penalize(joined, ConstraintId::of("entity in group"), SimpleScore::of(1))
        .expect("constraint");
    let mut session = model.build_session(false).expect("session");

    session.insert(entity(1, 10, 0)).expect("insert");
    session.insert(entity(2, 10, 0)).expect("insert");
    session.insert(entity(3, 20, 0)).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(0));

    // Two entities in group 10 pair with the group fact.
    session.insert(value_group(100, 10)).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(-2));

    // A second group fact for the same key doubles the pairs.
    session.insert(value_group(101, 10)).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(-4));

    session.retract(FactId(100)).expect("retract");
    assert_eq!(session.calculate_score(), SimpleScore::of(-2));
}

#[test]
fn updating_a_join_key_moves_the_fact_between_buckets() {
    let mut model = Model::new();
    let entities = model.for_each(ENTITY);
    let groups = model.for_each(VALUE_GROUP);
    let joined = model.join(entities, groups, vec![by_group()]).expect("join");
    model
        .penalize(joined, ConstraintId::of("entity in group"), SimpleScore::of(1))
        .expect("constraint");
    let mut session = model.build_session(false).expect("session");

    session.insert(entity(1, 10, 0)).expect("insert");
    session.insert(value_group(100, 10)).expect("insert");
    session.insert(value_group(200, 20)).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(-1));

    // Move the entity to group 20: the old pair dies, a new one forms.
    session.update(entity(1, 20, 0)).expect("update");
    assert_eq!(session.calculate_score(), SimpleScore::of(-1));

    // Move it to a group with no fact: no pair survives.
    session.update(entity(1, 30, 0)).expect("update");
    assert_eq!(session.calculate_score(), SimpleScore::of(0));
}

#[test]
fn join_filter_is_re_evaluated_on_update() {
    let mut model = Model::new();
    let entities = model.for_each(ENTITY);
    let groups = model.for_each(VALUE_GROUP);
    let joined = model
        .join_filtered(entities, groups, vec![by_group()], |t| {
            t.fact(0).map_or(0, |f| f.value) > 5
        })
        .expect("join");
    model
        .penalize(joined, ConstraintId::of("heavy entity in group"), SimpleScore::of(1))
        .expect("constraint");
    let mut session = model.build_session(false).expect("session");

    session.insert(entity(1, 10, 0)).expect("insert");
    session.insert(value_group(100, 10)).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(0));

    session.update(entity(1, 10, 9)).expect("update");
    assert_eq!(session.calculate_score(), SimpleScore::of(-1));

    session.update(entity(1, 10, 1)).expect("update");
    assert_eq!(session.calculate_score(), SimpleScore::of(0));
}

// =============================================================================
// UNIQUE PAIRS
// =============================================================================

#[test]
fn unique_pairs_score_each_unordered_pair_exactly_once() {
    let mut model = Model::new();
    let pairs = model
        .for_each_unique_pair(ENTITY, vec![by_group()])
        .expect("pairs");
    model
        .penalize(pairs, ConstraintId::of("group conflict"), SimpleScore::of(1))
        .expect("constraint");
    let mut session = model.build_session(true).expect("session");

    for id in 1..=4 {
        session.insert(entity(id, 10, 0)).expect("insert");
    }
    // 4 entities in one group: C(4, 2) = 6 unordered pairs.
    assert_eq!(session.calculate_score(), SimpleScore::of(-6));

    let totals = session.constraint_match_totals().expect("tracking on");
    let total = totals
        .get(&ConstraintId::of("group conflict"))
        .expect("constraint matched");
    assert_eq!(total.constraint_match_count(), 6);
    // No match may justify the same fact twice (no (a, a) pair), and
    // every justification is a two-fact pair.
    for m in total.constraint_matches() {
        assert_eq!(m.justification.len(), 2);
        assert_ne!(m.justification[0], m.justification[1]);
    }

    session.retract(FactId(4)).expect("retract");
    assert_eq!(session.calculate_score(), SimpleScore::of(-3));
}

// =============================================================================
// GROUPING
// =============================================================================

#[test]
fn group_count_tracks_membership_incrementally() {
    let mut model = Model::new();
    let entities = model.for_each(ENTITY);
    let grouped = model
        .group_by(
            entities,
            vec![key_fn(|t: &TupleView<'_, Fact>| {
                Key::Int(t.fact(0).map_or(0, |f| f.group))
            })],
            vec![count_collector()],
        )
        .expect("group");
    let crowded = model
        .filter(grouped, |t| t.int(1).unwrap_or(0) > 2)
        .expect("filter");
    model
        .penalize_weighted(
            crowded,
            ConstraintId::of("crowded group"),
            SimpleScore::of(1),
            |t| t.int(1).unwrap_or(0),
        )
        .expect("constraint");
    let mut session = model.build_session(false).expect("session");

    session.insert(entity(1, 10, 0)).expect("insert");
    session.insert(entity(2, 10, 0)).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(0));

    // The third member pushes the group over the threshold.
    session.insert(entity(3, 10, 0)).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(-3));

    session.insert(entity(4, 10, 0)).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(-4));

    // Moving a member to another group shrinks the count in place.
    session.update(entity(4, 20, 0)).expect("update");
    assert_eq!(session.calculate_score(), SimpleScore::of(-3));

    session.retract(FactId(3)).expect("retract");
    assert_eq!(session.calculate_score(), SimpleScore::of(0));
}

#[test]
fn group_sum_and_max_update_without_group_churn() {
    let mut model = Model::new();
    let entities = model.for_each(ENTITY);
    let grouped = model
        .group_by(
            entities,
            vec![key_fn(|t: &TupleView<'_, Fact>| {
                Key::Int(t.fact(0).map_or(0, |f| f.group))
            })],
            vec![
                collector::sum(|t: &TupleView<'_, Fact>| t.fact(0).map_or(0, |f| f.value)),
                collector::max(|t: &TupleView<'_, Fact>| {
                    Key::Int(t.fact(0).map_or(0, |f| f.value))
                }),
            ],
        )
        .expect("group");
    model
        .penalize_weighted(
            grouped,
            ConstraintId::of("group load"),
            SimpleScore::of(1),
            |t| t.int(1).unwrap_or(0),
        )
        .expect("constraint");
    let mut session = model.build_session(false).expect("session");

    session.insert(entity(1, 10, 4)).expect("insert");
    session.insert(entity(2, 10, 7)).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(-11));

    // Same group, new value: the sum register shifts by the delta.
    session.update(entity(1, 10, 9)).expect("update");
    assert_eq!(session.calculate_score(), SimpleScore::of(-16));

    // Duplicated maximum survives retracting one holder.
    session.update(entity(2, 10, 9)).expect("update");
    session.retract(FactId(2)).expect("retract");
    assert_eq!(session.calculate_score(), SimpleScore::of(-9));
}

#[test]
fn grouping_by_fact_identity_keeps_the_fact_downstream() {
    let mut model = Model::new();
    let entities = model.for_each(ENTITY);
    let grouped = model
        .group_by(
            entities,
            vec![key_fn(|t: &TupleView<'_, Fact>| {
                Key::Fact(t.fact_id(0).unwrap_or(FactId(0)))
            })],
            vec![count_collector()],
        )
        .expect("group");
    // Downstream of the group, the keyed fact's fields stay resolvable.
    let heavy = model
        .filter(grouped, |t| t.fact(0).map_or(0, |f| f.value) > 5)
        .expect("filter");
    model
        .penalize(heavy, ConstraintId::of("heavy entity"), SimpleScore::of(1))
        .expect("constraint");
    let mut session = model.build_session(true).expect("session");

    session.insert(entity(1, 10, 9)).expect("insert");
    session.insert(entity(2, 10, 1)).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(-1));

    // The grouped-by fact is the default justification and is indicted.
    let totals = session.constraint_match_totals().expect("tracking on");
    let total = totals
        .get(&ConstraintId::of("heavy entity"))
        .expect("constraint matched");
    let matches: Vec<_> = total.constraint_matches().collect();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].justification, vec![FactId(1)]);
    let indictments = session.indictments().expect("tracking on");
    assert!(indictments.contains_key(&FactId(1)));
    assert!(!indictments.contains_key(&FactId(2)));

    session.retract(FactId(1)).expect("retract");
    assert_eq!(session.calculate_score(), SimpleScore::of(0));
}

// =============================================================================
// CONDITIONAL EXISTENCE
// =============================================================================

#[test]
fn if_exists_follows_partner_churn() {
    let mut model = Model::new();
    let entities = model.for_each(ENTITY);
    let groups = model.for_each(VALUE_GROUP);
    let backed = model
        .if_exists(entities, groups, vec![by_group()])
        .expect("exists");
    model
        .penalize(backed, ConstraintId::of("entity has group"), SimpleScore::of(1))
        .expect("constraint");
    let mut session = model.build_session(false).expect("session");

    session.insert(entity(1, 10, 0)).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(0));

    session.insert(value_group(100, 10)).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(-1));

    // A second witness changes nothing; losing one of two changes nothing.
    session.insert(value_group(101, 10)).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(-1));
    session.retract(FactId(100)).expect("retract");
    assert_eq!(session.calculate_score(), SimpleScore::of(-1));

    // The last witness leaving flips the condition.
    session.retract(FactId(101)).expect("retract");
    assert_eq!(session.calculate_score(), SimpleScore::of(0));
}

#[test]
fn if_not_exists_is_the_mirror_condition() {
    let mut model = Model::new();
    let entities = model.for_each(ENTITY);
    let groups = model.for_each(VALUE_GROUP);
    let orphaned = model
        .if_not_exists(entities, groups, vec![by_group()])
        .expect("not exists");
    model
        .penalize(orphaned, ConstraintId::of("orphan entity"), SimpleScore::of(1))
        .expect("constraint");
    let mut session = model.build_session(false).expect("session");

    session.insert(entity(1, 10, 0)).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(-1));

    session.insert(value_group(100, 10)).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(0));

    // Moving the witness to another key re-orphans the entity.
    session.update(value_group(100, 20)).expect("update");
    assert_eq!(session.calculate_score(), SimpleScore::of(-1));
}

// =============================================================================
// DEAD CHAIN
// =============================================================================

/// A chain ending in a constant-false filter scores nothing, no matter
/// how much state churns upstream of it.
#[test]
fn constant_false_filter_keeps_the_constraint_silent() {
    let mut model = Model::new();
    let pairs = model
        .for_each_unique_pair(ENTITY, vec![by_group()])
        .expect("pairs");
    let counted = model
        .group_by(pairs, Vec::new(), vec![count_collector()])
        .expect("group");
    let nonzero = model
        .filter(counted, |t| t.int(0).unwrap_or(0) > 0)
        .expect("filter");
    let groups = model.for_each(VALUE_GROUP);
    let joined = model.join(nonzero, groups, vec![cross()]).expect("join");
    let dead = model.filter(joined, |_| false).expect("filter");
    model
        .penalize(dead, ConstraintId::of("never fires"), SimpleScore::of(1))
        .expect("constraint");
    let mut session = model.build_session(true).expect("session");

    for id in 1..=5 {
        session.insert(entity(id, 10, 0)).expect("insert");
        assert_eq!(session.calculate_score(), SimpleScore::of(0));
    }
    session.insert(value_group(100, 10)).expect("insert");
    session.update(entity(3, 20, 0)).expect("update");
    session.retract(FactId(2)).expect("retract");
    assert_eq!(session.calculate_score(), SimpleScore::of(0));
    assert!(
        session
            .constraint_match_totals()
            .expect("tracking on")
            .is_empty()
    );

    // Tearing everything down leaves no live state behind.
    session.retract(FactId(100)).expect("retract");
    for id in [1, 3, 4, 5] {
        session.retract(FactId(id)).expect("retract");
    }
    assert_eq!(session.live_tuple_count(), 0);
}

// =============================================================================
// EXPLANATIONS
// =============================================================================

#[test]
fn match_totals_and_indictments_follow_retraction() {
    let mut model = Model::new();
    let pairs = model
        .for_each_unique_pair(ENTITY, vec![by_group()])
        .expect("pairs");
    model
        .penalize(pairs, ConstraintId::of("group conflict"), SimpleScore::of(2))
        .expect("constraint");
    let mut session = model.build_session(true).expect("session");

    session.insert(entity(1, 10, 0)).expect("insert");
    session.insert(entity(2, 10, 0)).expect("insert");
    session.insert(entity(3, 10, 0)).expect("insert");

    let id = ConstraintId::of("group conflict");
    let totals = session.constraint_match_totals().expect("tracking on");
    let total = totals.get(&id).expect("constraint matched");
    assert_eq!(total.constraint_match_count(), 3);
    assert_eq!(total.score(), SimpleScore::of(-6));

    // Each entity sits in two of the three pairs.
    let indictments = session.indictments().expect("tracking on");
    for fact in [1, 2, 3] {
        let indictment = indictments.get(&FactId(fact)).expect("indicted");
        assert_eq!(indictment.constraint_match_count(), 2);
        assert_eq!(indictment.score(), SimpleScore::of(-4));
    }

    session.retract(FactId(3)).expect("retract");
    let totals = session.constraint_match_totals().expect("tracking on");
    let total = totals.get(&id).expect("total persists");
    assert_eq!(total.constraint_match_count(), 1);
    assert_eq!(total.score(), SimpleScore::of(-2));
    // The retracted fact's indictment is gone entirely.
    let indictments = session.indictments().expect("tracking on");
    assert!(!indictments.contains_key(&FactId(3)));
}

#[test]
fn tracking_disabled_sessions_reject_explanation_reads() {
    let mut model = Model::new();
    let entities = model.for_each(ENTITY);
    model
        .penalize(entities, ConstraintId::of("any entity"), SimpleScore::of(1))
        .expect("constraint");
    let session: Session<Fact, SimpleScore> = model.build_session(false).expect("session");

    assert!(matches!(
        session.constraint_match_totals(),
        Err(ScoriaError::MatchTrackingDisabled)
    ));
    assert!(matches!(
        session.indictments(),
        Err(ScoriaError::MatchTrackingDisabled)
    ));
}

// =============================================================================
// WORKING SET EDGES
// =============================================================================

#[test]
fn fact_lifecycle_errors_are_reported() {
    let mut model = Model::new();
    let entities = model.for_each(ENTITY);
    model
        .penalize(entities, ConstraintId::of("any entity"), SimpleScore::of(1))
        .expect("constraint");
    let mut session = model.build_session(false).expect("session");

    session.insert(entity(1, 10, 0)).expect("insert");
    assert!(matches!(
        session.insert(entity(1, 10, 0)),
        Err(ScoriaError::FactAlreadyInserted(FactId(1)))
    ));
    assert!(matches!(
        session.update(entity(2, 10, 0)),
        Err(ScoriaError::FactNotFound(FactId(2)))
    ));
    assert!(matches!(
        session.retract(FactId(2)),
        Err(ScoriaError::FactNotFound(FactId(2)))
    ));
    session.retract(FactId(1)).expect("retract");
    assert!(matches!(
        session.retract(FactId(1)),
        Err(ScoriaError::FactNotFound(FactId(1)))
    ));
}

#[test]
fn facts_without_a_subscribed_stream_are_held_but_silent() {
    let mut model = Model::new();
    let entities = model.for_each(ENTITY);
    model
        .penalize(entities, ConstraintId::of("any entity"), SimpleScore::of(1))
        .expect("constraint");
    let mut session = model.build_session(false).expect("session");

    let stray = Fact {
        id: FactId(9),
        type_id: FactTypeId(99),
        group: 0,
        value: 0,
    };
    session.insert(stray.clone()).expect("insert");
    assert_eq!(session.calculate_score(), SimpleScore::of(0));
    assert_eq!(session.live_tuple_count(), 0);
    assert!(session.fact(FactId(9)).is_some());

    session.update(stray).expect("update");
    session.retract(FactId(9)).expect("retract");
    assert!(session.fact(FactId(9)).is_none());
}
