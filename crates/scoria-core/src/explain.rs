//! # Score Explanation Structures
//!
//! Constraint matches, per-constraint totals and per-fact indictments.
//!
//! Scoring nodes populate these when match tracking is enabled; they are
//! the data behind score-explanation UIs. Tracking roughly doubles the
//! per-match bookkeeping, so it is opt-in at session build.
//!
//! Retraction invariant: removing a match that is not in its backing set
//! is a fatal invariant violation, never a silent no-op; it means the
//! tuple bookkeeping has diverged from reality.

use crate::{ConstraintMatchId, FactId, ScoriaError};
use crate::primitives::DEFAULT_CONSTRAINT_PACKAGE;
use crate::score::Score;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};

// =============================================================================
// CONSTRAINT IDENTITY
// =============================================================================

/// Fully qualified constraint identity: package plus name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConstraintId {
    /// The constraint package, a namespace for display grouping.
    pub package: String,
    /// The constraint name, unique within its package.
    pub name: String,
}

impl ConstraintId {
    /// Create a fully qualified constraint identity.
    #[must_use]
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
        }
    }

    /// Create a constraint identity in the default package.
    #[must_use]
    pub fn of(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_CONSTRAINT_PACKAGE, name)
    }
}

impl Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.name)
    }
}

// =============================================================================
// CONSTRAINT MATCH
// =============================================================================

/// One weighted, justified instance of a constraint being violated or
/// satisfied.
///
/// Matches have identity (`ConstraintMatchId`): the same fact combination
/// matching the same constraint twice yields two distinct matches.
/// Deduplication is deliberately not performed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintMatch<S> {
    /// Identity of this match instance.
    pub id: ConstraintMatchId,
    /// The constraint this match belongs to.
    pub constraint: ConstraintId,
    /// The facts designated as explanation, in slot order.
    pub justification: Vec<FactId>,
    /// The signed score contribution of this match.
    pub score: S,
}

impl<S: Score> ConstraintMatch<S> {
    /// Display ordering: package, then name, then element-wise
    /// justification identity, then justification length.
    ///
    /// This ordering is independent of, and inconsistent with, match
    /// identity: two distinct matches over the same facts compare equal
    /// here. Use it for presentation only, never for set membership.
    #[must_use]
    pub fn display_cmp(&self, other: &Self) -> Ordering {
        self.constraint
            .package
            .cmp(&other.constraint.package)
            .then_with(|| self.constraint.name.cmp(&other.constraint.name))
            .then_with(|| {
                for (left, right) in self.justification.iter().zip(other.justification.iter()) {
                    let ordering = left.cmp(right);
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            })
            .then_with(|| self.justification.len().cmp(&other.justification.len()))
    }
}

// =============================================================================
// CONSTRAINT MATCH TOTAL
// =============================================================================

/// Per-constraint running aggregate: the set of live matches plus their
/// score sum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintMatchTotal<S> {
    /// The constraint this total aggregates.
    pub constraint: ConstraintId,
    matches: BTreeMap<ConstraintMatchId, ConstraintMatch<S>>,
    score: S,
}

impl<S: Score> ConstraintMatchTotal<S> {
    /// Create an empty total for a constraint.
    #[must_use]
    pub fn new(constraint: ConstraintId) -> Self {
        Self {
            constraint,
            matches: BTreeMap::new(),
            score: S::zero(),
        }
    }

    /// Add a match and accumulate its score.
    pub fn add_constraint_match(&mut self, constraint_match: ConstraintMatch<S>) {
        self.score = self.score + constraint_match.score;
        self.matches.insert(constraint_match.id, constraint_match);
    }

    /// Find-and-remove a match, deducting its score.
    ///
    /// Failing to find the entry is a fatal invariant violation.
    pub fn remove_constraint_match(
        &mut self,
        id: ConstraintMatchId,
    ) -> Result<ConstraintMatch<S>, ScoriaError> {
        let removed = self
            .matches
            .remove(&id)
            .ok_or(ScoriaError::MatchNotFound(id))?;
        self.score = self.score - removed.score;
        Ok(removed)
    }

    /// The score sum of all live matches.
    #[must_use]
    pub fn score(&self) -> S {
        self.score
    }

    /// Number of live matches.
    #[must_use]
    pub fn constraint_match_count(&self) -> usize {
        self.matches.len()
    }

    /// Iterate the live matches in deterministic identity order.
    pub fn constraint_matches(&self) -> impl Iterator<Item = &ConstraintMatch<S>> {
        self.matches.values()
    }
}

// =============================================================================
// INDICTMENT
// =============================================================================

/// Per-fact reverse index: every live match in which the fact appears as
/// a justification, plus the running score sum for that fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Indictment<S> {
    /// The indicted fact.
    pub fact: FactId,
    matches: BTreeMap<ConstraintMatchId, ConstraintMatch<S>>,
    score: S,
}

impl<S: Score> Indictment<S> {
    /// Create an empty indictment for a fact.
    #[must_use]
    pub fn new(fact: FactId) -> Self {
        Self {
            fact,
            matches: BTreeMap::new(),
            score: S::zero(),
        }
    }

    /// Add a match this fact participates in.
    pub fn add_constraint_match(&mut self, constraint_match: ConstraintMatch<S>) {
        self.score = self.score + constraint_match.score;
        self.matches.insert(constraint_match.id, constraint_match);
    }

    /// Find-and-remove a match. Same fatal invariant as the match total.
    pub fn remove_constraint_match(&mut self, id: ConstraintMatchId) -> Result<(), ScoriaError> {
        let removed = self
            .matches
            .remove(&id)
            .ok_or(ScoriaError::IndictmentNotFound(self.fact))?;
        self.score = self.score - removed.score;
        Ok(())
    }

    /// The score sum of all matches indicting this fact.
    #[must_use]
    pub fn score(&self) -> S {
        self.score
    }

    /// Number of live matches indicting this fact.
    #[must_use]
    pub fn constraint_match_count(&self) -> usize {
        self.matches.len()
    }

    /// Whether the fact currently participates in no match.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Iterate the live matches in deterministic identity order.
    pub fn constraint_matches(&self) -> impl Iterator<Item = &ConstraintMatch<S>> {
        self.matches.values()
    }
}

// =============================================================================
// SCOREBOARD
// =============================================================================

/// The session-owned match-tracking state shared by all scoring nodes.
///
/// When tracking is disabled, scoring nodes skip it entirely and the
/// accessors fail with a disabled-feature error.
#[derive(Debug)]
pub struct Scoreboard<S> {
    tracking: bool,
    next_match_id: u64,
    totals: BTreeMap<ConstraintId, ConstraintMatchTotal<S>>,
    indictments: BTreeMap<FactId, Indictment<S>>,
}

impl<S: Score> Scoreboard<S> {
    /// Create a scoreboard; `tracking` is fixed for the session lifetime.
    #[must_use]
    pub fn new(tracking: bool) -> Self {
        Self {
            tracking,
            next_match_id: 0,
            totals: BTreeMap::new(),
            indictments: BTreeMap::new(),
        }
    }

    /// Whether match tracking is enabled.
    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// Record a new match in the constraint's total and in the indictment
    /// of every justifying fact.
    pub fn record_match(
        &mut self,
        constraint: &ConstraintId,
        justification: Vec<FactId>,
        score: S,
    ) -> ConstraintMatchId {
        let id = ConstraintMatchId(self.next_match_id);
        self.next_match_id = self.next_match_id.saturating_add(1);
        let constraint_match = ConstraintMatch {
            id,
            constraint: constraint.clone(),
            justification,
            score,
        };

        // A fact listed twice in one justification (a self-join pairing a
        // fact with itself) is indicted once for that match.
        let indicted: BTreeSet<FactId> = constraint_match.justification.iter().copied().collect();
        for fact in indicted {
            self.indictments
                .entry(fact)
                .or_insert_with(|| Indictment::new(fact))
                .add_constraint_match(constraint_match.clone());
        }
        self.totals
            .entry(constraint.clone())
            .or_insert_with(|| ConstraintMatchTotal::new(constraint.clone()))
            .add_constraint_match(constraint_match);
        id
    }

    /// Retract a previously recorded match everywhere it was recorded.
    ///
    /// The constraint total persists (at zero) once created; an indictment
    /// with no remaining matches is removed.
    pub fn retract_match(
        &mut self,
        id: ConstraintMatchId,
        constraint: &ConstraintId,
        justification: &[FactId],
    ) -> Result<(), ScoriaError> {
        let total = self
            .totals
            .get_mut(constraint)
            .ok_or(ScoriaError::MatchNotFound(id))?;
        total.remove_constraint_match(id)?;

        let indicted: BTreeSet<FactId> = justification.iter().copied().collect();
        for fact in indicted {
            let indictment = self
                .indictments
                .get_mut(&fact)
                .ok_or(ScoriaError::IndictmentNotFound(fact))?;
            indictment.remove_constraint_match(id)?;
            if indictment.is_empty() {
                self.indictments.remove(&fact);
            }
        }
        Ok(())
    }

    /// All per-constraint totals. Fails when tracking is disabled.
    pub fn totals(&self) -> Result<&BTreeMap<ConstraintId, ConstraintMatchTotal<S>>, ScoriaError> {
        if !self.tracking {
            return Err(ScoriaError::MatchTrackingDisabled);
        }
        Ok(&self.totals)
    }

    /// All per-fact indictments. Fails when tracking is disabled.
    pub fn indictments(&self) -> Result<&BTreeMap<FactId, Indictment<S>>, ScoriaError> {
        if !self.tracking {
            return Err(ScoriaError::MatchTrackingDisabled);
        }
        Ok(&self.indictments)
    }
}

// =============================================================================
// TESTS
// =============================================================================
