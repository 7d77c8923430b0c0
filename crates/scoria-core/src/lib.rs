//! # scoria-core
//!
//! The incremental constraint-evaluation engine for Scoria - THE LOGIC.
//!
//! This crate maintains the score of a working set of planning facts
//! under single-fact mutations. Constraints are declared as streams
//! (filter, join, group, conditional existence) over fact types; the
//! streams compile into a graph of stateful nodes, and each insert,
//! update, or retract propagates through the graph as tuple events,
//! touching only the state the change actually affects.
//!
//! ## Architectural Constraints
//!
//! The engine core:
//! - Is deterministic: `BTreeMap`-ordered state everywhere, same
//!   mutation sequence, same score, same explanations
//! - Is integer-only: scores and match weights are `i64`-based with
//!   saturating arithmetic, never floats
//! - Is single-threaded: a session is one mutable value; no interior
//!   mutability, no locks
//! - Never rescans: reads come from registers the mutation path
//!   already maintains

// =============================================================================
// MODULES
// =============================================================================

pub mod bridge;
pub mod collector;
pub mod explain;
pub mod index;
pub mod joiner;
pub mod model;
pub mod node;
pub mod primitives;
pub mod score;
pub mod session;
pub mod tuple;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    ConstraintMatchId, FactId, FactTypeId, Key, NodeIndex, PlanningFact, ScoriaError, StreamId,
    TupleId, TupleState,
};

// =============================================================================
// RE-EXPORTS: Building & Running
// =============================================================================

pub use collector::Collector;
pub use joiner::{CompositeJoiner, Joiner, JoinerType};
pub use model::ConstraintModel;
pub use score::{HardSoftScore, Score, SimpleScore};
pub use session::Session;
pub use tuple::{
    Datum, JustificationFn, MatchWeigher, Tuple, TupleKeyFn, TuplePredicate, TupleView, key_fn,
    predicate,
};

// =============================================================================
// RE-EXPORTS: Explanation
// =============================================================================

pub use explain::{ConstraintId, ConstraintMatch, ConstraintMatchTotal, Indictment};
