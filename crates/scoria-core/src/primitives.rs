//! # Innate Primitives
//!
//! Hardcoded engine limits for the Scoria evaluation network.
//!
//! These are compiled into the binary and immutable at runtime. They bound
//! the shape of the node graph, not the size of the problem.

/// Maximum arity of a tuple flowing through the network.
///
/// A join of a left stream (arity L) and a right stream (arity R) produces
/// arity L + R; the model rejects any definition that would exceed this.
pub const MAX_TUPLE_ARITY: usize = 4;

/// Maximum number of simultaneous collectors in a single group-by.
///
/// Each collector owns an independent accumulator per distinct group key.
pub const MAX_GROUP_COLLECTORS: usize = 4;

/// Maximum number of key mappings in a single group-by.
pub const MAX_GROUP_KEY_MAPPINGS: usize = 2;

/// Constraint package used when the constraint author does not supply one.
pub const DEFAULT_CONSTRAINT_PACKAGE: &str = "scoria.default";
