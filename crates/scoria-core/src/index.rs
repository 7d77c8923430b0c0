//! # Join Index
//!
//! One side of the shared key index behind a join- or exists-bridge pair.
//!
//! Tuples are bucketed by the equality part of their composite join key
//! for exact `BTreeMap` lookup; the ordering part is stored per tuple and
//! checked candidate by candidate. Insert and retract cost is proportional
//! to the matching bucket only, never to the whole side.

use crate::{Key, ScoriaError, TupleId};
use std::collections::BTreeMap;

/// The per-side index of a bridge pair: equality bucket key to the tuples
/// currently on this side, each with its stored ordering-condition keys.
#[derive(Debug, Default)]
pub struct SideIndex {
    buckets: BTreeMap<Key, BTreeMap<TupleId, Vec<Key>>>,
}

impl SideIndex {
    /// Create an empty side index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a tuple under its equality bucket key.
    pub fn insert(&mut self, bucket: Key, tuple: TupleId, comparison_keys: Vec<Key>) {
        self.buckets
            .entry(bucket)
            .or_default()
            .insert(tuple, comparison_keys);
    }

    /// Remove a tuple from its bucket. The tuple must be indexed there;
    /// anything else means the bridge bookkeeping has diverged.
    pub fn remove(&mut self, bucket: &Key, tuple: TupleId) -> Result<Vec<Key>, ScoriaError> {
        let entries = self
            .buckets
            .get_mut(bucket)
            .ok_or(ScoriaError::TupleNotFound(tuple))?;
        let keys = entries
            .remove(&tuple)
            .ok_or(ScoriaError::TupleNotFound(tuple))?;
        if entries.is_empty() {
            self.buckets.remove(bucket);
        }
        Ok(keys)
    }

    /// Replace the stored ordering keys of an already-indexed tuple.
    pub fn update_comparisons(
        &mut self,
        bucket: &Key,
        tuple: TupleId,
        comparison_keys: Vec<Key>,
    ) -> Result<(), ScoriaError> {
        let entry = self
            .buckets
            .get_mut(bucket)
            .and_then(|entries| entries.get_mut(&tuple))
            .ok_or(ScoriaError::TupleNotFound(tuple))?;
        *entry = comparison_keys;
        Ok(())
    }

    /// Visit every tuple in a bucket, in deterministic tuple order.
    pub fn bucket(&self, key: &Key) -> impl Iterator<Item = (TupleId, &[Key])> {
        self.buckets
            .get(key)
            .into_iter()
            .flat_map(|entries| entries.iter().map(|(id, keys)| (*id, keys.as_slice())))
    }

    /// Number of indexed tuples across all buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(BTreeMap::len).sum()
    }

    /// Whether the side holds no tuples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_lookup_is_exact() {
        let mut index = SideIndex::new();
        index.insert(Key::Int(1), TupleId(10), vec![]);
        index.insert(Key::Int(1), TupleId(11), vec![]);
        index.insert(Key::Int(2), TupleId(12), vec![]);

        let hits: Vec<TupleId> = index.bucket(&Key::Int(1)).map(|(id, _)| id).collect();
        assert_eq!(hits, vec![TupleId(10), TupleId(11)]);
        assert_eq!(index.bucket(&Key::Int(3)).count(), 0);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn remove_clears_empty_buckets() {
        let mut index = SideIndex::new();
        index.insert(Key::Int(1), TupleId(10), vec![Key::Int(5)]);

        let keys = index.remove(&Key::Int(1), TupleId(10)).expect("remove");
        assert_eq!(keys, vec![Key::Int(5)]);
        assert!(index.is_empty());
    }

    #[test]
    fn removing_unindexed_tuple_is_fatal() {
        let mut index = SideIndex::new();
        assert!(matches!(
            index.remove(&Key::Int(1), TupleId(10)),
            Err(ScoriaError::TupleNotFound(TupleId(10)))
        ));
    }

    #[test]
    fn update_comparisons_replaces_in_place() {
        let mut index = SideIndex::new();
        index.insert(Key::Int(1), TupleId(10), vec![Key::Int(5)]);
        index
            .update_comparisons(&Key::Int(1), TupleId(10), vec![Key::Int(6)])
            .expect("update");

        let stored: Vec<&[Key]> = index.bucket(&Key::Int(1)).map(|(_, keys)| keys).collect();
        assert_eq!(stored, vec![&[Key::Int(6)][..]]);
    }
}
