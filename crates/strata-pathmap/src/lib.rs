//! Ordered prefix map with snapshot reads and a staged transactional writer.
//!
//! [`PathMap`] is an immutable snapshot of an ordered map over byte keys.
//! Snapshots are cheap to clone and safe to read from any number of threads
//! while a single writer stages mutations in a [`Txn`]. Committing a
//! transaction publishes a new snapshot; until then the staged mutations are
//! invisible to every existing snapshot.
//!
//! The intended key shape is a path encoding where the separator sorts below
//! every other byte, so a key's descendants form a contiguous range directly
//! after it. The cursor API ([`PathMap::range_from`], [`PathMap::range_after`],
//! [`PathMap::walk_prefix`]) is built around that layout.
//!
//! Internally a snapshot is an `Arc`-shared `BTreeMap`; a transaction works on
//! a private copy and swaps it in on commit. Callers that need a single
//! writer must enforce that themselves (the map hands out transactions
//! freely; committing a stale transaction last-writer-wins).

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// An immutable snapshot of an ordered map over byte keys.
#[derive(Debug, Clone)]
pub struct PathMap<V> {
    root: Arc<BTreeMap<Vec<u8>, V>>,
}

impl<V> Default for PathMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> PathMap<V> {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self {
            root: Arc::new(BTreeMap::new()),
        }
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.root.get(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.root.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Iterates all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &V)> {
        self.root.iter().map(|(k, v)| (k.as_slice(), v))
    }

    /// Cursor positioned at the first key `>= key`, advancing in sorted order.
    pub fn range_from<'a>(&'a self, key: &[u8]) -> impl Iterator<Item = (&'a [u8], &'a V)> {
        self.root
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .map(|(k, v)| (k.as_slice(), v))
    }

    /// Cursor positioned at the first key strictly greater than `key`.
    pub fn range_after<'a>(&'a self, key: &[u8]) -> impl Iterator<Item = (&'a [u8], &'a V)> {
        self.root
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .map(|(k, v)| (k.as_slice(), v))
    }

    /// Iterates all entries whose key starts with `prefix`, in sorted order.
    pub fn walk_prefix<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = (&'a [u8], &'a V)> {
        self.range_from(prefix)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }
}

impl<V: Clone> PathMap<V> {
    /// Opens a staged transaction on top of this snapshot.
    pub fn txn(&self) -> Txn<V> {
        Txn {
            base: self.clone(),
            staged: (*self.root).clone(),
        }
    }
}

/// A staged batch of mutations over a [`PathMap`] snapshot.
///
/// Reads through the transaction observe the staged state; the base snapshot
/// (and every other clone of it) stays untouched until [`Txn::commit`].
#[derive(Debug)]
pub struct Txn<V> {
    base: PathMap<V>,
    staged: BTreeMap<Vec<u8>, V>,
}

impl<V: Clone> Txn<V> {
    /// The snapshot this transaction was opened from.
    pub fn base(&self) -> &PathMap<V> {
        &self.base
    }

    /// Staged point lookup.
    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.staged.get(key)
    }

    /// Stages an insert, returning the previously staged value.
    pub fn insert(&mut self, key: Vec<u8>, value: V) -> Option<V> {
        self.staged.insert(key, value)
    }

    /// Stages a delete, returning the previously staged value.
    pub fn delete(&mut self, key: &[u8]) -> Option<V> {
        self.staged.remove(key)
    }

    /// Publishes the staged state as a new snapshot.
    pub fn commit(self) -> PathMap<V> {
        PathMap {
            root: Arc::new(self.staged),
        }
    }
}
