//! # Memtable Module
//!
//! The mutable, in-memory layer of the engine: a sorted map from key to either
//! a value or a tombstone, filled by applying batches and later serialized into
//! a tablet by the background flush.
//!
//! ## Design Overview
//!
//! Entries live in a lock-free [`SkipMap`] ordered by unsigned byte comparison,
//! so foreground writers and concurrent readers never block each other. A key
//! is stored once; later writes overwrite earlier ones. Deletes store
//! [`Value::Tombstone`], which shadows older values in tablets until the
//! memtable itself is flushed.
//!
//! ## Size accounting
//!
//! [`MemTable::size`] is a running total of `key.len() + value.len()` over
//! every write ever applied (overwrites are not subtracted). It only drives the
//! flush trigger, so it is allowed to over-estimate.
//!
//! # Concurrency model
//!
//! - `set`, `delete`, and `find` take `&self` and are safe to call from any thread.
//! - A [`MemTableIter`] holds its own handle on the map and re-seeks after each
//!   entry, so it observes writes made after it was created but never skips or
//!   repeats a key.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fmt,
    ops::Bound,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crossbeam_skiplist::SkipMap;
use tracing::trace;

use crate::batch::{Batch, BatchError};
use crate::view::{ByteView, KeyValue};

// ------------------------------------------------------------------------------------------------
// Value
// ------------------------------------------------------------------------------------------------

/// What a memtable holds for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A live value.
    Present(ByteView),
    /// The key was deleted.
    Tombstone,
}

impl Value {
    fn len(&self) -> usize {
        match self {
            Value::Present(value) => value.len(),
            Value::Tombstone => 0,
        }
    }

    fn into_option(self) -> Option<ByteView> {
        match self {
            Value::Present(value) => Some(value),
            Value::Tombstone => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// MemTable
// ------------------------------------------------------------------------------------------------

/// A concurrent sorted map of pending writes.
#[derive(Default)]
pub struct MemTable {
    map: Arc<SkipMap<ByteView, Value>>,
    size: AtomicUsize,
}

impl fmt::Debug for MemTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemTable")
            .field("entries", &self.map.len())
            .field("size", &self.size())
            .finish()
    }
}

impl MemTable {
    /// An empty memtable.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, key: ByteView, value: Value) {
        self.size.fetch_add(key.len() + value.len(), Ordering::Relaxed);
        self.map.insert(key, value);
    }

    /// Stores `value` under `key`, replacing any earlier entry.
    pub fn set(&self, key: ByteView, value: ByteView) {
        self.insert(key, Value::Present(value));
    }

    /// Records a deletion of `key`.
    pub fn delete(&self, key: ByteView) {
        self.insert(key, Value::Tombstone);
    }

    /// Entry currently stored for `key`, tombstones included.
    pub fn get(&self, key: &[u8]) -> Option<Value> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    /// Applies every operation of `batch` in order.
    ///
    /// A decode error stops the replay; operations before it stay applied.
    pub fn apply(&self, batch: &Batch) -> Result<(), BatchError> {
        let mut records = 0usize;
        for pair in batch.pairs() {
            let KeyValue { key, value } = pair?;
            match value {
                Some(value) => self.set(key, value),
                None => self.delete(key),
            }
            records += 1;
        }
        trace!(records, size = self.size(), "memtable batch applied");
        Ok(())
    }

    /// Entries with key `>= term` (every entry when `term` is `None`), ascending.
    pub fn find(&self, term: Option<&[u8]>) -> MemTableIter {
        let next = match term {
            Some(term) => Bound::Included(ByteView::copy_from(term)),
            None => Bound::Unbounded,
        };
        MemTableIter {
            map: Arc::clone(&self.map),
            next,
        }
    }

    /// Bytes written so far; drives the flush threshold.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drops every entry.
    pub fn close(&self) {
        self.map.clear();
        self.size.store(0, Ordering::Relaxed);
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Ascending cursor over a memtable.
pub struct MemTableIter {
    map: Arc<SkipMap<ByteView, Value>>,
    /// Lower bound of the next entry to yield.
    next: Bound<ByteView>,
}

impl fmt::Debug for MemTableIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemTableIter")
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

impl Iterator for MemTableIter {
    type Item = KeyValue;

    fn next(&mut self) -> Option<Self::Item> {
        let bound: Bound<&[u8]> = match &self.next {
            Bound::Included(key) => Bound::Included(key.as_bytes()),
            Bound::Excluded(key) => Bound::Excluded(key.as_bytes()),
            Bound::Unbounded => Bound::Unbounded,
        };
        let entry = self.map.lower_bound(bound)?;
        let key = entry.key().clone();
        let value = entry.value().clone().into_option();
        self.next = Bound::Excluded(key.clone());
        Some(KeyValue { key, value })
    }
}
