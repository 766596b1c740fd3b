//! Heap-based k-way merge with shadowing.
//!
//! Every source yields ascending keys. Sources are ranked by their position
//! in the input vector: a later source shadows an earlier one when both hold
//! the same key. The merged stream yields each key once, taken from the
//! highest-ranked source holding it, and drops keys whose winning entry is a
//! tombstone.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

use super::EngineError;
use crate::view::{KeyValue, compare};

/// One input stream of a [`MergeIterator`].
pub type Source = Box<dyn Iterator<Item = Result<KeyValue, EngineError>> + Send>;

/// Predicate that ends a merged stream at the first entry it rejects.
pub type Predicate = Box<dyn FnMut(&KeyValue) -> bool + Send>;

struct HeapEntry {
    kv: KeyValue,
    priority: usize,
}

impl Ord for HeapEntry {
    /// Reversed `(key ASC, priority DESC)`, so the max-heap pops the smallest
    /// key first and, among equal keys, the newest source first.
    fn cmp(&self, other: &Self) -> Ordering {
        match compare(&self.kv.key, &other.kv.key) {
            Ordering::Equal => self.priority.cmp(&other.priority),
            ord => ord.reverse(),
        }
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// Merged, deduplicated, tombstone-free view over several sorted sources.
///
/// Yields at most one error; the stream ends after it.
pub struct MergeIterator {
    sources: Vec<Source>,
    heap: BinaryHeap<HeapEntry>,
    predicate: Option<Predicate>,
    done: bool,
}

impl fmt::Debug for MergeIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeIterator")
            .field("sources", &self.sources.len())
            .field("pending", &self.heap.len())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl MergeIterator {
    /// Merges `sources`, lowest priority first.
    ///
    /// The head of every source is read here, so an error in any first
    /// entry is returned immediately.
    pub fn new(sources: Vec<Source>) -> Result<Self, EngineError> {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            predicate: None,
            done: false,
        };
        for priority in 0..merge.sources.len() {
            merge.advance(priority)?;
        }
        Ok(merge)
    }

    /// Ends the stream at the first live entry `predicate` rejects.
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Pulls the next entry of source `priority` onto the heap.
    fn advance(&mut self, priority: usize) -> Result<(), EngineError> {
        if let Some(next) = self.sources[priority].next() {
            self.heap.push(HeapEntry {
                kv: next?,
                priority,
            });
        }
        Ok(())
    }

    /// Next distinct key, taken from its highest-priority source. Shadowed
    /// entries for the same key are consumed and dropped.
    fn next_key(&mut self) -> Result<Option<KeyValue>, EngineError> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        self.advance(top.priority)?;

        while let Some(shadowed) = self.heap.peek() {
            if compare(&shadowed.kv.key, &top.kv.key).is_ne() {
                break;
            }
            let priority = shadowed.priority;
            self.heap.pop();
            self.advance(priority)?;
        }
        Ok(Some(top.kv))
    }
}

impl Iterator for MergeIterator {
    type Item = Result<KeyValue, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.next_key() {
                Ok(Some(kv)) if kv.is_tombstone() => continue,
                Ok(Some(kv)) => {
                    if let Some(predicate) = self.predicate.as_mut() {
                        if !predicate(&kv) {
                            self.done = true;
                            return None;
                        }
                    }
                    return Some(Ok(kv));
                }
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
