//! Pending-batch registry.
//!
//! Keys requested since the last flush accumulate in a [`PendingBatch`],
//! each with the list of callers waiting on it. A flush swaps the whole
//! batch out for an empty one carrying the next generation number, so a
//! flushed batch is never touched by later registrations. A timeout task
//! remembers the generation it was scheduled for and does nothing once that
//! generation has already been flushed.

use std::collections::HashMap;
use std::hash::Hash;

use tokio::task::AbortHandle;

use super::thunk::Resolver;

/// Keys and waiters accumulated since the previous flush.
#[derive(Debug)]
pub(crate) struct PendingBatch<K, V> {
    generation: u64,
    // Insertion order of unique keys; this is the order handed to the fetch function.
    keys: Vec<K>,
    waiters: HashMap<K, Vec<Resolver<V>>>,
    timer: Option<AbortHandle>,
}

/// A batch that has been swapped out and is ready to execute.
#[derive(Debug)]
pub(crate) struct FlushedBatch<K, V> {
    pub(crate) generation: u64,
    pub(crate) keys: Vec<K>,
    pub(crate) waiters: HashMap<K, Vec<Resolver<V>>>,
}

impl<K, V> PendingBatch<K, V>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn new(generation: u64) -> Self {
        Self {
            generation,
            keys: Vec::new(),
            waiters: HashMap::new(),
            timer: None,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of unique keys queued.
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Adds a waiter for `key`; a key already queued gains another waiter.
    pub(crate) fn register(&mut self, key: K, resolver: Resolver<V>) {
        match self.waiters.get_mut(&key) {
            Some(list) => list.push(resolver),
            None => {
                self.keys.push(key.clone());
                self.waiters.insert(key, vec![resolver]);
            }
        }
    }

    /// Remembers the timeout task scheduled for this generation.
    pub(crate) fn set_timer(&mut self, timer: AbortHandle) {
        if let Some(previous) = self.timer.replace(timer) {
            previous.abort();
        }
    }

    /// Swaps this batch out for an empty one of the next generation.
    ///
    /// The pending timeout task, if any, is aborted. Even if it has already
    /// woken up, its generation no longer matches and it will not flush.
    pub(crate) fn take(&mut self) -> FlushedBatch<K, V> {
        let next = Self::new(self.generation.wrapping_add(1));
        let taken = std::mem::replace(self, next);
        if let Some(timer) = taken.timer {
            timer.abort();
        }
        FlushedBatch {
            generation: taken.generation,
            keys: taken.keys,
            waiters: taken.waiters,
        }
    }
}
