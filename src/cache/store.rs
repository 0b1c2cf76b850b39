//! Cache Store Module
//!
//! Per-wrapper map from argument keys to stored results.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::cache::{CacheEntry, CacheKey, CacheStats};

// == Cache Store ==
/// Storage owned by one memoized function.
///
/// Entries are never checked for expiry on read: they stay until
/// [`CacheStore::expire`] is called by their timer.
#[derive(Debug)]
pub struct CacheStore<V> {
    /// Key-value storage
    entries: HashMap<CacheKey, CacheEntry<V>>,
    /// Performance statistics
    stats: CacheStats,
    /// Generation handed to the next inserted entry
    next_generation: u64,
}

impl<V> Default for CacheStore<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            stats: CacheStats::new(),
            next_generation: 0,
        }
    }
}

impl<V: Clone> CacheStore<V> {
    // == Constructor ==
    pub fn new() -> Self {
        Self::default()
    }

    // == Get ==
    /// Returns a clone of the stored result, recording a hit or a miss.
    pub fn get(&mut self, key: &CacheKey) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) => {
                self.stats.record_hit();
                Some(entry.value.clone())
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    // == Insert ==
    /// Stores `value` under `key`, replacing any previous entry.
    ///
    /// Returns the generation of the new entry, which the caller hands to
    /// the expiry timer.
    pub fn insert(&mut self, key: CacheKey, value: V) -> u64 {
        let generation = self.bump_generation();
        self.entries.insert(key, CacheEntry::new(value, generation));
        self.stats.set_total_entries(self.entries.len());
        generation
    }

    // == Get Or Insert ==
    /// Stores `value` unless `key` is already present.
    ///
    /// Returns the stored result and, when `value` was the one inserted,
    /// its generation. A present entry is returned untouched, counted as a
    /// hit, and `value` is dropped.
    pub fn get_or_insert(&mut self, key: CacheKey, value: V) -> (V, Option<u64>) {
        let generation = self.next_generation;
        let stored = match self.entries.entry(key) {
            Entry::Occupied(existing) => {
                self.stats.record_hit();
                return (existing.get().value.clone(), None);
            }
            Entry::Vacant(slot) => slot.insert(CacheEntry::new(value, generation)).value.clone(),
        };

        self.bump_generation();
        self.stats.set_total_entries(self.entries.len());
        (stored, Some(generation))
    }

    // == Expire ==
    /// Removes the entry for `key` if it is still the given generation.
    ///
    /// Returns false when the key is gone or holds a newer entry.
    pub fn expire(&mut self, key: &CacheKey, generation: u64) -> bool {
        let current = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation);
        if !current {
            return false;
        }

        self.entries.remove(key);
        self.stats.record_expiration();
        self.stats.set_total_entries(self.entries.len());
        true
    }

    // == Discard ==
    /// Removes the entry for `key` if it is still the given generation,
    /// without counting an expiration. Used when no timer could be armed.
    pub fn discard(&mut self, key: &CacheKey, generation: u64) -> bool {
        let current = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation);
        if current {
            self.entries.remove(key);
            self.stats.set_total_entries(self.entries.len());
        }
        current
    }

    // == Stats ==
    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.clone();
        stats.set_total_entries(self.entries.len());
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        generation
    }
}
