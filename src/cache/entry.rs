//! Cache Entry Module
//!
//! Defines the structure for individual memoized results.

// == Cache Entry ==
/// A single stored result with its bookkeeping.
///
/// Entries carry no timestamps: expiry is enforced by the timer armed when
/// the entry is stored, and the generation is what that timer checks.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The stored result, or a pending computation for async functions
    pub value: V,
    /// Store-wide sequence number identifying this entry
    pub generation: u64,
}

impl<V> CacheEntry<V> {
    // == Constructor ==
    pub fn new(value: V, generation: u64) -> Self {
        Self { value, generation }
    }
}
