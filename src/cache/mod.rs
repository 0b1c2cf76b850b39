//! Cache Module
//!
//! Per-function result storage: argument keys, entries, and statistics.

mod entry;
mod key;
mod stats;
mod store;


// Re-export public types
pub use entry::CacheEntry;
pub use key::CacheKey;
pub use stats::CacheStats;
pub use store::CacheStore;
