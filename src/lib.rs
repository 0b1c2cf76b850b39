//! Mem Cacher - Function memoization with time-based expiry
//!
//! Wraps synchronous, fallible, or asynchronous functions so that calls
//! with equal arguments are answered from a per-function cache. Entries can
//! live forever, for a fixed max age, or until an absolute expiration date.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod memoize;
pub mod tasks;

pub use cache::{CacheKey, CacheStats};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ExpiryPolicy, Options};
pub use error::{MemoizeError, Result};
pub use memoize::{
    memoize, memoize_async, memoize_fallible, Memoized, MemoizedAsync, MemoizedFallible, Memoizer,
    PendingResult,
};
pub use tasks::{DefaultScheduler, Scheduler, ThreadScheduler, TokioScheduler, VirtualTimer};
