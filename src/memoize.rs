//! Memoization Module
//!
//! Wraps a function so that repeated calls with equal arguments are served
//! from a private cache until the configured expiry policy removes them.
//!
//! Three wrappers share the same cache lifecycle:
//! - [`Memoized`] stores every return value
//! - [`MemoizedFallible`] stores only `Ok` values
//! - [`MemoizedAsync`] stores the pending future itself on the first call,
//!   so concurrent callers with equal arguments share one computation

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::cache::{CacheKey, CacheStats, CacheStore};
use crate::clock::{Clock, SystemClock};
use crate::config::{ExpiryPolicy, Options};
use crate::error::Result;
use crate::tasks::{DefaultScheduler, Scheduler};

/// Handle to an asynchronous result, shared by every caller with equal
/// arguments. Awaiting a clone after completion yields the stored output.
pub type PendingResult<T> = Shared<BoxFuture<'static, T>>;

// == Memoizer ==
/// Validated memoization settings, used to wrap any number of functions.
///
/// Each wrapped function gets its own cache; nothing is shared between
/// functions wrapped by the same `Memoizer`.
#[derive(Clone)]
pub struct Memoizer {
    policy: ExpiryPolicy,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
}

impl Memoizer {
    // == Constructor ==
    /// Validates `options`. Fails before any function is wrapped.
    pub fn new(options: Options) -> Result<Self> {
        let policy = options.validate()?;
        Ok(Self::with_policy(policy))
    }

    /// Builds a memoizer from an already resolved policy.
    pub fn with_policy(policy: ExpiryPolicy) -> Self {
        debug!(?policy, "memoizer configured");
        Self {
            policy,
            scheduler: Arc::new(DefaultScheduler),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the timer used to expire entries.
    pub fn with_scheduler<S: Scheduler + 'static>(mut self, scheduler: S) -> Self {
        self.scheduler = Arc::new(scheduler);
        self
    }

    /// Replaces the clock used to resolve expiration dates into delays.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn policy(&self) -> ExpiryPolicy {
        self.policy
    }

    // == Wrap ==
    /// Wraps a synchronous function. Every return value is cached.
    pub fn wrap<A, R, F>(&self, func: F) -> Memoized<A, R>
    where
        A: Serialize,
        R: Clone + Send + 'static,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        Memoized {
            func: Arc::new(func),
            core: MemoCore::new(self),
        }
    }

    /// Wraps a function returning `Result`. Only `Ok` values are cached.
    pub fn wrap_fallible<A, T, E, F>(&self, func: F) -> MemoizedFallible<A, T, E>
    where
        A: Serialize,
        T: Clone + Send + 'static,
        F: Fn(A) -> std::result::Result<T, E> + Send + Sync + 'static,
    {
        MemoizedFallible {
            func: Arc::new(func),
            core: MemoCore::new(self),
        }
    }

    /// Wraps an asynchronous function. The pending future is cached as soon
    /// as the first call returns, before it completes.
    pub fn wrap_async<A, T, F, Fut>(&self, func: F) -> MemoizedAsync<A, T>
    where
        A: Serialize,
        T: Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        MemoizedAsync {
            func: Arc::new(move |args: A| -> BoxFuture<'static, T> { func(args).boxed() }),
            core: MemoCore::new(self),
        }
    }
}

impl fmt::Debug for Memoizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoizer")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

// == Factory Functions ==
/// Memoizes `func` with the given options.
///
/// ```
/// use mem_cacher::{memoize, Options};
///
/// let add = memoize(|(x, y): (i64, i64)| x + y, Options::new().max_age(1000))?;
/// assert_eq!(add.call((1, 2)), 3);
/// assert_eq!(add.call((1, 2)), 3);
/// assert_eq!(add.stats().hits, 1);
/// # Ok::<(), mem_cacher::MemoizeError>(())
/// ```
pub fn memoize<A, R, F>(func: F, options: Options) -> Result<Memoized<A, R>>
where
    A: Serialize,
    R: Clone + Send + 'static,
    F: Fn(A) -> R + Send + Sync + 'static,
{
    Ok(Memoizer::new(options)?.wrap(func))
}

/// Memoizes a `Result`-returning `func`, caching only successes.
pub fn memoize_fallible<A, T, E, F>(func: F, options: Options) -> Result<MemoizedFallible<A, T, E>>
where
    A: Serialize,
    T: Clone + Send + 'static,
    F: Fn(A) -> std::result::Result<T, E> + Send + Sync + 'static,
{
    Ok(Memoizer::new(options)?.wrap_fallible(func))
}

/// Memoizes an asynchronous `func`.
pub fn memoize_async<A, T, F, Fut>(func: F, options: Options) -> Result<MemoizedAsync<A, T>>
where
    A: Serialize,
    T: Clone + Send + Sync + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    Ok(Memoizer::new(options)?.wrap_async(func))
}

// == Memoized ==
/// A memoized synchronous function. Clones share one cache.
pub struct Memoized<A, R> {
    func: Arc<dyn Fn(A) -> R + Send + Sync>,
    core: MemoCore<R>,
}

impl<A, R> Memoized<A, R>
where
    A: Serialize,
    R: Clone + Send + 'static,
{
    /// Returns the cached result for `args`, or calls the function and
    /// caches what it returns. A panic in the function caches nothing.
    pub fn call(&self, args: A) -> R {
        let Some(key) = key_for(&args) else {
            return (self.func)(args);
        };
        if let Some(hit) = self.core.lookup(&key) {
            return hit;
        }

        let result = (self.func)(args);
        self.core.store(key, result.clone());
        result
    }

    /// Converts into a plain closure.
    pub fn into_fn(self) -> impl Fn(A) -> R {
        move |args| self.call(args)
    }

    /// Returns hit, miss and expiration counters for this function.
    pub fn stats(&self) -> CacheStats {
        self.core.lock().stats()
    }

    /// Number of results currently cached.
    pub fn len(&self) -> usize {
        self.core.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.lock().is_empty()
    }
}

impl<A, R> Clone for Memoized<A, R> {
    fn clone(&self) -> Self {
        Self {
            func: self.func.clone(),
            core: self.core.clone(),
        }
    }
}

impl<A, R> fmt::Debug for Memoized<A, R>
where
    R: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoized")
            .field("policy", &self.core.policy)
            .field("entries", &self.core.lock().len())
            .finish_non_exhaustive()
    }
}

// == Memoized Fallible ==
/// A memoized function returning `Result`. Errors are returned to the
/// caller and never cached.
pub struct MemoizedFallible<A, T, E> {
    func: Arc<dyn Fn(A) -> std::result::Result<T, E> + Send + Sync>,
    core: MemoCore<T>,
}

impl<A, T, E> MemoizedFallible<A, T, E>
where
    A: Serialize,
    T: Clone + Send + 'static,
{
    pub fn call(&self, args: A) -> std::result::Result<T, E> {
        let Some(key) = key_for(&args) else {
            return (self.func)(args);
        };
        if let Some(hit) = self.core.lookup(&key) {
            return Ok(hit);
        }

        let value = (self.func)(args)?;
        self.core.store(key, value.clone());
        Ok(value)
    }

    pub fn into_fn(self) -> impl Fn(A) -> std::result::Result<T, E> {
        move |args| self.call(args)
    }

    /// Returns hit, miss and expiration counters for this function.
    pub fn stats(&self) -> CacheStats {
        self.core.lock().stats()
    }

    /// Number of results currently cached.
    pub fn len(&self) -> usize {
        self.core.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.lock().is_empty()
    }
}

impl<A, T, E> Clone for MemoizedFallible<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            func: self.func.clone(),
            core: self.core.clone(),
        }
    }
}

impl<A, T, E> fmt::Debug for MemoizedFallible<A, T, E>
where
    T: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizedFallible")
            .field("policy", &self.core.policy)
            .field("entries", &self.core.lock().len())
            .finish_non_exhaustive()
    }
}

// == Memoized Async ==
/// A memoized asynchronous function.
///
/// The first call for some arguments stores the pending computation and
/// every later call receives a clone of it, whether or not it has finished.
/// A computation that resolves to an error stays cached like any other
/// output until its timer removes it.
pub struct MemoizedAsync<A, T> {
    func: Arc<dyn Fn(A) -> BoxFuture<'static, T> + Send + Sync>,
    core: MemoCore<PendingResult<T>>,
}

impl<A, T> MemoizedAsync<A, T>
where
    A: Serialize,
    T: Clone + Send + Sync + 'static,
{
    pub fn call(&self, args: A) -> PendingResult<T> {
        let Some(key) = key_for(&args) else {
            return (self.func)(args).shared();
        };
        if let Some(pending) = self.core.lookup(&key) {
            return pending;
        }

        // Futures are lazy: if another caller stored one for this key in
        // the meantime, ours is dropped without ever running.
        let pending = (self.func)(args).shared();
        self.core.get_or_store(key, pending)
    }

    pub fn into_fn(self) -> impl Fn(A) -> PendingResult<T> {
        move |args| self.call(args)
    }

    /// Returns hit, miss and expiration counters for this function.
    pub fn stats(&self) -> CacheStats {
        self.core.lock().stats()
    }

    /// Number of results currently cached.
    pub fn len(&self) -> usize {
        self.core.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.lock().is_empty()
    }
}

impl<A, T> Clone for MemoizedAsync<A, T> {
    fn clone(&self) -> Self {
        Self {
            func: self.func.clone(),
            core: self.core.clone(),
        }
    }
}

impl<A, T> fmt::Debug for MemoizedAsync<A, T>
where
    PendingResult<T>: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizedAsync")
            .field("policy", &self.core.policy)
            .field("entries", &self.core.lock().len())
            .finish_non_exhaustive()
    }
}

// == Memo Core ==
/// Cache, policy and timers shared by every wrapper type.
struct MemoCore<V> {
    store: Arc<Mutex<CacheStore<V>>>,
    policy: ExpiryPolicy,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
}

impl<V> Clone for MemoCore<V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            policy: self.policy,
            scheduler: self.scheduler.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<V: Clone + Send + 'static> MemoCore<V> {
    fn new(memoizer: &Memoizer) -> Self {
        Self {
            store: Arc::new(Mutex::new(CacheStore::new())),
            policy: memoizer.policy,
            scheduler: memoizer.scheduler.clone(),
            clock: memoizer.clock.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheStore<V>> {
        lock_store(&self.store)
    }

    fn lookup(&self, key: &CacheKey) -> Option<V> {
        let hit = self.lock().get(key);
        match hit {
            Some(_) => debug!(%key, "cache hit"),
            None => debug!(%key, "cache miss"),
        }
        hit
    }

    /// Stores `value`, replacing any entry for `key`, and arms its timer.
    fn store(&self, key: CacheKey, value: V) {
        let delay = self.policy.delay_from(self.clock.now());
        let generation = self.lock().insert(key.clone(), value);

        if let Some(delay) = delay {
            self.arm_expiry(key, generation, delay);
        }
    }

    /// Stores `value` unless `key` already has an entry; returns whichever
    /// value ends up cached.
    fn get_or_store(&self, key: CacheKey, value: V) -> V {
        let delay = self.policy.delay_from(self.clock.now());
        let (stored, generation) = self.lock().get_or_insert(key.clone(), value);

        match (generation, delay) {
            (Some(generation), Some(delay)) => self.arm_expiry(key, generation, delay),
            (None, _) => debug!(%key, "cache hit on store"),
            _ => {}
        }
        stored
    }

    /// Arms the timer that expires `generation` of `key`. An entry whose
    /// timer cannot be armed is dropped at once rather than kept forever.
    fn arm_expiry(&self, key: CacheKey, generation: u64, delay: Duration) {
        trace!(%key, delay_ms = duration_ms(delay), "scheduling expiry");

        // The timer must not keep a dropped wrapper's cache alive.
        let store = Arc::downgrade(&self.store);
        let timer_key = key.clone();
        let armed = self.scheduler.schedule(
            delay,
            Box::new(move || {
                let Some(store) = store.upgrade() else {
                    return;
                };
                if lock_store(&store).expire(&timer_key, generation) {
                    debug!(key = %timer_key, "cache entry expired");
                }
            }),
        );

        if let Err(err) = armed {
            warn!(%key, error = %err, "expiry not armed, dropping cache entry");
            self.lock().discard(&key, generation);
        }
    }
}

fn lock_store<V>(store: &Mutex<CacheStore<V>>) -> MutexGuard<'_, CacheStore<V>> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key_for<A: Serialize>(args: &A) -> Option<CacheKey> {
    match CacheKey::derive(args) {
        Ok(key) => Some(key),
        Err(err) => {
            warn!(error = %err, "arguments cannot be keyed, calling through uncached");
            None
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
