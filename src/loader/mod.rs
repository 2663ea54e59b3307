//! Batch coalescer and dispatcher — the [`Loader`] entry points.
//!
//! A [`Loader`] turns many single-key requests into few batched fetches:
//!
//! 1. [`Loader::load`] checks the result cache and returns hits immediately.
//! 2. A miss for a key that is already being fetched joins that fetch.
//! 3. Any other miss is queued in the current pending batch together with a
//!    handle the caller waits on.
//! 4. The batch is flushed when it reaches `max_batch_size` (inline, by the
//!    call that filled it) or when `batch_timeout` has elapsed since its first
//!    key arrived (by a timer task owned by this loader), whichever comes
//!    first. Generation numbers make sure only one of the two flushes it.
//! 5. The executor runs the fetch function on its own task, writes every
//!    result into the cache and wakes every waiter of every key.
//!
//! All shared state sits behind one mutex that is never held across an
//! `.await`; the fetch itself and the waking of waiters happen outside it.
//!
//! Loaders spawn Tokio tasks, so they must be driven from a Tokio runtime.

mod batch;
mod executor;
mod thunk;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use self::batch::{FlushedBatch, PendingBatch};
use self::thunk::{Resolver, Thunk};
use crate::cache::ResultCache;
use crate::config::{ConfigError, LoaderConfig};
use crate::fetch::{BatchFn, FetchContext, FetchError};
use crate::stats::{StatsCollector, StatsSnapshot};

/// Why a load did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// The fetch function reported an error for this key.
    #[error("fetch failed: {0}")]
    Fetch(#[source] FetchError),

    /// The fetch function failed the whole batch this key was part of.
    #[error("batch failed: {0}")]
    Batch(#[source] FetchError),

    /// The fetch function returned fewer results than keys.
    #[error("batch function returned {returned} of {expected} results, none at {position}")]
    MissingResult {
        position: usize,
        returned: usize,
        expected: usize,
    },

    /// The loader was dropped while the batch was in flight.
    #[error("batch cancelled")]
    Cancelled,

    /// The fetch function ran past the configured fetch timeout.
    #[error("batch fetch deadline exceeded")]
    FetchTimeout,

    /// This caller stopped waiting. Other callers of the same key are unaffected.
    #[error("gave up waiting after {0:?}")]
    Timeout(Duration),

    /// The result was lost because the loader went away.
    #[error("loader dropped before the key resolved")]
    Dropped,
}

impl LoadError {
    /// Whether this outcome is a confirmed result worth memoizing.
    ///
    /// Fetch and batch failures are cached like values; cancellations and
    /// timeouts are not, so a later load tries again.
    pub fn is_cacheable(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled | Self::FetchTimeout | Self::Timeout(_) | Self::Dropped
        )
    }
}

/// A batching, caching loader for values of type `V` keyed by `K`.
///
/// Cloning a `Loader` is cheap and every clone shares the same cache,
/// pending batch and statistics. When the last clone is dropped, in-flight
/// fetches are cancelled through their [`FetchContext`].
///
/// # Examples
///
/// ```rust,no_run
/// use dataloader::{FetchContext, FetchError, Loader};
///
/// #[tokio::main]
/// async fn main() {
///     let loader = Loader::new(|_ctx: FetchContext, keys: Vec<u64>| async move {
///         let values: Vec<Result<u64, FetchError>> = keys.into_iter().map(|k| Ok(k * 2)).collect();
///         Ok::<_, FetchError>(values)
///     });
///
///     let (a, b) = tokio::join!(loader.load(1), loader.load(2));
///     assert_eq!(a.unwrap(), 2);
///     assert_eq!(b.unwrap(), 4);
///     assert_eq!(loader.stats().batch_count, 1);
/// }
/// ```
pub struct Loader<K, V, F> {
    inner: Arc<Inner<K, V, F>>,
}

impl<K, V, F> Clone for Loader<K, V, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K, V, F> {
    state: Mutex<State<K, V>>,
    fetch: Arc<F>,
    config: LoaderConfig,
    stats: Arc<StatsCollector>,
    cancel: CancellationToken,
    // Cancels every in-flight fetch once the last loader handle is gone.
    _cancel_on_drop: DropGuard,
}

struct State<K, V> {
    cache: ResultCache<K, Result<V, LoadError>>,
    pending: PendingBatch<K, V>,
    in_flight: HashMap<K, Vec<Resolver<V>>>,
}

// Keys of a flushed batch, waiters already moved to the in-flight map.
struct Dispatch<K> {
    generation: u64,
    keys: Vec<K>,
}

impl<K, V, F> Loader<K, V, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: BatchFn<K, V>,
{
    /// Creates a loader with the default [`LoaderConfig`].
    pub fn new(fetch: F) -> Self {
        let stats = Arc::new(StatsCollector::new());
        Self::build(fetch, LoaderConfig::default(), stats)
    }

    /// Creates a loader with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` fails validation.
    pub fn with_config(fetch: F, config: LoaderConfig) -> Result<Self, ConfigError> {
        Self::with_stats(fetch, config, Arc::new(StatsCollector::new()))
    }

    /// Creates a loader that reports into an existing, possibly shared,
    /// statistics collector.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` fails validation.
    pub fn with_stats(
        fetch: F,
        config: LoaderConfig,
        stats: Arc<StatsCollector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(fetch, config, stats))
    }

    fn build(fetch: F, config: LoaderConfig, stats: Arc<StatsCollector>) -> Self {
        let cancel = CancellationToken::new();
        let inner = Inner {
            state: Mutex::new(State {
                cache: ResultCache::new(),
                pending: PendingBatch::new(0),
                in_flight: HashMap::new(),
            }),
            fetch: Arc::new(fetch),
            config,
            stats,
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Loads the value for `key`.
    ///
    /// Returns the cached result if there is one. Otherwise the key joins the
    /// next batch (or the fetch already running for it) and this call waits
    /// until that batch resolves. Dropping the returned future abandons only
    /// this caller's wait.
    pub async fn load(&self, key: K) -> Result<V, LoadError> {
        let thunk = self.inner.enqueue_one(key);
        thunk.wait().await
    }

    /// Loads many keys, returning results in the same order as `keys`.
    ///
    /// All keys are registered at once, so they land in as few batches as
    /// `max_batch_size` allows. A failing key does not affect the others.
    pub async fn load_many<I>(&self, keys: I) -> Vec<Result<V, LoadError>>
    where
        I: IntoIterator<Item = K>,
    {
        let thunks = self.inner.enqueue(keys);
        let mut results = Vec::with_capacity(thunks.len());
        for thunk in thunks {
            results.push(thunk.wait().await);
        }
        results
    }

    /// Like [`load`](Self::load), but gives up after `timeout`.
    ///
    /// Giving up is local to this call: the batch still runs, other callers
    /// still get the result and the cache is still filled.
    pub async fn load_timeout(&self, key: K, timeout: Duration) -> Result<V, LoadError> {
        match tokio::time::timeout(timeout, self.load(key)).await {
            Ok(result) => result,
            Err(_) => Err(LoadError::Timeout(timeout)),
        }
    }

    /// Seeds the cache with `value` for `key`.
    ///
    /// Returns `false` and leaves the cache untouched if `key` already has a
    /// cached result or caching is disabled.
    pub fn prime(&self, key: K, value: V) -> bool {
        if !self.inner.config.cache {
            return false;
        }
        self.inner.lock().cache.put(key, Ok(value))
    }

    /// Flushes the pending batch now instead of waiting for the timeout.
    ///
    /// Does nothing if no keys are pending.
    pub fn dispatch(&self) {
        let dispatch = Inner::<K, V, F>::flush_locked(&mut self.inner.lock());
        if let Some(dispatch) = dispatch {
            debug!(generation = dispatch.generation, size = dispatch.keys.len(), "manual flush");
            self.inner.spawn_batch(dispatch);
        }
    }

    /// Drops every cached result.
    pub fn clear(&self) {
        self.inner.lock().cache.clear();
    }

    /// Drops the cached result for `key`, so the next load fetches it again.
    ///
    /// Returns `true` if an entry was removed. A fetch already in flight for
    /// `key` is not affected and will cache its result when it completes.
    pub fn clear_key(&self, key: &K) -> bool {
        self.inner.lock().cache.clear_key(key).is_some()
    }

    /// Returns a snapshot of this loader's statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// The collector this loader reports into.
    pub fn stats_collector(&self) -> &Arc<StatsCollector> {
        &self.inner.stats
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// Number of unique keys waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Number of cached keys.
    pub fn cached_len(&self) -> usize {
        self.inner.lock().cache.len()
    }
}

impl<K, V, F> Inner<K, V, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: BatchFn<K, V>,
{
    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue_one(self: &Arc<Self>, key: K) -> Thunk<V> {
        let mut flushed: Option<Dispatch<K>> = None;
        let thunk = {
            let mut state = self.lock();
            self.register(&mut state, key, &mut |dispatch: Dispatch<K>| flushed = Some(dispatch))
        };
        if let Some(dispatch) = flushed {
            self.spawn_batch(dispatch);
        }
        thunk
    }

    fn enqueue<I>(self: &Arc<Self>, keys: I) -> Vec<Thunk<V>>
    where
        I: IntoIterator<Item = K>,
    {
        let mut flushed: Vec<Dispatch<K>> = Vec::new();
        let mut thunks = Vec::new();
        {
            let mut state = self.lock();
            for key in keys {
                let thunk = self.register(&mut state, key, &mut |dispatch: Dispatch<K>| {
                    flushed.push(dispatch);
                });
                thunks.push(thunk);
            }
        }
        for dispatch in flushed {
            self.spawn_batch(dispatch);
        }
        thunks
    }

    // Registers one request under the lock. A batch filled by this key is
    // handed to `on_flush`; the caller spawns it after releasing the lock.
    fn register(
        self: &Arc<Self>,
        state: &mut State<K, V>,
        key: K,
        on_flush: &mut dyn FnMut(Dispatch<K>),
    ) -> Thunk<V> {
        if self.config.cache {
            if let Some(result) = state.cache.get(&key) {
                trace!("cache hit");
                self.stats.record_request(true);
                return Thunk::ready(result.clone());
            }
        }
        self.stats.record_request(false);

        let (resolver, thunk) = Thunk::channel();
        if let Some(waiters) = state.in_flight.get_mut(&key) {
            trace!("joining in-flight fetch");
            waiters.push(resolver);
            return thunk;
        }

        let opens_batch = state.pending.is_empty();
        state.pending.register(key, resolver);

        if state.pending.len() >= self.config.max_batch_size {
            debug!(
                generation = state.pending.generation(),
                size = state.pending.len(),
                "batch full, flushing"
            );
            if let Some(dispatch) = Self::flush_locked(state) {
                on_flush(dispatch);
            }
        } else if opens_batch {
            self.schedule_flush(state);
        }
        thunk
    }

    // Starts the timeout task for the current generation.
    fn schedule_flush(self: &Arc<Self>, state: &mut State<K, V>) {
        let generation = state.pending.generation();
        let delay = self.config.batch_timeout;
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush_generation(generation);
            }
        });
        state.pending.set_timer(timer.abort_handle());
    }

    fn flush_generation(self: &Arc<Self>, generation: u64) {
        let dispatch = {
            let mut state = self.lock();
            if state.pending.generation() != generation {
                trace!(generation, "batch already flushed");
                return;
            }
            debug!(generation, size = state.pending.len(), "batch timeout elapsed, flushing");
            Self::flush_locked(&mut state)
        };
        if let Some(dispatch) = dispatch {
            self.spawn_batch(dispatch);
        }
    }

    // Swaps out the pending batch and moves its waiters to the in-flight map.
    fn flush_locked(state: &mut State<K, V>) -> Option<Dispatch<K>> {
        if state.pending.is_empty() {
            return None;
        }
        let FlushedBatch {
            generation,
            keys,
            waiters,
        } = state.pending.take();
        state.in_flight.extend(waiters);
        Some(Dispatch { generation, keys })
    }

    fn spawn_batch(self: &Arc<Self>, dispatch: Dispatch<K>) {
        let Dispatch { generation, keys } = dispatch;
        let deadline = self.config.fetch_timeout.map(|t| Instant::now() + t);
        let ctx = FetchContext::new(self.cancel.child_token(), deadline, generation);
        let fetch = Arc::clone(&self.fetch);
        let stats = Arc::clone(&self.stats);
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            let size = keys.len();
            let started = Instant::now();
            let results = executor::execute(fetch, ctx, keys.clone()).await;
            let elapsed = started.elapsed();
            stats.record_batch(size, elapsed);
            debug!(generation, size, ?elapsed, "batch resolved");

            // Without the loader there is no one left to deliver to.
            if let Some(inner) = weak.upgrade() {
                inner.complete(keys, results);
            }
        });
    }

    // Caches each result, then wakes every waiter outside the lock.
    fn complete(&self, keys: Vec<K>, results: Vec<Result<V, LoadError>>) {
        let mut deliveries = Vec::with_capacity(keys.len());
        {
            let mut state = self.lock();
            for (key, result) in keys.into_iter().zip(results) {
                let waiters = state.in_flight.remove(&key).unwrap_or_default();
                let cacheable = match &result {
                    Ok(_) => true,
                    Err(err) => err.is_cacheable(),
                };
                if self.config.cache && cacheable {
                    state.cache.put(key, result.clone());
                }
                deliveries.push((waiters, result));
            }
        }

        for (waiters, result) in deliveries {
            for waiter in waiters {
                waiter.resolve(result.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    type Calls = Arc<Mutex<Vec<Vec<u32>>>>;

    // Doubles every key and records the keys of each invocation.
    fn recording_loader(config: LoaderConfig) -> (Loader<u32, u32, impl BatchFn<u32, u32>>, Calls) {
        let calls: Calls = Arc::default();
        let seen = Arc::clone(&calls);
        let fetch = move |_ctx: FetchContext, keys: Vec<u32>| {
            seen.lock().unwrap().push(keys.clone());
            async move {
                let values: Vec<Result<u32, FetchError>> =
                    keys.into_iter().map(|k| Ok(k * 2)).collect();
                Ok::<_, FetchError>(values)
            }
        };
        (Loader::with_config(fetch, config).unwrap(), calls)
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hit_skips_the_registry() {
        let (loader, calls) = recording_loader(LoaderConfig::default());
        assert_eq!(loader.load(5).await.unwrap(), 10);
        assert_eq!(loader.pending_len(), 0);
        assert_eq!(loader.load(5).await.unwrap(), 10);
        assert_eq!(calls.lock().unwrap().len(), 1);

        let stats = loader.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn size_flush_happens_inline() {
        let (loader, calls) = recording_loader(LoaderConfig::default().with_max_batch_size(2));
        let thunks = loader.inner.enqueue([1, 2, 3]);
        // [1, 2] filled a batch and left; 3 opened the next generation.
        assert_eq!(loader.pending_len(), 1);
        assert_eq!(loader.inner.lock().pending.generation(), 1);
        assert_eq!(loader.inner.lock().in_flight.len(), 2);

        for thunk in thunks {
            thunk.wait().await.unwrap();
        }
        assert_eq!(*calls.lock().unwrap(), vec![vec![1, 2], vec![3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_does_not_flush_next_generation() {
        let (loader, calls) = recording_loader(LoaderConfig::default().with_max_batch_size(10));
        let first = loader.inner.enqueue_one(1);
        loader.dispatch();
        // Generation 1 is now pending; firing the old generation is a no-op.
        let second = loader.inner.enqueue_one(2);
        loader.inner.flush_generation(0);
        assert_eq!(loader.pending_len(), 1);

        first.wait().await.unwrap();
        second.wait().await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![vec![1], vec![2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_on_empty_batch_is_noop() {
        let (loader, calls) = recording_loader(LoaderConfig::default());
        loader.dispatch();
        loader.inner.flush_generation(0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(loader.stats().batch_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_key_is_joined_not_refetched() {
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let invocations = Arc::new(AtomicUsize::new(0));
        let fetch = {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            let invocations = Arc::clone(&invocations);
            move |_ctx: FetchContext, keys: Vec<u32>| {
                let started = Arc::clone(&started);
                let release = Arc::clone(&release);
                invocations.fetch_add(1, Ordering::SeqCst);
                async move {
                    started.notify_one();
                    release.notified().await;
                    let values: Vec<Result<u32, FetchError>> = keys.into_iter().map(Ok).collect();
                    Ok::<_, FetchError>(values)
                }
            }
        };
        let loader = Loader::new(fetch);

        let first = loader.inner.enqueue_one(9);
        loader.dispatch();
        started.notified().await;

        let second = loader.inner.enqueue_one(9);
        assert_eq!(loader.pending_len(), 0);
        release.notify_one();

        assert_eq!(first.wait().await.unwrap(), 9);
        assert_eq!(second.wait().await.unwrap(), 9);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prime_seeds_cache_without_fetching() {
        let (loader, calls) = recording_loader(LoaderConfig::default());
        assert!(loader.prime(4, 100));
        assert!(!loader.prime(4, 200));
        assert_eq!(loader.load(4).await.unwrap(), 100);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_cache_refetches() {
        let (loader, calls) = recording_loader(LoaderConfig::default().with_cache(false));
        assert_eq!(loader.load(3).await.unwrap(), 6);
        assert_eq!(loader.load(3).await.unwrap(), 6);
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(loader.cached_len(), 0);
        assert!(!loader.prime(3, 1));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let fetch = |_ctx: FetchContext, keys: Vec<u32>| async move {
            let values: Vec<Result<u32, FetchError>> = keys.into_iter().map(Ok).collect();
            Ok::<_, FetchError>(values)
        };
        let result = Loader::with_config(fetch, LoaderConfig::default().with_max_batch_size(0));
        assert!(matches!(result, Err(ConfigError::InvalidBatchSize)));
    }

    #[test]
    fn transient_errors_are_not_cacheable() {
        assert!(LoadError::Fetch(FetchError::NotFound).is_cacheable());
        assert!(LoadError::Batch(FetchError::msg("down")).is_cacheable());
        assert!(
            LoadError::MissingResult {
                position: 0,
                returned: 0,
                expected: 1
            }
            .is_cacheable()
        );
        assert!(!LoadError::Cancelled.is_cacheable());
        assert!(!LoadError::FetchTimeout.is_cacheable());
        assert!(!LoadError::Timeout(Duration::from_millis(1)).is_cacheable());
        assert!(!LoadError::Dropped.is_cacheable());
    }
}
