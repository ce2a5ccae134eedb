//! Provides the read-through front-end which ties the store and the loader together.
//!
//! A [ReadThroughCache](ReadThroughCache) answers every lookup from its [Store](crate::store::Store)
//! if it can. On a miss, the requested value is loaded through a [DedupLoader](crate::loader::DedupLoader),
//! so that any number of concurrent misses for one key result in exactly one call to the backing
//! source. The loaded value is stored along with its TTL and the time the load took.
//!
//! # Eager refreshes
//!
//! Expiring many popular keys at the same instant trades one thundering herd for another: all
//! callers stall on the synchronous reload at once. To smooth this out, a cache hit may decide to
//! refresh the entry *before* it actually expires - asynchronously, while the caller still
//! receives the current value without any delay. The decision implements probabilistic early
//! expiration ("XFetch") with beta fixed to 1: the closer an entry is to its expiry and the more
//! expensive its last load was, the more likely a hit is to trigger the refresh. Cheap values
//! thus defer their refresh until right before the expiry while expensive ones start earlier.
//!
//! A failing eager refresh never affects the cached value. The failure is handed to the
//! configured error sink (by default it is logged) and the entry simply remains as it was until
//! it either refreshes successfully or expires.
#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::distributions::OpenClosed01;
use rand::{thread_rng, Rng};
use tokio::sync::Semaphore;

use crate::error::CacheError;
use crate::loader::DedupLoader;
use crate::store::Store;

/// The beta parameter of the probabilistic early expiration algorithm.
///
/// A value above 1.0 would favour earlier refreshes, a value below 1.0 later ones; 1.0 is
/// optimal for most use cases.
const DEFAULT_BETA: f64 = 1.0;

/// The default upper bound for concurrently running eager refreshes.
const DEFAULT_MAX_CONCURRENT_REFRESHES: usize = 64;

/// Wraps the result of a load function so that it can carry an expiry.
#[derive(Clone, Debug)]
pub struct LoadResult<V> {
    /// The loaded value to be cached and returned.
    pub value: V,

    /// The time to live for the value, where **None** (or a zero duration) means that the
    /// value never expires.
    pub ttl: Option<Duration>,
}

impl<V> LoadResult<V> {
    /// Creates a new result carrying the given value and TTL.
    pub fn new(value: V, ttl: Option<Duration>) -> Self {
        LoadResult { value, ttl }
    }

    /// Creates a new result for a value which never expires.
    pub fn eternal(value: V) -> Self {
        LoadResult::new(value, None)
    }

    /// Creates a new result for a value which expires after the given duration.
    pub fn with_ttl(value: V, ttl: Duration) -> Self {
        LoadResult::new(value, Some(ttl))
    }
}

/// Wraps a cached value along with the metadata the eager-refresh decision is based on.
///
/// This is the value type a [ReadThroughCache](ReadThroughCache) keeps in its underlying
/// [Store](crate::store::Store).
#[derive(Clone, Debug)]
pub struct CachedEntry<V> {
    /// The cached value itself.
    pub value: V,

    /// The point in time at which the entry expires, where **None** means never.
    pub expires_at: Option<Instant>,

    /// How long the load which produced this value took.
    pub load_duration: Duration,
}

type RandomSource = Box<dyn Fn() -> f64 + Send + Sync>;
type ErrorSink = Box<dyn Fn(&str, &CacheError) + Send + Sync>;

/// A read-through cache which loads missing values on demand, collapses concurrent loads per
/// key and refreshes entries eagerly to counter cache stampedes.
///
/// The cache itself owns no storage - it composes over any [Store](crate::store::Store)
/// implementation, most commonly a [MemoryStore](crate::store::MemoryStore). Cloning yields a
/// cheap handle onto the same cache.
///
/// # Examples
/// ```
/// # use europa::cache::{LoadResult, ReadThroughCache};
/// # use europa::store::MemoryStore;
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// #[tokio::main]
/// async fn main() {
///     let cache = ReadThroughCache::new(Arc::new(MemoryStore::new(16_384)));
///
///     let value = cache
///         .get("tenant/42", || async {
///             // An expensive lookup against the backing source goes here...
///             anyhow::Ok(LoadResult::with_ttl("payload".to_owned(), Duration::from_secs(60)))
///         })
///         .await
///         .unwrap();
///
///     assert_eq!(value, "payload");
/// }
/// ```
pub struct ReadThroughCache<V> {
    inner: Arc<Inner<V>>,
}

struct Inner<V> {
    store: Arc<dyn Store<CachedEntry<V>>>,
    loader: DedupLoader<V>,
    refresh_permits: Arc<Semaphore>,
    random: RandomSource,
    error_sink: ErrorSink,
}

impl<V> Clone for ReadThroughCache<V> {
    fn clone(&self) -> Self {
        ReadThroughCache {
            inner: self.inner.clone(),
        }
    }
}

/// Configures and creates a [ReadThroughCache](ReadThroughCache).
///
/// All settings come with sensible defaults, so in most cases
/// [ReadThroughCache::new](ReadThroughCache::new) is all that is needed.
pub struct Builder<V> {
    store: Arc<dyn Store<CachedEntry<V>>>,
    max_concurrent_refreshes: usize,
    random: RandomSource,
    error_sink: ErrorSink,
}

impl<V: Clone + Send + Sync + 'static> Builder<V> {
    fn new(store: Arc<dyn Store<CachedEntry<V>>>) -> Self {
        Builder {
            store,
            max_concurrent_refreshes: DEFAULT_MAX_CONCURRENT_REFRESHES,
            random: Box::new(|| {
                let uniform: f64 = thread_rng().sample(OpenClosed01);
                uniform
            }),
            error_sink: Box::new(|key, error| {
                log::error!("An eager refresh of the cache key '{}' failed: {}", key, error);
            }),
        }
    }

    /// Specifies how many eager refreshes may run at the same time.
    ///
    /// When all permits are in use, further eager refreshes are skipped (the affected entries
    /// still refresh synchronously once they expire). A limit of **0** disables eager
    /// refreshes entirely.
    pub fn max_concurrent_refreshes(mut self, limit: usize) -> Self {
        self.max_concurrent_refreshes = limit;
        self
    }

    /// Specifies the source of uniform random numbers in **(0, 1]** used by the eager-refresh
    /// decision.
    ///
    /// This is mainly intended for tests which need the probabilistic refresh behaviour to be
    /// deterministic.
    pub fn random_source(mut self, random: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.random = Box::new(random);
        self
    }

    /// Specifies the sink which receives the failures of eager refreshes.
    ///
    /// By default these failures are logged. They are never propagated to any caller, as the
    /// affected caller has long been served the still-cached value.
    pub fn error_sink(mut self, sink: impl Fn(&str, &CacheError) + Send + Sync + 'static) -> Self {
        self.error_sink = Box::new(sink);
        self
    }

    /// Creates the cache with the settings of this builder.
    pub fn build(self) -> ReadThroughCache<V> {
        ReadThroughCache {
            inner: Arc::new(Inner {
                store: self.store,
                loader: DedupLoader::new(),
                refresh_permits: Arc::new(Semaphore::new(self.max_concurrent_refreshes)),
                random: self.random,
                error_sink: self.error_sink,
            }),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> ReadThroughCache<V> {
    /// Creates a new cache on top of the given store using default settings.
    pub fn new(store: Arc<dyn Store<CachedEntry<V>>>) -> Self {
        ReadThroughCache::builder(store).build()
    }

    /// Creates a [Builder](Builder) to configure a cache on top of the given store.
    pub fn builder(store: Arc<dyn Store<CachedEntry<V>>>) -> Builder<V> {
        Builder::new(store)
    }

    /// Queries the cache for the value under the given key. If it is found (and not expired),
    /// it is returned right away. If not, the given load function is invoked and its result is
    /// cached and returned.
    ///
    /// Only one load is ever in flight per key: concurrent misses attach to the running load
    /// and receive its outcome, see [DedupLoader](crate::loader::DedupLoader).
    ///
    /// A hit close to the entry's expiry may additionally trigger an asynchronous refresh using
    /// the given load function (see the module docs) - the caller is not delayed by this in any
    /// way.
    pub async fn get<F, Fut>(&self, key: &str, load: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<LoadResult<V>>> + Send + 'static,
    {
        // If the value is cached and not expired yet, deliver it directly...
        if let Some(entry) = self.inner.store.get(key) {
            if self.should_refresh_eagerly(&entry) {
                self.spawn_refresh(key, load);
            }
            return Ok(entry.value);
        }

        // ...otherwise load it from the backing source and cache the result.
        self.refresh(key, load).await
    }

    /// Invokes the given load function, caches its result and returns it.
    ///
    /// Just like for [get](ReadThroughCache::get), concurrent refreshes for one key collapse
    /// into a single load execution. A failing load is reported to all of its waiters and
    /// leaves any currently cached value untouched.
    pub async fn refresh<F, Fut>(&self, key: &str, load: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<LoadResult<V>>> + Send + 'static,
    {
        let store = self.inner.store.clone();
        let stored_key = key.to_owned();

        self.inner
            .loader
            .load_or_await(key, move || async move {
                // Load the value, timing how long it takes - the eager-refresh decision
                // scales with this cost.
                let started = Instant::now();
                let result = load().await.map_err(CacheError::load)?;
                let load_duration = started.elapsed();

                let ttl = result.ttl.filter(|ttl| !ttl.is_zero());
                let entry = CachedEntry {
                    value: result.value.clone(),
                    expires_at: ttl.map(|ttl| started + ttl),
                    load_duration,
                };
                store.set(&stored_key, entry, ttl);

                Ok(result.value)
            })
            .await
    }

    /// Drops the cached entry, if any, for the given key.
    ///
    /// Returns whether an entry was present. The next [get](ReadThroughCache::get) for the key
    /// will load it again.
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.store.clear(key)
    }

    /// Fires the refresh for the given key without delaying the current caller.
    ///
    /// The refresh permit is released once the spawned refresh has completed. If no permit is
    /// available, the refresh is skipped - entries still refresh synchronously on expiry, so
    /// this only sheds optional work.
    fn spawn_refresh<F, Fut>(&self, key: &str, load: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<LoadResult<V>>> + Send + 'static,
    {
        let permit = match self.inner.refresh_permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                log::debug!("No permit available - skipping the eager refresh of '{}'...", key);
                return;
            }
        };

        let cache = self.clone();
        let key = key.to_owned();
        crate::spawn!(async move {
            let _permit = permit;
            if let Err(error) = cache.refresh(&key, load).await {
                (cache.inner.error_sink)(&key, &error);
            }
        });
    }

    /// Determines whether a hit on the given entry should refresh it eagerly - before it
    /// actually expires, using probabilistic random jitter - to help prevent cache stampedes.
    ///
    /// This implements probabilistic early expiration with `DEFAULT_BETA`: the entry is treated
    /// as already expired iff `now + load_duration * beta * -ln(u) >= expires_at`, evaluated
    /// against the remaining lifetime so the jitter term cannot overflow for tiny `u`.
    fn should_refresh_eagerly(&self, entry: &CachedEntry<V>) -> bool {
        let expires_at = match entry.expires_at {
            Some(expires_at) => expires_at,
            None => return false,
        };

        let now = Instant::now();
        if now >= expires_at {
            return true;
        }

        let uniform = (self.inner.random)();
        let jitter = entry.load_duration.as_millis() as f64 * DEFAULT_BETA * -uniform.ln();

        jitter >= expires_at.duration_since(now).as_millis() as f64
    }
}
