#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use linked_hash_map::LinkedHashMap;

use crate::store::Store;

/// Provides a size constrained in-memory LRU store with per-entry TTLs.
///
/// A store behaves just like a **Map** as long as there is no shortage in storage. However, once
/// the max number of entries is exceeded, old (least recently used) entries will be evicted.
/// Both, a successful read and a write, count as a use and move the key to the most recently
/// used position.
///
/// Each entry can be given a TTL (time to live) when being stored. Expiration is enforced
/// lazily: a read which encounters an entry that has outlived its TTL removes it and reports a
/// miss. Additionally, [start_sweeper](MemoryStore::start_sweeper) can be used to periodically
/// drop expired entries which are no longer being read at all.
///
/// A `MemoryStore` is a cheap handle around shared state. Cloning it yields another handle to
/// the very same store, which permits to e.g. hand one handle to a cache front-end and keep
/// another one for monitoring.
///
/// # Examples
/// ```
/// # use europa::store::MemoryStore;
/// // Specifies a store which keeps up to two entries...
/// let store = MemoryStore::new(2);
/// store.set("a", 1, None);
/// store.set("b", 2, None);
///
/// // ...therefore storing a third entry evicts the least recently used one.
/// store.set("c", 3, None);
/// assert_eq!(store.get("a"), None);
/// assert_eq!(store.get("b"), Some(2));
/// assert_eq!(store.get("c"), Some(3));
/// ```
pub struct MemoryStore<V> {
    state: Arc<Mutex<State<V>>>,
}

struct State<V> {
    max_items: usize,
    map: LinkedHashMap<String, Entry<V>>,
    reads: u64,
    writes: u64,
    hits: u64,
}

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    /// Determines if this entry has outlived its TTL at the given point in time.
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }
}

impl<V> Clone for MemoryStore<V> {
    fn clone(&self) -> Self {
        MemoryStore {
            state: self.state.clone(),
        }
    }
}

impl<V> Default for MemoryStore<V> {
    /// Creates an unbounded store which never evicts.
    fn default() -> Self {
        MemoryStore::new(0)
    }
}

impl<V> MemoryStore<V> {
    /// Creates a new store which keeps up to **max_items** entries.
    ///
    /// A `max_items` of **0** creates an unbounded store which never evicts.
    pub fn new(max_items: usize) -> Self {
        MemoryStore {
            state: Arc::new(Mutex::new(State {
                max_items,
                map: LinkedHashMap::new(),
                reads: 0,
                writes: 0,
                hits: 0,
            })),
        }
    }

    /// Stores the given value for the given key.
    ///
    /// The key is placed at the most recently used position. If this pushes the store over its
    /// capacity, least recently used entries are evicted until the limit is honoured again.
    ///
    /// A `ttl` of **None** (or a zero duration) keeps the entry alive until it is either
    /// evicted or explicitly cleared. Storing a value for an existing key replaces both, the
    /// value and any previously assigned TTL.
    ///
    /// # Examples
    /// ```
    /// # use europa::store::MemoryStore;
    /// # use std::time::Duration;
    /// let store = MemoryStore::new(128);
    ///
    /// store.set("eternal", "value", None);
    /// store.set("short-lived", "value", Some(Duration::from_secs(60)));
    /// assert_eq!(store.len(), 2);
    /// ```
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;

        let expires_at = ttl
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| Instant::now() + ttl);

        // Re-insert instead of updating in place: a replaced key has to end up at the most
        // recently used position, which a plain map update would not guarantee.
        let _ = state.map.remove(key);
        let _ = state.map.insert(key.to_owned(), Entry { value, expires_at });

        while state.max_items > 0 && state.map.len() > state.max_items {
            let _ = state.map.pop_front();
        }
    }

    /// Removes the entry, if any, stored for the given key.
    ///
    /// Returns whether an entry was present (and has thus been removed).
    pub fn clear(&self, key: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;

        state.map.remove(key).is_some()
    }

    /// Removes all currently expired entries and returns how many were dropped.
    ///
    /// This applies the very same expiry check as a read does, just for all entries at once.
    /// Entries which are still within their TTL remain completely untouched, most notably their
    /// position in the recency order.
    pub fn prune(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        let expired: Vec<String> = state
            .map
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            let _ = state.map.remove(key);
        }

        expired.len()
    }

    /// Removes all entries in this store.
    ///
    /// Note that this will also zero all metrics (reads, writes, hits).
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        state.map.clear();
        state.reads = 0;
        state.writes = 0;
        state.hits = 0;
    }

    /// Returns the number of entries in the store.
    ///
    /// Note that this might include entries which have already outlived their TTL but haven't
    /// been touched (or swept) since. Those can of course never be obtained via
    /// [get](MemoryStore::get).
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().map.len()
    }

    /// Determines if the store is completely empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the maximal number of entries to keep (0 means unbounded).
    pub fn max_items(&self) -> usize {
        self.state.lock().unwrap().max_items
    }

    /// Returns the total number of reads performed on this store since the last flush.
    pub fn reads(&self) -> u64 {
        self.state.lock().unwrap().reads
    }

    /// Returns the total number of writes performed on this store since the last flush.
    pub fn writes(&self) -> u64 {
        self.state.lock().unwrap().writes
    }

    /// Returns the number of reads which actually hit a live entry since the last flush.
    pub fn hits(&self) -> u64 {
        self.state.lock().unwrap().hits
    }

    /// Returns the cache hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        let state = self.state.lock().unwrap();
        match state.reads {
            0 => 0.,
            reads => state.hits as f32 / reads as f32 * 100.,
        }
    }
}

impl<V: Clone> MemoryStore<V> {
    /// Returns the value which has previously been stored for the given key or **None** if no
    /// value is present.
    ///
    /// A successful read marks the key as most recently used. An entry which has outlived its
    /// TTL is removed and reported as a miss, so an expired value is never surfaced.
    ///
    /// # Examples
    /// ```
    /// # use europa::store::MemoryStore;
    /// let store = MemoryStore::new(128);
    ///
    /// store.set("foo", "bar", None);
    /// assert_eq!(store.get("foo"), Some("bar"));
    /// assert_eq!(store.get("unknown"), None);
    /// ```
    pub fn get(&self, key: &str) -> Option<V> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        state.reads += 1;

        let now = Instant::now();
        match state.map.get_refresh(key) {
            Some(entry) => {
                if !entry.is_expired(now) {
                    state.hits += 1;
                    return Some(entry.value.clone());
                }
            }
            None => return None,
        }

        // The entry has outlived its TTL: enforce expiry lazily on read.
        let _ = state.map.remove(key);
        None
    }
}

impl<V: Send + 'static> MemoryStore<V> {
    /// Spawns a background task which periodically [prunes](MemoryStore::prune) this store.
    ///
    /// All entries of a store share this single sweeper, no matter how often their TTLs are
    /// re-assigned. The task only keeps a weak handle on the store and terminates once the last
    /// strong handle has been dropped, so its lifecycle is bound to the store itself.
    ///
    /// Sweeping is purely an optimisation to bound the memory of entries which expire without
    /// ever being read again - expiry is enforced on read either way.
    ///
    /// Note that this must be called from within a tokio runtime and that `period` must be
    /// non-zero.
    pub fn start_sweeper(&self, period: Duration) {
        let state = Arc::downgrade(&self.state);

        crate::spawn!(async move {
            let mut timer = tokio::time::interval(period);
            loop {
                let _ = timer.tick().await;

                match state.upgrade() {
                    Some(state) => {
                        let swept = MemoryStore { state }.prune();
                        if swept > 0 {
                            log::debug!("Swept {} expired entries from the store...", swept);
                        }
                    }
                    None => return,
                }
            }
        });
    }
}

impl<V: Clone + Send + Sync + 'static> Store<V> for MemoryStore<V> {
    fn get(&self, key: &str) -> Option<V> {
        MemoryStore::get(self, key)
    }

    fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        MemoryStore::set(self, key, value, ttl)
    }

    fn clear(&self, key: &str) -> bool {
        MemoryStore::clear(self, key)
    }
}
