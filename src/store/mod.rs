//! Provides the storage boundary of the cache along with its in-memory implementation.
//!
//! A [Store](Store) is a plain key-value backend with per-entry TTLs. The read-through front-end
//! ([ReadThroughCache](crate::cache::ReadThroughCache)) is composed over this trait, so any
//! conforming backend (e.g. one talking to a remote Redis-like server) can be plugged in.
//!
//! The [memory](MemoryStore) module provides the built-in implementation: a size constrained
//! LRU map which enforces TTLs lazily on read and can optionally run a background sweeper to
//! bound the memory of entries which expired without ever being read again.
use std::time::Duration;

mod memory;

pub use memory::MemoryStore;

/// A key-value backend with per-entry TTLs.
///
/// Implementations are internally synchronized: all methods take **&self** and must be safe to
/// call from many tasks or threads at once. None of the methods may fail or block for a
/// noteworthy amount of time.
pub trait Store<V>: Send + Sync {
    /// Returns the value stored for the given key or **None** if no value is present.
    ///
    /// An entry which has outlived its TTL must never be returned - a backend is expected to
    /// treat such an entry exactly like a missing one.
    fn get(&self, key: &str) -> Option<V>;

    /// Stores the given value for the given key.
    ///
    /// A `ttl` of **None** (or a zero duration) indicates that the entry never expires.
    /// Storing a value for an existing key replaces the previous entry along with its TTL.
    fn set(&self, key: &str, value: V, ttl: Option<Duration>);

    /// Removes the value, if any, stored for the given key.
    ///
    /// Returns whether a value was present (and has thus been removed).
    fn clear(&self, key: &str) -> bool;
}
