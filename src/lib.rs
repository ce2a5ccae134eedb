//! Europa is a small in-process read-through caching library.
//!
//! # Introduction
//! Loading the same value from a database, a remote service or an expensive computation over
//! and over again wastes resources at best - and takes the backing source down at worst, once
//! many callers ask for the same missing or just-expired value at the same time. **Europa**
//! memoizes such values in a bounded in-memory store and shields the backing source from these
//! thundering herds in two complementary ways: concurrent loads for one key are collapsed into
//! a single execution, and popular entries are refreshed *before* they expire so that their
//! expiry never stalls anyone.
//!
//! Note that this is deliberately a best-effort cache: a value may be served while a refresh
//! for it is still running, nothing is persisted anywhere and no coordination between processes
//! takes place.
//!
//! # Features
//! * **Bounded LRU store with per-entry TTLs** - the [store](crate::store) module provides a
//!   size constrained in-memory store which evicts the least recently used entries once it runs
//!   out of room and enforces TTLs lazily on read (with an optional background sweeper to bound
//!   the memory of entries which expire unread).
//! * **Single-flight loading** - the [loader](crate::loader) module collapses any number of
//!   concurrent loads for one key into a single execution whose outcome (value or failure) is
//!   broadcast to every waiter.
//! * **Probabilistic eager refreshes** - the [cache](crate::cache) module combines both into a
//!   read-through front-end which refreshes entries close to their expiry asynchronously,
//!   using the probabilistic early expiration algorithm ("XFetch") to spread refreshes out.
//! * **100% Async/Await** - loads are asynchronous and run on [tokio](https://tokio.rs/)
//!   tasks, so a caller which is cancelled while waiting never cancels the load for its peers.
//!
//! # Examples
//! ```
//! use europa::{LoadResult, MemoryStore, ReadThroughCache};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let cache = ReadThroughCache::new(Arc::new(MemoryStore::new(16_384)));
//!
//!     let value = cache
//!         .get("tenant/42", || async {
//!             // An expensive lookup against the backing source goes here...
//!             anyhow::Ok(LoadResult::with_ttl("payload".to_owned(), Duration::from_secs(60)))
//!         })
//!         .await
//!         .unwrap();
//!
//!     assert_eq!(value, "payload");
//! }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod cache;
pub mod error;
pub mod loader;
pub mod store;

pub use cache::{CachedEntry, LoadResult, ReadThroughCache};
pub use error::CacheError;
pub use loader::DedupLoader;
pub use store::{MemoryStore, Store};

/// Initializes the logging system.
///
/// This sets up **simplelog** to log to stdout. Invoking this is entirely optional - a host
/// application which already owns a logger setup can simply skip it.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned join handle to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[tokio::main]
/// # async fn main() {
/// europa::spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }
}
