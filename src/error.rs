//! Defines the failure kinds surfaced by the cache.
//!
//! We only distinguish two cases: a [Load](CacheError::Load) error signals that the
//! caller-supplied load function itself reported a failure. As a single load execution may serve
//! many concurrent callers, the underlying cause is shared via an **Arc** so that the very same
//! failure can be delivered to every waiter. A [LoadAborted](CacheError::LoadAborted) error
//! signals that a load execution died without ever producing a result (most probably because it
//! panicked).
//!
//! Note that load failures are never cached or sticky in any way: the next call for the same key
//! will trigger a fresh load attempt.
use std::fmt;
use std::sync::Arc;

/// Represents an error when loading a value into the cache.
#[derive(Debug, Clone)]
pub enum CacheError {
    /// The caller-supplied load function reported a failure.
    ///
    /// The cause is delivered verbatim to every caller which was waiting on the same load
    /// execution.
    Load(Arc<anyhow::Error>),

    /// A load execution died without producing a result (e.g. it panicked).
    LoadAborted,
}

impl CacheError {
    /// Wraps the given cause into a [CacheError::Load] so that it can be shared by all waiters
    /// of a load execution.
    pub fn load(cause: anyhow::Error) -> Self {
        CacheError::Load(Arc::new(cause))
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Load(cause) => write!(f, "Load failed: {}", cause),
            CacheError::LoadAborted => write!(f, "Load aborted before producing a result"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Load(cause) => {
                let cause: &(dyn std::error::Error + 'static) = (**cause).as_ref();
                Some(cause)
            }
            CacheError::LoadAborted => None,
        }
    }
}
