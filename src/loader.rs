//! Collapses concurrent loads for the same key into a single execution.
//!
//! Whenever many callers ask for the same missing (or just-expired) value at once, each of them
//! would normally hit the backing source on its own - the dreaded thundering herd. A
//! [DedupLoader](DedupLoader) prevents this: the first caller for a key starts the actual load,
//! all others attach to the in-flight execution and simply await its outcome.
//!
//! Internally we keep a map of in-flight executions per key, guarded by a mutex which is only
//! ever held for map reads and writes - never while a load is running or awaited. Each execution
//! owns a broadcast channel acting as a one-shot promise: every waiter holds a receiver, the
//! runner task publishes the outcome exactly once. The registration is removed from the map
//! *before* the outcome is published (both under the same lock), so a new caller either finds a
//! not-yet-resolved execution to attach to or no entry at all - in which case it starts a fresh
//! load. Outcomes are therefore never cached: once an execution has resolved, the next call for
//! its key triggers a new one.
//!
//! The load itself runs on a spawned task. This way a caller which is cancelled by its runtime
//! (i.e. its future is dropped) silently detaches, while the load continues to completion for
//! the benefit of the remaining waiters.
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::broadcast;

use crate::error::CacheError;

/// Collapses concurrent loads for the same key into a single execution whose outcome is
/// delivered to every waiter.
///
/// A `DedupLoader` is a cheap handle around shared state, so clones can be moved freely into
/// tasks which need to load through the same instance.
///
/// # Examples
/// ```
/// # use europa::loader::DedupLoader;
/// #[tokio::main]
/// async fn main() {
///     let loader = DedupLoader::new();
///
///     let value = loader
///         .load_or_await("answer", || async { Ok(42) })
///         .await
///         .unwrap();
///
///     assert_eq!(value, 42);
/// }
/// ```
pub struct DedupLoader<V> {
    in_flight: Arc<Mutex<HashMap<String, broadcast::Sender<Result<V, CacheError>>>>>,
}

impl<V> Clone for DedupLoader<V> {
    fn clone(&self) -> Self {
        DedupLoader {
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<V> Default for DedupLoader<V> {
    fn default() -> Self {
        DedupLoader::new()
    }
}

impl<V> DedupLoader<V> {
    /// Creates a new loader without any in-flight executions.
    pub fn new() -> Self {
        DedupLoader {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[cfg(test)]
    fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

impl<V: Clone + Send + 'static> DedupLoader<V> {
    /// If a load is already in progress for the given key, awaits it and returns its outcome.
    /// If not, invokes the given load function and returns its outcome - to this caller as well
    /// as to everyone else who attached in the meantime.
    ///
    /// A failing load delivers the very same failure to every current waiter; the failure is
    /// not retained in any way, so the next call for the key starts over with a fresh load.
    ///
    /// Note that the load function runs on a spawned task. Dropping the future returned by this
    /// method therefore detaches the caller without affecting the in-flight load or its other
    /// waiters.
    pub async fn load_or_await<F, Fut>(&self, key: &str, load: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, CacheError>> + Send + 'static,
    {
        let mut rx = {
            let mut in_flight = self.in_flight.lock().unwrap();

            if let Some(tx) = in_flight.get(key) {
                // Another caller is already loading this key - attach to its execution.
                tx.subscribe()
            } else {
                // This is the first caller for this key. Register the execution so that
                // concurrent calls can attach, then run the load on its own task.
                let (tx, rx) = broadcast::channel(1);
                let _ = in_flight.insert(key.to_owned(), tx);
                drop(in_flight);

                let loader = self.clone();
                let key = key.to_owned();
                crate::spawn!(async move {
                    let guarded = AssertUnwindSafe(async move { load().await });
                    let outcome = match guarded.catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(CacheError::LoadAborted),
                    };
                    loader.finish(&key, outcome);
                });

                rx
            }
        };

        match rx.recv().await {
            Ok(outcome) => outcome,
            Err(_) => Err(CacheError::LoadAborted),
        }
    }

    /// Deregisters the execution for the given key and publishes its outcome to all waiters.
    ///
    /// Removal and publication happen within one critical section: a caller holding the map
    /// lock either subscribes to a channel which hasn't delivered yet or finds the key absent
    /// and starts a fresh load - it can never attach to a dead channel.
    fn finish(&self, key: &str, outcome: Result<V, CacheError>) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(tx) = in_flight.remove(key) {
            let _ = tx.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::CacheError;
    use crate::loader::DedupLoader;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// Builds a load function which counts its invocations and blocks until the gate opens.
    fn gated_load(
        calls: &Arc<AtomicUsize>,
        gate: &Arc<Notify>,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, Result<&'static str, CacheError>>
           + Send
           + 'static {
        let calls = calls.clone();
        let gate = gate.clone();
        move || {
            Box::pin(async move {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                Ok("R")
            })
        }
    }

    #[test]
    fn concurrent_calls_share_a_single_load() {
        crate::testing::test_async(async {
            let loader = DedupLoader::new();
            let calls = Arc::new(AtomicUsize::new(0));
            let gate = Arc::new(Notify::new());

            // Three concurrent callers pile up on the same key while the load is blocked...
            let (a, b, c, _) = tokio::join!(
                loader.load_or_await("k", gated_load(&calls, &gate)),
                loader.load_or_await("k", gated_load(&calls, &gate)),
                loader.load_or_await("k", gated_load(&calls, &gate)),
                async {
                    while calls.load(Ordering::SeqCst) == 0 {
                        tokio::task::yield_now().await;
                    }
                    gate.notify_one();
                }
            );

            // ...all receive the outcome of the one load which actually ran.
            assert_eq!(a.unwrap(), "R");
            assert_eq!(b.unwrap(), "R");
            assert_eq!(c.unwrap(), "R");
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(loader.in_flight_count(), 0);

            // Outcomes are not retained: the next call triggers a fresh load.
            let value = loader
                .load_or_await("k", {
                    let calls = calls.clone();
                    move || async move {
                        let _ = calls.fetch_add(1, Ordering::SeqCst);
                        Ok("R2")
                    }
                })
                .await
                .unwrap();
            assert_eq!(value, "R2");
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn failures_fan_out_to_all_waiters() {
        crate::testing::test_async(async {
            let loader: DedupLoader<&'static str> = DedupLoader::new();
            let calls = Arc::new(AtomicUsize::new(0));
            let gate = Arc::new(Notify::new());

            let failing_load = |calls: &Arc<AtomicUsize>, gate: &Arc<Notify>| {
                let calls = calls.clone();
                let gate = gate.clone();
                move || async move {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Err(CacheError::load(anyhow::anyhow!("boom")))
                }
            };

            let (a, b, c, _) = tokio::join!(
                loader.load_or_await("k", failing_load(&calls, &gate)),
                loader.load_or_await("k", failing_load(&calls, &gate)),
                loader.load_or_await("k", failing_load(&calls, &gate)),
                async {
                    while calls.load(Ordering::SeqCst) == 0 {
                        tokio::task::yield_now().await;
                    }
                    gate.notify_one();
                }
            );

            // Every waiter observes the very same failure...
            for outcome in [a, b, c] {
                match outcome {
                    Err(CacheError::Load(cause)) => {
                        assert_eq!(format!("{}", cause), "boom");
                    }
                    other => panic!("Expected a load failure but got: {:?}", other),
                }
            }
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(loader.in_flight_count(), 0);

            // ...and the failure is not sticky: the next call loads again and may succeed.
            let value = loader
                .load_or_await("k", {
                    let calls = calls.clone();
                    move || async move {
                        let _ = calls.fetch_add(1, Ordering::SeqCst);
                        Ok("recovered")
                    }
                })
                .await
                .unwrap();
            assert_eq!(value, "recovered");
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn dropped_waiters_do_not_cancel_the_load() {
        crate::testing::test_async(async {
            let loader = DedupLoader::new();
            let calls = Arc::new(AtomicUsize::new(0));
            let gate = Arc::new(Notify::new());
            let late_calls = Arc::new(AtomicUsize::new(0));

            // The first caller registers the load and is cancelled right away...
            let mut first = Box::pin(loader.load_or_await("k", gated_load(&calls, &gate)));
            assert!(futures::poll!(first.as_mut()).is_pending());
            drop(first);

            // ...yet a later caller still attaches to the in-flight execution and receives
            // its outcome without triggering another load.
            let (second, _) = tokio::join!(
                loader.load_or_await("k", {
                    let late_calls = late_calls.clone();
                    move || async move {
                        let _ = late_calls.fetch_add(1, Ordering::SeqCst);
                        Ok("unexpected")
                    }
                }),
                async {
                    while calls.load(Ordering::SeqCst) == 0 {
                        tokio::task::yield_now().await;
                    }
                    gate.notify_one();
                }
            );

            assert_eq!(second.unwrap(), "R");
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn panicking_loads_release_their_waiters() {
        crate::testing::test_async(async {
            let loader: DedupLoader<&'static str> = DedupLoader::new();

            let outcome = loader
                .load_or_await("k", || async { panic!("load blew up") })
                .await;

            match outcome {
                Err(CacheError::LoadAborted) => (),
                other => panic!("Expected an aborted load but got: {:?}", other),
            }
            assert_eq!(loader.in_flight_count(), 0);
        });
    }
}
