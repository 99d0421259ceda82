//! In-flight deduplication for consolidations
//!
//! At most one execution runs per [`ConsolidationKey`]. Concurrent callers
//! for the same key wait on the running execution and share its result.
//! Successful results are remembered for `dedupe_window`, so a repeat inside
//! the window returns the earlier outcome without running again. Failures
//! are never cached; a waiter whose peer failed takes a fresh reservation.
//!
//! The cache holds at most `cache_capacity` outcomes. Replay within the
//! window is only guaranteed while fewer distinct keys complete per window;
//! beyond that the least recently used outcome is evicted before it expires.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::watch;

use crate::error::Result;
use crate::memory::types::{ConsolidationKey, ConsolidationOutcome};

#[derive(Debug, Clone)]
enum Slot<T> {
    Pending,
    Done(T),
    Failed,
}

#[derive(Debug)]
struct GuardState<T> {
    inflight: HashMap<ConsolidationKey, watch::Sender<Slot<T>>>,
    recent: LruCache<ConsolidationKey, (Instant, T)>,
}

type SharedState<T> = Arc<Mutex<GuardState<T>>>;

fn lock<T>(state: &SharedState<T>) -> MutexGuard<'_, GuardState<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of [`ConsolidationInFlightGuard::reserve`]
#[derive(Debug)]
pub enum Reservation<T> {
    /// A result completed within the dedupe window
    Cached(T),
    /// Result of a peer execution that was in flight
    Joined(T),
    /// The caller owns the execution and must commit or fail it
    Owner(ReservationHandle<T>),
}

/// Deduplicates concurrent consolidations by key
#[derive(Debug)]
pub struct ConsolidationInFlightGuard<T = ConsolidationOutcome> {
    dedupe_window: Duration,
    state: SharedState<T>,
}

impl<T> ConsolidationInFlightGuard<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(dedupe_window: Duration, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            dedupe_window,
            state: Arc::new(Mutex::new(GuardState {
                inflight: HashMap::new(),
                recent: LruCache::new(capacity),
            })),
        }
    }

    pub fn dedupe_window(&self) -> Duration {
        self.dedupe_window
    }

    /// Obtain a cached result, a peer's result, or an execution reservation
    pub async fn reserve(&self, key: ConsolidationKey) -> Reservation<T> {
        loop {
            let mut rx = {
                let mut state = lock(&self.state);

                let cached = match state.recent.get(&key) {
                    Some((at, value)) if at.elapsed() <= self.dedupe_window => Some(value.clone()),
                    _ => None,
                };
                if let Some(value) = cached {
                    tracing::debug!(key = %key, "Consolidation served from dedupe cache");
                    return Reservation::Cached(value);
                }
                state.recent.pop(&key);

                match state.inflight.get(&key) {
                    Some(tx) => tx.subscribe(),
                    None => {
                        let (tx, _) = watch::channel(Slot::Pending);
                        state.inflight.insert(key.clone(), tx);
                        return Reservation::Owner(ReservationHandle {
                            key,
                            state: Arc::clone(&self.state),
                            finished: false,
                        });
                    }
                }
            };

            tracing::debug!(key = %key, "Waiting on in-flight consolidation");
            let slot = match rx.wait_for(|slot| !matches!(slot, Slot::Pending)).await {
                Ok(slot) => slot.clone(),
                Err(_) => Slot::Failed,
            };
            match slot {
                Slot::Done(value) => return Reservation::Joined(value),
                _ => tracing::debug!(key = %key, "In-flight peer failed, retrying reservation"),
            }
        }
    }

    /// Run `operation` at most once per key among concurrent callers
    pub async fn run<F, Fut>(&self, key: ConsolidationKey, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.reserve(key).await {
            Reservation::Cached(value) | Reservation::Joined(value) => Ok(value),
            Reservation::Owner(handle) => match operation().await {
                Ok(value) => {
                    handle.commit(value.clone());
                    Ok(value)
                }
                Err(err) => {
                    handle.fail();
                    Err(err)
                }
            },
        }
    }

    /// Number of keys currently executing
    pub fn in_flight(&self) -> usize {
        lock(&self.state).inflight.len()
    }

    /// Number of remembered results, expired ones included until touched
    pub fn cached(&self) -> usize {
        lock(&self.state).recent.len()
    }
}

/// Exclusive right to execute one key.
///
/// Dropping the handle without committing counts as a failure.
#[derive(Debug)]
pub struct ReservationHandle<T> {
    key: ConsolidationKey,
    state: SharedState<T>,
    finished: bool,
}

impl<T: Clone> ReservationHandle<T> {
    pub fn key(&self) -> &ConsolidationKey {
        &self.key
    }

    /// Publish a successful result to waiters and cache it
    pub fn commit(mut self, value: T) {
        self.finish(Slot::Done(value));
    }

    /// Release waiters without caching anything
    pub fn fail(mut self) {
        self.finish(Slot::Failed);
    }

    fn finish(&mut self, slot: Slot<T>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let mut state = lock(&self.state);
        if let Slot::Done(value) = &slot {
            let evicted = state
                .recent
                .push(self.key.clone(), (Instant::now(), value.clone()));
            if let Some((key, (at, _))) = evicted {
                if key != self.key {
                    tracing::debug!(
                        key = %key,
                        age_ms = at.elapsed().as_millis() as u64,
                        "Dedupe cache full, evicted outcome"
                    );
                }
            }
        }
        if let Some(tx) = state.inflight.remove(&self.key) {
            tx.send_replace(slot);
        }
    }
}

impl<T> Drop for ReservationHandle<T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let mut state = lock(&self.state);
        if let Some(tx) = state.inflight.remove(&self.key) {
            tx.send_replace(Slot::Failed);
        }
    }
}
