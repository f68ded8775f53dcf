//! Request de-duplication.
//!
//! [`Cache::ensure_fetch`] guarantees at most one in-flight request per cache
//! key. Later callers join the running request through a shared future and all
//! of them observe the same outcome. The request is driven by a spawned task,
//! so it completes (and its result is cached) even if every caller goes away.

use std::fmt;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use super::entry::{CacheEntry, EntryPatch, EntryStatus};
use super::{current_runtime, Cache, CacheInner, FetchResult, FetchSource, Fetched, RequestFn};
use crate::cancel::CancellationToken;
use crate::endpoint::{CacheKey, TagSet};
use crate::error::Result;

type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Bookkeeping for the one request currently running for a key.
pub(crate) struct InFlight {
    pub(crate) id: u64,
    pub(crate) future: SharedFetch,
    pub(crate) token: CancellationToken,
    /// An invalidation hit the key while this request was running.
    pub(crate) invalidated: bool,
}

/// How a call to `ensure_fetch` was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStart {
    /// The entry was fresh; no request was made.
    Cached,
    /// A new request was issued.
    Issued,
    /// An already running request was joined.
    Joined,
}

#[derive(Clone)]
enum HandleState {
    Ready(FetchResult),
    Running(SharedFetch),
}

/// Awaitable result of [`Cache::ensure_fetch`].
#[derive(Clone)]
pub struct FetchHandle {
    key: CacheKey,
    start: FetchStart,
    state: HandleState,
}

impl fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle")
            .field("key", &self.key)
            .field("start", &self.start)
            .finish()
    }
}

impl FetchHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn start(&self) -> FetchStart {
        self.start
    }

    /// Wait for the request to settle.
    pub async fn outcome(self) -> FetchResult {
        match self.state {
            HandleState::Ready(result) => result,
            HandleState::Running(future) => future.await,
        }
    }
}

impl Cache {
    /// Make sure the entry for `key` is fetched, issuing at most one request.
    ///
    /// - pending: joins the running request
    /// - uninitialized, rejected or stale: marks the entry pending and calls `request`
    /// - fulfilled and fresh: resolves immediately with the cached payload
    ///
    /// A missing entry is created on the fly. Failures are never retried here.
    pub fn ensure_fetch(&self, key: &CacheKey, request: RequestFn) -> Result<FetchHandle> {
        let runtime = current_runtime()?;

        let (handle, event) = {
            let mut state = self.lock();

            if let Some(in_flight) = state.in_flight.get(key) {
                debug!("Joining in-flight fetch for {}", key);
                return Ok(FetchHandle {
                    key: key.clone(),
                    start: FetchStart::Joined,
                    state: HandleState::Running(in_flight.future.clone()),
                });
            }

            if !state.store.contains(key) {
                state
                    .store
                    .put(key.clone(), CacheEntry::new(key.clone(), TagSet::new()));
            }
            if let Some(entry) = state.store.get(key) {
                if !entry.needs_fetch() {
                    return Ok(FetchHandle {
                        key: key.clone(),
                        start: FetchStart::Cached,
                        state: HandleState::Ready(Ok(Fetched {
                            data: entry.data.clone().unwrap_or(Value::Null),
                            tags: entry.tags.clone(),
                        })),
                    });
                }
            }

            let id = state.next_id();
            let token = CancellationToken::new();
            let future = run_fetch(self.downgrade(), key.clone(), id, token.clone(), request)
                .boxed()
                .shared();
            state.in_flight.insert(
                key.clone(),
                InFlight {
                    id,
                    future: future.clone(),
                    token,
                    invalidated: false,
                },
            );
            state.store.patch(key, EntryPatch::pending());
            debug!("Issuing fetch #{} for {}", id, key);

            let handle = FetchHandle {
                key: key.clone(),
                start: FetchStart::Issued,
                state: HandleState::Running(future),
            };
            (handle, state.commit(key))
        };

        self.publish(event);
        if let HandleState::Running(future) = &handle.state {
            runtime.spawn(future.clone());
        }
        Ok(handle)
    }

    /// Force a re-fetch of `key` using the request recorded at subscription time.
    ///
    /// Returns `Ok(None)` when nothing is known about `key`.
    pub fn refetch(&self, key: &CacheKey) -> Result<Option<FetchHandle>> {
        let request = {
            let mut state = self.lock();
            let Some(source) = state.sources.get(key) else {
                return Ok(None);
            };
            let request = source.request.clone();
            if !state.in_flight.contains_key(key) {
                state.store.patch(key, EntryPatch::stale());
            }
            request
        };
        self.ensure_fetch(key, request).map(Some)
    }

    /// Warm the entry for `key` without subscribing to it.
    ///
    /// The entry is retained like any unobserved entry: it is evicted once
    /// the grace period of `source` elapses after the fetch settles.
    pub fn prefetch(
        &self,
        key: CacheKey,
        initial_tags: TagSet,
        source: FetchSource,
    ) -> Result<FetchHandle> {
        current_runtime()?;
        let request = source.request.clone();
        {
            let mut state = self.lock();
            if !state.store.contains(&key) {
                state
                    .store
                    .put(key.clone(), CacheEntry::new(key.clone(), initial_tags));
            }
            state.sources.insert(key.clone(), source);
        }
        self.ensure_fetch(&key, request)
    }

    /// Write the outcome of fetch `id` into the entry, unless it was superseded
    /// or cancelled in the meantime.
    fn settle(&self, key: &CacheKey, id: u64, token: &CancellationToken, outcome: &FetchResult) {
        let mut refetch = None;
        let mut evict_after = None;

        let event = {
            let mut state = self.lock();
            let current = state
                .in_flight
                .get(key)
                .map(|in_flight| in_flight.id == id)
                .unwrap_or(false);
            if !current {
                debug!("Discarding result of superseded fetch #{} for {}", id, key);
                return;
            }
            let Some(in_flight) = state.in_flight.remove(key) else {
                return;
            };
            if token.check().is_err() {
                debug!("Discarding result of cancelled fetch #{} for {}", id, key);
                return;
            }

            let patch = match outcome {
                Ok(fetched) => EntryPatch::fulfilled(fetched.data.clone(), fetched.tags.clone()),
                Err(error) => {
                    warn!("Fetch #{} for {} failed: {}", id, key, error);
                    EntryPatch::rejected(error.clone())
                }
            };
            if !state.store.patch(key, patch) {
                return;
            }
            if in_flight.invalidated {
                state.store.patch(key, EntryPatch::stale());
            }

            let subscribers = state
                .store
                .get(key)
                .map(|entry| entry.subscriber_count)
                .unwrap_or(0);
            if subscribers == 0 {
                evict_after = Some(
                    state
                        .sources
                        .get(key)
                        .map(|source| source.grace)
                        .unwrap_or(self.default_grace()),
                );
            } else if in_flight.invalidated {
                // The landed outcome predates the invalidation, success or not.
                refetch = state.sources.get(key).map(|source| source.request.clone());
            }

            debug!(
                "Fetch #{} for {} settled as {}",
                id,
                key,
                state
                    .store
                    .get(key)
                    .map(|entry| entry.status)
                    .unwrap_or(EntryStatus::Uninitialized)
            );
            state.commit(key)
        };

        self.publish(event);

        if let Some(request) = refetch {
            if let Err(e) = self.ensure_fetch(key, request) {
                warn!("Follow-up fetch for {} could not start: {}", key, e);
            }
        }
        if let Some(grace) = evict_after {
            self.schedule_eviction(key, grace);
        }
    }
}

async fn run_fetch(
    cache: std::sync::Weak<CacheInner>,
    key: CacheKey,
    id: u64,
    token: CancellationToken,
    request: RequestFn,
) -> FetchResult {
    let mut outcome = request().await;
    if let Err(cancelled) = token.check() {
        // Joiners must not see a payload the cache refused to keep.
        outcome = Err(cancelled.into());
    }
    if let Some(cache) = Cache::upgrade(&cache) {
        cache.settle(&key, id, &token, &outcome);
    }
    outcome
}
