//! Normalized, subscription-counted remote-data cache.
//!
//! The cache is split by concern, each adding methods to the shared [`Cache`]
//! handle:
//! - [`store`]: plain keyed storage of [`CacheEntry`] values
//! - [`dedup`]: `ensure_fetch`, at most one in-flight request per key
//! - [`subscription`]: subscriber counting and grace-period eviction
//! - [`invalidation`]: tag-based staleness and re-fetch of observed entries
//!
//! All state sits behind one mutex. Critical sections are short, synchronous
//! and never span an `.await`; observers are notified after the lock is
//! released.

pub mod dedup;
pub mod entry;
pub mod invalidation;
pub mod store;
pub mod subscription;

pub use dedup::{FetchHandle, FetchStart};
pub use entry::{CacheEntry, EntryPatch, EntryStatus, QuerySnapshot};
pub use invalidation::InvalidationReport;
pub use store::{CacheStats, CacheStore};
pub use subscription::{Subscription, SubscriptionHandle};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::endpoint::{CacheKey, TagSet};
use crate::error::{FetchError, MirrorError, Result};
use crate::observer::{ObserverId, ObserverSet};

use dedup::InFlight;
use subscription::EvictionTimer;

/// Payload of a successful fetch together with the tags it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub data: Value,
    pub tags: TagSet,
}

/// Outcome of one request, shared by every joiner of that request.
pub type FetchResult = std::result::Result<Fetched, FetchError>;

/// Issues one request for a key. Called at most once per in-flight fetch.
pub type RequestFn = Arc<dyn Fn() -> BoxFuture<'static, FetchResult> + Send + Sync>;

/// How the entry behind a key is (re)fetched and retained.
#[derive(Clone)]
pub struct FetchSource {
    pub request: RequestFn,
    /// Eviction grace period once the last subscriber leaves.
    pub grace: Duration,
    /// Fetches for this key are torn down when the session ends.
    pub requires_session: bool,
}

impl FetchSource {
    pub fn new(request: RequestFn, grace: Duration) -> Self {
        Self {
            request,
            grace,
            requires_session: false,
        }
    }

    pub fn session_required(mut self, required: bool) -> Self {
        self.requires_session = required;
        self
    }
}

impl fmt::Debug for FetchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchSource")
            .field("grace", &self.grace)
            .field("requires_session", &self.requires_session)
            .finish_non_exhaustive()
    }
}

/// Published to cache observers after every committed change.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEvent {
    pub key: CacheKey,
    /// `None` when the entry was removed.
    pub snapshot: Option<QuerySnapshot>,
}

/// Everything guarded by the cache lock.
pub(crate) struct CacheState {
    pub(crate) store: CacheStore,
    pub(crate) sources: HashMap<CacheKey, FetchSource>,
    pub(crate) in_flight: HashMap<CacheKey, InFlight>,
    pub(crate) evictions: HashMap<CacheKey, EvictionTimer>,
    channels: HashMap<CacheKey, watch::Sender<QuerySnapshot>>,
    next_id: u64,
}

impl CacheState {
    fn new() -> Self {
        Self {
            store: CacheStore::new(),
            sources: HashMap::new(),
            in_flight: HashMap::new(),
            evictions: HashMap::new(),
            channels: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Push the current snapshot of `key` to its watchers and build the event.
    pub(crate) fn commit(&mut self, key: &CacheKey) -> Option<CacheEvent> {
        let snapshot = self.store.get(key)?.snapshot();
        if let Some(sender) = self.channels.get(key) {
            sender.send_replace(snapshot.clone());
        }
        Some(CacheEvent {
            key: key.clone(),
            snapshot: Some(snapshot),
        })
    }

    /// Receiver for `key`, creating the channel on first use.
    pub(crate) fn watch(&mut self, key: &CacheKey) -> watch::Receiver<QuerySnapshot> {
        if let Some(sender) = self.channels.get(key) {
            return sender.subscribe();
        }
        let initial = self
            .store
            .get(key)
            .map(CacheEntry::snapshot)
            .unwrap_or_else(QuerySnapshot::uninitialized);
        let (sender, receiver) = watch::channel(initial);
        self.channels.insert(key.clone(), sender);
        receiver
    }

    /// Drop an entry and everything attached to it.
    ///
    /// Any in-flight fetch is cancelled so its result is not written back.
    pub(crate) fn purge(&mut self, key: &CacheKey) -> Option<CacheEvent> {
        let removed = self.store.remove(key)?;
        self.sources.remove(key);
        // Dropping the sender closes every subscriber's receiver.
        self.channels.remove(key);
        if let Some(timer) = self.evictions.remove(key) {
            timer.cancel();
        }
        if let Some(in_flight) = self.in_flight.remove(key) {
            in_flight.token.cancel();
        }
        debug!("Removed cache entry {} ({})", key, removed.status);
        Some(CacheEvent {
            key: key.clone(),
            snapshot: None,
        })
    }
}

pub(crate) struct CacheInner {
    state: Mutex<CacheState>,
    observers: ObserverSet<CacheEvent>,
    default_grace: Duration,
}

/// Shared handle to the process-wide cache. Cloning is cheap.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("default_grace", &self.inner.default_grace)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Cache {
    /// Create an empty cache with the given default eviction grace period.
    pub fn new(default_grace: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState::new()),
                observers: ObserverSet::new(),
                default_grace,
            }),
        }
    }

    pub fn default_grace(&self) -> Duration {
        self.inner.default_grace
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().expect("cache state lock poisoned")
    }

    pub(crate) fn downgrade(&self) -> Weak<CacheInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<CacheInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn publish(&self, events: impl IntoIterator<Item = CacheEvent>) {
        for event in events {
            self.inner.observers.notify(&event);
        }
    }

    /// Register a callback invoked after every committed entry change.
    pub fn observe<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.inner.observers.register(callback)
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        self.inner.observers.unregister(id)
    }

    // === Store operations ===

    /// Copy of the entry for `key`.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.lock().store.get(key).cloned()
    }

    /// Insert or replace an entry. The subscriber count of a replaced entry is kept.
    ///
    /// The status stays `pending` exactly while a fetch for `key` is in flight,
    /// whatever status `entry` carries.
    pub fn put(&self, key: CacheKey, mut entry: CacheEntry) {
        let event = {
            let mut state = self.lock();
            if let Some(existing) = state.store.get(&key) {
                entry.subscriber_count = existing.subscriber_count;
            } else {
                entry.subscriber_count = 0;
            }
            if state.in_flight.contains_key(&key) {
                entry.status = EntryStatus::Pending;
            } else if entry.status == EntryStatus::Pending {
                entry.status = EntryStatus::Uninitialized;
            }
            state.store.put(key.clone(), entry);
            state.commit(&key)
        };
        self.publish(event);
    }

    /// Partially update an entry. Returns `false` if there is none.
    pub fn patch(&self, key: &CacheKey, patch: EntryPatch) -> bool {
        let event = {
            let mut state = self.lock();
            if !state.store.patch(key, patch) {
                return false;
            }
            state.commit(key)
        };
        self.publish(event);
        true
    }

    /// Remove an entry regardless of its subscribers.
    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let (entry, event) = {
            let mut state = self.lock();
            let entry = state.store.get(key).cloned();
            (entry, state.purge(key))
        };
        self.publish(event);
        entry
    }

    pub fn snapshot(&self, key: &CacheKey) -> Option<QuerySnapshot> {
        self.lock().store.get(key).map(CacheEntry::snapshot)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().store.contains(key)
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().store.stats()
    }

    /// Fetch again the observed session-dependent entries a teardown reset.
    pub(crate) fn resume_session_entries(&self) -> Vec<CacheKey> {
        let mut pending: Vec<(CacheKey, RequestFn)> = {
            let state = self.lock();
            let pending = state
                .sources
                .iter()
                .filter(|(key, source)| {
                    source.requires_session
                        && !state.in_flight.contains_key(*key)
                        && state
                            .store
                            .get(key)
                            .map(|entry| {
                                entry.subscriber_count > 0
                                    && entry.status == EntryStatus::Uninitialized
                            })
                            .unwrap_or(false)
                })
                .map(|(key, source)| (key.clone(), source.request.clone()))
                .collect();
            pending
        };
        pending.sort_by(|a, b| a.0.cmp(&b.0));

        let mut resumed = Vec::with_capacity(pending.len());
        for (key, request) in pending {
            match self.ensure_fetch(&key, request) {
                Ok(_) => resumed.push(key),
                Err(e) => warn!("Could not resume {}: {}", key, e),
            }
        }
        resumed
    }

    /// Cancel in-flight fetches and drop data of every session-dependent entry.
    ///
    /// Entries nobody observes are removed; entries still observed are reset
    /// to `uninitialized` so no payload fetched under the old identity remains.
    /// They are fetched again by [`Cache::resume_session_entries`].
    pub(crate) fn clear_session_entries(&self) -> Vec<CacheKey> {
        let (cleared, events) = {
            let mut state = self.lock();
            let mut keys: Vec<CacheKey> = state
                .sources
                .iter()
                .filter(|(_, source)| source.requires_session)
                .map(|(key, _)| key.clone())
                .collect();
            keys.sort();

            let mut events = Vec::with_capacity(keys.len());
            for key in &keys {
                let observed = state
                    .store
                    .get(key)
                    .map(|entry| entry.subscriber_count > 0)
                    .unwrap_or(false);
                if observed {
                    if let Some(in_flight) = state.in_flight.remove(key) {
                        in_flight.token.cancel();
                    }
                    state.store.patch(
                        key,
                        EntryPatch {
                            status: Some(EntryStatus::Uninitialized),
                            data: Some(None),
                            error: Some(None),
                            stale: Some(false),
                            ..Default::default()
                        },
                    );
                    events.extend(state.commit(key));
                } else {
                    events.extend(state.purge(key));
                }
            }
            (keys, events)
        };
        self.publish(events);
        cleared
    }
}

/// Handle of the runtime fetches and eviction timers are spawned on.
pub(crate) fn current_runtime() -> Result<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current().map_err(|e| MirrorError::NoRuntime {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::tags;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn key(thread: u64) -> CacheKey {
        CacheKey::new("messages", &json!({ "threadId": thread }))
    }

    #[test]
    fn test_store_ops_publish_events() {
        let cache = Cache::new(Duration::from_secs(1));
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        cache.observe(move |event: &CacheEvent| sink.lock().unwrap().push(event.clone()));

        cache.put(key(1), CacheEntry::new(key(1), tags(["thread:1"])));
        assert!(cache.patch(&key(1), EntryPatch::fulfilled(json!([]), tags(["thread:1"]))));
        assert!(!cache.patch(&key(2), EntryPatch::pending()));
        assert!(cache.remove(&key(1)).is_some());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[1].snapshot.as_ref().unwrap().status,
            EntryStatus::Fulfilled
        );
        assert!(events[2].snapshot.is_none());
    }

    #[test]
    fn test_put_preserves_subscriber_count() {
        let cache = Cache::new(Duration::from_secs(1));
        let mut entry = CacheEntry::new(key(1), TagSet::new());
        entry.subscriber_count = 5;
        // A fresh put cannot invent subscribers.
        cache.put(key(1), entry.clone());
        assert_eq!(cache.get(&key(1)).unwrap().subscriber_count, 0);

        cache.lock().store.get_mut(&key(1)).unwrap().subscriber_count = 2;
        cache.put(key(1), entry);
        assert_eq!(cache.get(&key(1)).unwrap().subscriber_count, 2);
    }

    #[tokio::test]
    async fn test_put_keeps_pending_while_in_flight() {
        let cache = Cache::new(Duration::from_secs(1));
        let gate = Arc::new(tokio::sync::Notify::new());
        let wait = gate.clone();
        let request: RequestFn = Arc::new(move || {
            let wait = wait.clone();
            async move {
                wait.notified().await;
                Ok(Fetched {
                    data: json!(1),
                    tags: tags(["thread:1"]),
                })
            }
            .boxed()
        });
        let handle = cache.ensure_fetch(&key(1), request).unwrap();

        let mut replacement = CacheEntry::new(key(1), TagSet::new());
        replacement.status = EntryStatus::Fulfilled;
        cache.put(key(1), replacement);
        assert_eq!(cache.get(&key(1)).unwrap().status, EntryStatus::Pending);

        gate.notify_one();
        handle.outcome().await.unwrap();
        assert_eq!(cache.get(&key(1)).unwrap().status, EntryStatus::Fulfilled);

        // Without a fetch in flight a pending status cannot be stored.
        let mut orphan = CacheEntry::new(key(2), TagSet::new());
        orphan.status = EntryStatus::Pending;
        cache.put(key(2), orphan);
        assert_eq!(
            cache.get(&key(2)).unwrap().status,
            EntryStatus::Uninitialized
        );
    }

    #[test]
    fn test_unobserve() {
        let cache = Cache::new(Duration::from_secs(1));
        let id = cache.observe(|_| panic!("should not be called"));
        assert!(cache.unobserve(id));
        cache.put(key(1), CacheEntry::new(key(1), TagSet::new()));
    }

    #[test]
    fn test_current_runtime_outside_tokio() {
        assert!(matches!(
            current_runtime(),
            Err(MirrorError::NoRuntime { .. })
        ));
    }
}
