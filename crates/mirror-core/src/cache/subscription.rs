//! Subscriber counting and grace-period eviction.
//!
//! A [`Subscription`] is one consumer's claim on a cache entry. While at least
//! one is held the entry stays put; when the last one is released a timer
//! starts, and if nobody subscribes again before it fires the entry is removed.
//! Re-subscribing inside the window cancels the timer, so an element that
//! unmounts and remounts during a re-layout keeps its data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::entry::{CacheEntry, EntryStatus, QuerySnapshot};
use super::{current_runtime, Cache, CacheInner, FetchSource};
use crate::endpoint::{CacheKey, TagSet};
use crate::error::Result;

/// Pending eviction of one key.
pub(crate) struct EvictionTimer {
    generation: u64,
    task: JoinHandle<()>,
}

impl EvictionTimer {
    pub(crate) fn cancel(self) {
        self.task.abort();
    }
}

struct HandleInner {
    id: u64,
    key: CacheKey,
    cache: Weak<CacheInner>,
    released: AtomicBool,
}

/// Cloneable reference to a subscription, used to release it from elsewhere.
///
/// Releasing is idempotent: whichever of [`SubscriptionHandle::release`],
/// [`Subscription::unsubscribe`] or dropping the [`Subscription`] happens first
/// decrements the count, later calls do nothing.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("released", &self.is_released())
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.inner.key
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Release the claim. Returns `true` if this call did the release.
    pub fn release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(cache) = Cache::upgrade(&self.inner.cache) {
            cache.release_key(&self.inner.key);
        }
        true
    }
}

/// A consumer's live view of one cache entry.
pub struct Subscription {
    handle: SubscriptionHandle,
    receiver: watch::Receiver<QuerySnapshot>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .field("snapshot", &*self.receiver.borrow())
            .finish()
    }
}

impl Subscription {
    pub fn key(&self) -> &CacheKey {
        self.handle.key()
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// Current `{status, data, error}` of the entry.
    pub fn snapshot(&self) -> QuerySnapshot {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change. `None` once the entry has been removed.
    pub async fn changed(&mut self) -> Option<QuerySnapshot> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Wait until the entry is neither uninitialized nor pending.
    pub async fn settled(&mut self) -> Option<QuerySnapshot> {
        let snapshot = self
            .receiver
            .wait_for(|s| matches!(s.status, EntryStatus::Fulfilled | EntryStatus::Rejected))
            .await
            .ok()?;
        Some((*snapshot).clone())
    }

    /// Additional receiver for code that wants to watch the entry independently.
    pub fn receiver(&self) -> watch::Receiver<QuerySnapshot> {
        self.receiver.clone()
    }

    /// Release this subscription now rather than on drop.
    pub fn unsubscribe(self) {
        self.handle.release();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.release();
    }
}

impl Cache {
    /// Register a subscriber for `key`.
    ///
    /// Creates the entry (with `initial_tags`) if absent, cancels a pending
    /// eviction, and starts a fetch when the entry is uninitialized or stale.
    /// A rejected entry is not retried automatically.
    pub fn subscribe(
        &self,
        key: CacheKey,
        initial_tags: TagSet,
        source: FetchSource,
    ) -> Result<Subscription> {
        current_runtime()?;

        let (handle, receiver, fetch, event) = {
            let mut state = self.lock();
            let mut created = false;
            if !state.store.contains(&key) {
                state
                    .store
                    .put(key.clone(), CacheEntry::new(key.clone(), initial_tags));
                created = true;
            }
            if let Some(timer) = state.evictions.remove(&key) {
                debug!("Subscriber returned to {}, eviction cancelled", key);
                timer.cancel();
            }
            let request = source.request.clone();
            state.sources.insert(key.clone(), source);

            let mut fetch = None;
            if let Some(entry) = state.store.get_mut(&key) {
                entry.subscriber_count += 1;
                if entry.status == EntryStatus::Uninitialized || entry.stale {
                    fetch = Some(request);
                }
                debug!("Subscribed to {} ({} subscribers)", key, entry.subscriber_count);
            }

            let id = state.next_id();
            let receiver = state.watch(&key);
            let handle = SubscriptionHandle {
                inner: Arc::new(HandleInner {
                    id,
                    key: key.clone(),
                    cache: self.downgrade(),
                    released: AtomicBool::new(false),
                }),
            };
            let event = if created { state.commit(&key) } else { None };
            (handle, receiver, fetch, event)
        };

        self.publish(event);
        let subscription = Subscription { handle, receiver };
        if let Some(request) = fetch {
            // Dropping `subscription` on error releases the count again.
            self.ensure_fetch(&key, request)?;
        }
        Ok(subscription)
    }

    /// Release `handle`. Equivalent to [`SubscriptionHandle::release`].
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        handle.release()
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.lock()
            .store
            .get(key)
            .map(|entry| entry.subscriber_count)
            .unwrap_or(0)
    }

    pub(crate) fn release_key(&self, key: &CacheKey) {
        let grace = {
            let mut state = self.lock();
            let Some(entry) = state.store.get_mut(key) else {
                return;
            };
            if entry.subscriber_count == 0 {
                warn!("Release of {} with no subscribers ignored", key);
                return;
            }
            entry.subscriber_count -= 1;
            debug!("Unsubscribed from {} ({} subscribers)", key, entry.subscriber_count);
            if entry.subscriber_count > 0 || entry.status == EntryStatus::Pending {
                // Pending entries are re-armed when their fetch settles.
                return;
            }
            state
                .sources
                .get(key)
                .map(|source| source.grace)
                .unwrap_or(self.default_grace())
        };
        self.schedule_eviction(key, grace);
    }

    /// Remove `key` after `grace` unless it gains a subscriber in between.
    pub(crate) fn schedule_eviction(&self, key: &CacheKey, grace: Duration) {
        let runtime = match current_runtime() {
            Ok(runtime) if !grace.is_zero() => runtime,
            _ => {
                self.evict_if_idle(key, None);
                return;
            }
        };

        let mut state = self.lock();
        let generation = state.next_id();
        let weak = self.downgrade();
        let task_key = key.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(cache) = Cache::upgrade(&weak) {
                cache.evict_if_idle(&task_key, Some(generation));
            }
        });
        let timer = EvictionTimer { generation, task };
        if let Some(previous) = state.evictions.insert(key.clone(), timer) {
            previous.cancel();
        }
        debug!("Eviction of {} scheduled in {:?}", key, grace);
    }

    fn evict_if_idle(&self, key: &CacheKey, generation: Option<u64>) {
        let event = {
            let mut state = self.lock();
            if let Some(generation) = generation {
                match state.evictions.get(key) {
                    Some(timer) if timer.generation == generation => {
                        state.evictions.remove(key);
                    }
                    _ => return,
                }
            }
            let idle = state
                .store
                .get(key)
                .map(|entry| entry.subscriber_count == 0 && entry.status != EntryStatus::Pending)
                .unwrap_or(false);
            if !idle {
                return;
            }
            debug!("Evicting idle entry {}", key);
            state.purge(key)
        };
        self.publish(event);
    }
}
