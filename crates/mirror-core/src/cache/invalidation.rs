//! Tag-based invalidation.
//!
//! A successful write declares which tags it affects. Every entry carrying one
//! of them is marked stale: observed entries are re-fetched right away so all
//! views of the resource update, unobserved ones wait for their next subscriber.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::entry::EntryPatch;
use super::{Cache, RequestFn};
use crate::endpoint::{CacheKey, TagSet};

/// What an invalidation touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    /// Entries marked stale, in key order.
    pub marked: Vec<CacheKey>,
    /// Observed entries for which a re-fetch was started.
    pub refetched: Vec<CacheKey>,
    /// Observed entries with a request already running; they re-fetch once it lands.
    pub deferred: Vec<CacheKey>,
}

impl InvalidationReport {
    pub fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }
}

impl Cache {
    /// Mark every entry whose tags intersect `tags` as stale.
    ///
    /// Matching is evaluated against the tags entries carry right now.
    pub fn invalidate(&self, tags: &TagSet) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        if tags.is_empty() {
            return report;
        }

        let (to_fetch, events) = {
            let mut state = self.lock();
            let mut matched: Vec<CacheKey> = state
                .store
                .iter()
                .filter(|entry| !entry.tags.is_disjoint(tags))
                .map(|entry| entry.key.clone())
                .collect();
            matched.sort();

            let mut to_fetch: Vec<(CacheKey, RequestFn)> = Vec::new();
            let mut events = Vec::with_capacity(matched.len());
            for key in &matched {
                state.store.patch(key, EntryPatch::stale());
                let observed = state
                    .store
                    .get(key)
                    .map(|entry| entry.subscriber_count > 0)
                    .unwrap_or(false);

                if let Some(in_flight) = state.in_flight.get_mut(key) {
                    in_flight.invalidated = true;
                    if observed {
                        report.deferred.push(key.clone());
                    }
                } else if observed {
                    if let Some(source) = state.sources.get(key) {
                        to_fetch.push((key.clone(), source.request.clone()));
                    }
                }
                events.extend(state.commit(key));
            }
            report.marked = matched;
            (to_fetch, events)
        };

        self.publish(events);

        for (key, request) in to_fetch {
            match self.ensure_fetch(&key, request) {
                Ok(_) => report.refetched.push(key),
                Err(e) => warn!("Could not re-fetch invalidated entry {}: {}", key, e),
            }
        }

        if report.is_empty() {
            debug!("Invalidation of {:?} matched no entries", tags);
        } else {
            info!(
                "Invalidated {} entries ({} re-fetched, {} deferred)",
                report.marked.len(),
                report.refetched.len(),
                report.deferred.len()
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntry, EntryStatus, FetchSource, Fetched};
    use crate::endpoint::tags;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn thread_key(thread: u64) -> CacheKey {
        CacheKey::new("messages", &json!({ "threadId": thread }))
    }

    fn thread_source(thread: u64, calls: Arc<AtomicUsize>) -> FetchSource {
        let request: RequestFn = Arc::new(move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                Ok(Fetched {
                    data: json!({ "fetch": n }),
                    tags: tags([format!("thread:{}", thread)]),
                })
            }
            .boxed()
        });
        FetchSource::new(request, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_only_matching_tags_are_marked() {
        let cache = Cache::new(Duration::from_secs(60));
        cache.put(thread_key(42), CacheEntry::new(thread_key(42), tags(["thread:42"])));
        cache.put(thread_key(7), CacheEntry::new(thread_key(7), tags(["thread:7"])));
        cache.patch(&thread_key(42), EntryPatch::fulfilled(json!([]), tags(["thread:42"])));
        cache.patch(&thread_key(7), EntryPatch::fulfilled(json!([]), tags(["thread:7"])));

        let report = cache.invalidate(&tags(["thread:42"]));

        assert_eq!(report.marked, vec![thread_key(42)]);
        assert!(report.refetched.is_empty());
        assert!(cache.get(&thread_key(42)).unwrap().stale);
        let untouched = cache.get(&thread_key(7)).unwrap();
        assert!(!untouched.stale);
        assert_eq!(untouched.status, EntryStatus::Fulfilled);
    }

    #[tokio::test]
    async fn test_empty_tag_set_is_noop() {
        let cache = Cache::new(Duration::from_secs(60));
        cache.put(thread_key(1), CacheEntry::new(thread_key(1), tags(["thread:1"])));
        assert!(cache.invalidate(&TagSet::new()).is_empty());
    }

    #[tokio::test]
    async fn test_observed_entries_refetch_unobserved_wait() {
        let cache = Cache::new(Duration::from_secs(60));
        let calls_1 = Arc::new(AtomicUsize::new(0));
        let calls_2 = Arc::new(AtomicUsize::new(0));

        let mut observed = cache
            .subscribe(thread_key(1), tags(["thread:1"]), thread_source(1, calls_1.clone()))
            .unwrap();
        observed.settled().await.unwrap();

        let mut idle = cache
            .subscribe(thread_key(2), tags(["thread:2"]), thread_source(2, calls_2.clone()))
            .unwrap();
        idle.settled().await.unwrap();
        drop(idle);

        let report = cache.invalidate(&tags(["thread:1", "thread:2"]));
        assert_eq!(report.marked, vec![thread_key(1), thread_key(2)]);
        assert_eq!(report.refetched, vec![thread_key(1)]);

        let snapshot = observed.settled().await.unwrap();
        assert_eq!(snapshot.data, Some(json!({"fetch": 2})));
        assert_eq!(calls_1.load(Ordering::SeqCst), 2);

        // The unobserved entry is only flagged.
        assert_eq!(calls_2.load(Ordering::SeqCst), 1);
        assert!(cache.get(&thread_key(2)).unwrap().stale);

        // ...and re-fetched lazily by its next subscriber.
        let mut back = cache
            .subscribe(thread_key(2), tags(["thread:2"]), thread_source(2, calls_2.clone()))
            .unwrap();
        let snapshot = back.settled().await.unwrap();
        assert_eq!(calls_2.load(Ordering::SeqCst), 2);
        assert!(!snapshot.stale);
    }

    #[tokio::test]
    async fn test_invalidation_during_flight_refetches_after_landing() {
        let cache = Cache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        let counter = calls.clone();
        let wait = gate.clone();
        let request: RequestFn = Arc::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let wait = wait.clone();
            async move {
                wait.notified().await;
                Ok(Fetched {
                    data: json!(n),
                    tags: tags(["thread:1"]),
                })
            }
            .boxed()
        });

        let mut sub = cache
            .subscribe(
                thread_key(1),
                tags(["thread:1"]),
                FetchSource::new(request, Duration::from_secs(60)),
            )
            .unwrap();

        let report = cache.invalidate(&tags(["thread:1"]));
        assert_eq!(report.deferred, vec![thread_key(1)]);
        assert!(report.refetched.is_empty());

        gate.notify_one();
        // First landing is stale, so a second request goes out.
        loop {
            let snapshot = sub.changed().await.unwrap();
            if snapshot.status == EntryStatus::Pending && snapshot.data.is_some() {
                break;
            }
        }
        gate.notify_one();
        let snapshot = sub.settled().await.unwrap();
        assert_eq!(snapshot.data, Some(json!(2)));
        assert!(!snapshot.stale);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidation_during_failed_flight_still_refetches() {
        let cache = Cache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        let counter = calls.clone();
        let wait = gate.clone();
        let request: RequestFn = Arc::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let wait = wait.clone();
            async move {
                if n == 1 {
                    wait.notified().await;
                    Err(crate::error::FetchError::network("connection reset"))
                } else {
                    Ok(Fetched {
                        data: json!(n),
                        tags: tags(["thread:1"]),
                    })
                }
            }
            .boxed()
        });

        let mut sub = cache
            .subscribe(
                thread_key(1),
                tags(["thread:1"]),
                FetchSource::new(request, Duration::from_secs(60)),
            )
            .unwrap();
        let report = cache.invalidate(&tags(["thread:1"]));
        assert_eq!(report.deferred, vec![thread_key(1)]);

        gate.notify_one();
        let snapshot = loop {
            let snapshot = sub.changed().await.unwrap();
            if snapshot.status == EntryStatus::Fulfilled {
                break snapshot;
            }
        };
        assert_eq!(snapshot.data, Some(json!(2)));
        assert!(!snapshot.stale);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.subscriber_count(&thread_key(1)), 1);
    }
}
