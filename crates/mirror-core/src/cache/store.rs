//! Keyed in-memory storage of cache entries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::entry::{CacheEntry, EntryPatch, EntryStatus};
use crate::config::CacheDefaults;
use crate::endpoint::CacheKey;

/// Entry counts across the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub uninitialized: usize,
    pub pending: usize,
    pub fulfilled: usize,
    pub rejected: usize,
    pub stale: usize,
    /// Sum of subscriber counts over all entries.
    pub subscribers: usize,
}

/// Plain keyed storage: at most one entry per key.
///
/// Every operation is a synchronous in-memory mutation. Callers serialize
/// access (the [`Cache`](super::Cache) keeps the store behind its state lock).
#[derive(Debug)]
pub struct CacheStore {
    entries: HashMap<CacheKey, CacheEntry>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            entries: HashMap::with_capacity(CacheDefaults::INITIAL_CAPACITY),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Insert or replace the entry for `key`. Returns the previous entry.
    pub fn put(&mut self, key: CacheKey, mut entry: CacheEntry) -> Option<CacheEntry> {
        entry.key = key.clone();
        self.entries.insert(key, entry)
    }

    /// Apply a partial update. Returns `false` when there is no entry for `key`.
    pub fn patch(&mut self, key: &CacheKey, patch: EntryPatch) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                patch.apply(entry);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    pub(crate) fn get_mut(&mut self, key: &CacheKey) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.keys()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            total_entries: self.entries.len(),
            ..Default::default()
        };
        for entry in self.entries.values() {
            match entry.status {
                EntryStatus::Uninitialized => stats.uninitialized += 1,
                EntryStatus::Pending => stats.pending += 1,
                EntryStatus::Fulfilled => stats.fulfilled += 1,
                EntryStatus::Rejected => stats.rejected += 1,
            }
            if entry.stale {
                stats.stale += 1;
            }
            stats.subscribers += entry.subscriber_count;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{tags, TagSet};
    use serde_json::json;

    fn key(thread: u64) -> CacheKey {
        CacheKey::new("messages", &json!({ "threadId": thread }))
    }

    #[test]
    fn test_put_get_remove() {
        let mut store = CacheStore::new();
        assert!(store.get(&key(1)).is_none());

        store.put(key(1), CacheEntry::new(key(1), TagSet::new()));
        assert!(store.contains(&key(1)));
        assert_eq!(store.len(), 1);

        let removed = store.remove(&key(1)).unwrap();
        assert_eq!(removed.key, key(1));
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_replaces_single_entry_per_key() {
        let mut store = CacheStore::new();
        store.put(key(1), CacheEntry::new(key(1), tags(["a"])));
        let previous = store.put(key(1), CacheEntry::new(key(1), tags(["b"])));

        assert_eq!(previous.unwrap().tags, tags(["a"]));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&key(1)).unwrap().tags, tags(["b"]));
    }

    #[test]
    fn test_put_normalizes_entry_key() {
        let mut store = CacheStore::new();
        store.put(key(2), CacheEntry::new(key(1), TagSet::new()));
        assert_eq!(store.get(&key(2)).unwrap().key, key(2));
    }

    #[test]
    fn test_patch_missing_key_is_noop() {
        let mut store = CacheStore::new();
        assert!(!store.patch(&key(9), EntryPatch::pending()));
        assert!(store.is_empty());
    }

    #[test]
    fn test_patch_keeps_tags_unless_included() {
        let mut store = CacheStore::new();
        let mut entry = CacheEntry::new(key(1), tags(["thread:1"]));
        entry.subscriber_count = 2;
        store.put(key(1), entry);

        assert!(store.patch(&key(1), EntryPatch::pending()));
        let entry = store.get(&key(1)).unwrap();
        assert_eq!(entry.tags, tags(["thread:1"]));
        assert_eq!(entry.subscriber_count, 2);
    }

    #[test]
    fn test_stats() {
        let mut store = CacheStore::new();
        let mut a = CacheEntry::new(key(1), TagSet::new());
        a.subscriber_count = 2;
        store.put(key(1), a);
        store.put(key(2), CacheEntry::new(key(2), TagSet::new()));
        store.patch(&key(2), EntryPatch::fulfilled(json!([]), TagSet::new()));
        store.patch(&key(2), EntryPatch::stale());

        let stats = store.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.uninitialized, 1);
        assert_eq!(stats.fulfilled, 1);
        assert_eq!(stats.stale, 1);
        assert_eq!(stats.subscribers, 2);
    }
}
