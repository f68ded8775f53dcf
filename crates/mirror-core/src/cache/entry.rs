//! Cache entry types.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::endpoint::{CacheKey, TagSet};
use crate::error::FetchError;

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Created, never fetched.
    Uninitialized,
    /// A fetch is in flight.
    Pending,
    Fulfilled,
    Rejected,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryStatus::Uninitialized => write!(f, "uninitialized"),
            EntryStatus::Pending => write!(f, "pending"),
            EntryStatus::Fulfilled => write!(f, "fulfilled"),
            EntryStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Stored result and status for one cache key.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub status: EntryStatus,
    pub data: Option<Value>,
    pub error: Option<FetchError>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub tags: TagSet,
    pub subscriber_count: usize,
    /// Marked invalid by a tag invalidation and waiting for a re-fetch.
    pub stale: bool,
}

impl CacheEntry {
    /// A fresh, never-fetched entry.
    pub fn new(key: CacheKey, tags: TagSet) -> Self {
        Self {
            key,
            status: EntryStatus::Uninitialized,
            data: None,
            error: None,
            fetched_at: None,
            tags,
            subscriber_count: 0,
            stale: false,
        }
    }

    /// Whether `ensure_fetch` has to go to the network for this entry.
    pub fn needs_fetch(&self) -> bool {
        match self.status {
            EntryStatus::Uninitialized | EntryStatus::Rejected => true,
            EntryStatus::Fulfilled => self.stale,
            EntryStatus::Pending => false,
        }
    }

    pub fn snapshot(&self) -> QuerySnapshot {
        QuerySnapshot {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            fetched_at: self.fetched_at,
            stale: self.stale,
        }
    }
}

/// Partial update of an entry.
///
/// Only fields set to `Some` are written; `subscriber_count` is never touched
/// by a patch, and `tags` only when explicitly included.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub status: Option<EntryStatus>,
    pub data: Option<Option<Value>>,
    pub error: Option<Option<FetchError>>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub tags: Option<TagSet>,
    pub stale: Option<bool>,
}

impl EntryPatch {
    /// Transition to pending, keeping data and error as they are.
    pub fn pending() -> Self {
        Self {
            status: Some(EntryStatus::Pending),
            ..Default::default()
        }
    }

    /// Successful fetch: new data and tags, error cleared, staleness cleared.
    pub fn fulfilled(data: Value, tags: TagSet) -> Self {
        Self {
            status: Some(EntryStatus::Fulfilled),
            data: Some(Some(data)),
            error: Some(None),
            fetched_at: Some(Utc::now()),
            tags: Some(tags),
            stale: Some(false),
        }
    }

    /// Failed fetch: error stored, previous data left alone.
    pub fn rejected(error: FetchError) -> Self {
        Self {
            status: Some(EntryStatus::Rejected),
            error: Some(Some(error)),
            fetched_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn stale() -> Self {
        Self {
            stale: Some(true),
            ..Default::default()
        }
    }

    pub(crate) fn apply(self, entry: &mut CacheEntry) {
        if let Some(status) = self.status {
            entry.status = status;
        }
        if let Some(data) = self.data {
            entry.data = data;
        }
        if let Some(error) = self.error {
            entry.error = error;
        }
        if let Some(fetched_at) = self.fetched_at {
            entry.fetched_at = Some(fetched_at);
        }
        if let Some(tags) = self.tags {
            entry.tags = tags;
        }
        if let Some(stale) = self.stale {
            entry.stale = stale;
        }
    }
}

/// What a consumer sees of an entry: `{status, data, error}` plus freshness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySnapshot {
    pub status: EntryStatus,
    pub data: Option<Value>,
    pub error: Option<FetchError>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub stale: bool,
}

impl QuerySnapshot {
    /// Snapshot of an entry that does not exist (yet, or any more).
    pub fn uninitialized() -> Self {
        Self {
            status: EntryStatus::Uninitialized,
            data: None,
            error: None,
            fetched_at: None,
            stale: false,
        }
    }

    /// Nothing to show yet.
    pub fn is_loading(&self) -> bool {
        self.data.is_none()
            && matches!(
                self.status,
                EntryStatus::Uninitialized | EntryStatus::Pending
            )
    }

    /// A refresh is running while older data is still displayed.
    pub fn is_refreshing(&self) -> bool {
        self.status == EntryStatus::Pending && self.data.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.status == EntryStatus::Rejected
    }

    /// Deserialize the payload into a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Option<serde_json::Result<T>> {
        self.data.clone().map(serde_json::from_value)
    }
}
