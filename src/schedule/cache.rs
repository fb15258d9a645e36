use super::CalendarEvent;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// Events of one year together with the time they were fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub events: Vec<CalendarEvent>,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Returns `true` if the entry is younger than `ttl` at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        // A negative age means the clock went backwards since the fetch.
        (now - self.fetched_at).to_std().map_or(true, |age| age < ttl)
    }
}

/// Passive store of the last successful refresh per year. Nothing is ever evicted; callers decide
/// whether an entry is still fresh.
#[derive(Debug, Default)]
pub struct YearCache {
    entries: Mutex<HashMap<i32, CacheEntry>>,
}

impl YearCache {
    pub fn new() -> YearCache {
        YearCache::default()
    }

    /// Returns a copy of the entry for `year`, if any.
    pub async fn get(&self, year: i32) -> Option<CacheEntry> {
        self.entries.lock().await.get(&year).cloned()
    }

    /// Stores `events` for `year`, stamped with the current time, replacing any previous entry.
    pub async fn put(&self, year: i32, events: Vec<CalendarEvent>) -> CacheEntry {
        let entry = CacheEntry {
            events,
            fetched_at: Utc::now(),
        };

        self.entries.lock().await.insert(year, entry.clone());

        entry
    }

    /// Number of cached years.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
