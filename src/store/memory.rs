//! Bounded in-memory store.
//!
//! Entries live in an LRU map under a byte budget: recency is bumped on
//! every read and write, and inserts evict from the cold end until the
//! budget holds. Expiry is lazy; an expired entry occupies budget until it
//! is overwritten, evicted, or swept by `cleanup`.

use std::sync::RwLock;

use async_trait::async_trait;
use lru::LruCache;
use time::{Duration, OffsetDateTime};

use crate::entry::{CacheEntry, resolve_expiry};
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::lock::{rw_read, rw_write};
use crate::metrics::{EVICT_TOTAL, MEMORY_USED_BYTES};
use crate::stampede::{LeaseToken, StampedeGuard};

use super::{CacheStore, WriteOptions, glob_match};

const SOURCE: &str = "store::memory";

/// Default byte budget for a process-local cache.
pub const DEFAULT_MEMORY_BUDGET_BYTES: usize = 32 * 1024 * 1024;

struct Shelf {
    entries: LruCache<CacheKey, CacheEntry>,
    bytes_used: usize,
}

impl Shelf {
    fn charge(&mut self, key: CacheKey, entry: CacheEntry) {
        let size = entry.byte_size();
        if let Some(old) = self.entries.put(key, entry) {
            self.bytes_used = self.bytes_used.saturating_sub(old.byte_size());
        }
        self.bytes_used += size;
    }

    fn discharge(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let removed = self.entries.pop(key);
        if let Some(entry) = &removed {
            self.bytes_used = self.bytes_used.saturating_sub(entry.byte_size());
        }
        removed
    }

    fn evict_to(&mut self, budget: usize) {
        while self.bytes_used > budget {
            let Some((key, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.bytes_used = self.bytes_used.saturating_sub(entry.byte_size());
            metrics::counter!(EVICT_TOTAL, "backend" => "memory").increment(1);
            tracing::debug!(key = %key, bytes = entry.byte_size(), "evicted for byte budget");
        }
    }

    fn publish_gauge(&self) {
        metrics::gauge!(MEMORY_USED_BYTES).set(self.bytes_used as f64);
    }
}

/// Process-local store with LRU eviction under a byte budget.
pub struct MemoryStore {
    shelf: RwLock<Shelf>,
    budget: Option<usize>,
    guard: StampedeGuard,
}

impl MemoryStore {
    /// Store bounded by [`DEFAULT_MEMORY_BUDGET_BYTES`].
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_MEMORY_BUDGET_BYTES)
    }

    pub fn with_budget(budget: usize) -> Self {
        Self {
            shelf: RwLock::new(Shelf {
                entries: LruCache::unbounded(),
                bytes_used: 0,
            }),
            budget: Some(budget),
            guard: StampedeGuard::new(),
        }
    }

    /// No byte budget; used for short-lived scoped caches whose lifetime
    /// bounds their footprint.
    pub fn unbounded() -> Self {
        Self {
            shelf: RwLock::new(Shelf {
                entries: LruCache::unbounded(),
                bytes_used: 0,
            }),
            budget: None,
            guard: StampedeGuard::new(),
        }
    }

    /// Bytes currently charged against the budget.
    pub fn bytes_used(&self) -> usize {
        rw_read(&self.shelf, SOURCE, "bytes_used").bytes_used
    }

    pub fn len(&self) -> usize {
        rw_read(&self.shelf, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared increment/decrement path. The whole read-modify-write runs
    /// under the write lock, so concurrent counters never lose updates.
    fn bump_counter(
        &self,
        key: &CacheKey,
        options: &WriteOptions,
        apply: impl FnOnce(u64) -> u64,
    ) -> Result<u64, CacheError> {
        let now = OffsetDateTime::now_utc();
        let mut shelf = rw_write(&self.shelf, SOURCE, "bump_counter");

        let existing = match shelf.entries.get(key) {
            None => None,
            Some(entry) if entry.is_expired(now) => None,
            Some(entry) => Some((parse_counter(key, entry)?, entry.expires_at())),
        };

        let (value, expires_at) = match existing {
            // Absent counters initialize from zero with the caller's expiry.
            None => (
                apply(0),
                resolve_expiry(options.expires_in, options.expires_at, now),
            ),
            Some((current, expires_at)) => (apply(current), expires_at),
        };

        shelf.charge(
            key.clone(),
            CacheEntry::raw(value.to_string().into(), expires_at),
        );
        if let Some(budget) = self.budget {
            shelf.evict_to(budget);
        }
        shelf.publish_gauge();
        Ok(value)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn read_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(rw_write(&self.shelf, SOURCE, "read_entry")
            .entries
            .get(key)
            .cloned())
    }

    async fn write_entry(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        options: &WriteOptions,
    ) -> Result<bool, CacheError> {
        if let Some(budget) = self.budget
            && entry.byte_size() > budget
        {
            return Err(CacheError::entry_too_large(key.as_str(), budget));
        }

        let now = OffsetDateTime::now_utc();
        let mut shelf = rw_write(&self.shelf, SOURCE, "write_entry");
        if options.unless_exist
            && let Some(existing) = shelf.entries.peek(key)
            && !existing.is_expired(now)
        {
            return Ok(false);
        }
        shelf.charge(key.clone(), entry);
        if let Some(budget) = self.budget {
            shelf.evict_to(budget);
        }
        shelf.publish_gauge();
        Ok(true)
    }

    async fn delete_entry(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let mut shelf = rw_write(&self.shelf, SOURCE, "delete_entry");
        let removed = shelf.discharge(key).is_some();
        shelf.publish_gauge();
        Ok(removed)
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let now = OffsetDateTime::now_utc();
        Ok(
            match rw_read(&self.shelf, SOURCE, "exists").entries.peek(key) {
                Some(entry) => !entry.is_expired(now),
                None => false,
            },
        )
    }

    async fn increment(
        &self,
        key: &CacheKey,
        delta: u64,
        options: &WriteOptions,
    ) -> Result<u64, CacheError> {
        self.bump_counter(key, options, |current| current.saturating_add(delta))
    }

    async fn decrement(
        &self,
        key: &CacheKey,
        delta: u64,
        options: &WriteOptions,
    ) -> Result<u64, CacheError> {
        self.bump_counter(key, options, |current| current.saturating_sub(delta))
    }

    async fn try_acquire_lease(
        &self,
        key: &CacheKey,
        ttl: Duration,
    ) -> Result<Option<LeaseToken>, CacheError> {
        Ok(self
            .guard
            .try_acquire(key, ttl, OffsetDateTime::now_utc()))
    }

    async fn release_lease(&self, key: &CacheKey, token: LeaseToken) -> Result<(), CacheError> {
        self.guard.release(key, token);
        Ok(())
    }

    async fn delete_matched(&self, pattern: &str) -> Result<usize, CacheError> {
        let mut shelf = rw_write(&self.shelf, SOURCE, "delete_matched");
        let doomed: Vec<CacheKey> = shelf
            .entries
            .iter()
            .filter(|(key, _)| glob_match(pattern, key.as_str()))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            shelf.discharge(key);
        }
        shelf.publish_gauge();
        Ok(doomed.len())
    }

    async fn cleanup(&self, now: OffsetDateTime) -> Result<usize, CacheError> {
        let mut shelf = rw_write(&self.shelf, SOURCE, "cleanup");
        let doomed: Vec<CacheKey> = shelf
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            shelf.discharge(key);
        }
        shelf.publish_gauge();
        Ok(doomed.len())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut shelf = rw_write(&self.shelf, SOURCE, "clear");
        shelf.entries.clear();
        shelf.bytes_used = 0;
        shelf.publish_gauge();
        self.guard.clear();
        Ok(())
    }
}

fn parse_counter(key: &CacheKey, entry: &CacheEntry) -> Result<u64, CacheError> {
    if !entry.is_raw() {
        return Err(CacheError::type_mismatch(key.as_str()));
    }
    std::str::from_utf8(entry.payload())
        .ok()
        .and_then(|text| text.trim().parse::<u64>().ok())
        .ok_or_else(|| CacheError::type_mismatch(key.as_str()))
}
