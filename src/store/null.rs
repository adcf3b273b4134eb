//! Store that remembers nothing. Every read misses, every write succeeds
//! and is dropped, so `fetch` invokes its producer every time. Useful for
//! development and for tests that want cache-shaped plumbing with no
//! caching.

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::stampede::LeaseToken;

use super::{CacheStore, WriteOptions};

#[derive(Debug, Default)]
pub struct NullStore;

impl NullStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CacheStore for NullStore {
    fn backend_name(&self) -> &'static str {
        "null"
    }

    async fn read_entry(&self, _key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(None)
    }

    async fn write_entry(
        &self,
        _key: &CacheKey,
        _entry: CacheEntry,
        _options: &WriteOptions,
    ) -> Result<bool, CacheError> {
        Ok(true)
    }

    async fn delete_entry(&self, _key: &CacheKey) -> Result<bool, CacheError> {
        Ok(false)
    }

    async fn exists(&self, _key: &CacheKey) -> Result<bool, CacheError> {
        Ok(false)
    }

    async fn increment(
        &self,
        _key: &CacheKey,
        delta: u64,
        _options: &WriteOptions,
    ) -> Result<u64, CacheError> {
        // Counters behave as if freshly initialized on every call.
        Ok(delta)
    }

    async fn decrement(
        &self,
        _key: &CacheKey,
        _delta: u64,
        _options: &WriteOptions,
    ) -> Result<u64, CacheError> {
        Ok(0)
    }

    async fn try_acquire_lease(
        &self,
        _key: &CacheKey,
        _ttl: Duration,
    ) -> Result<Option<LeaseToken>, CacheError> {
        // With nothing stored there is nothing to coordinate; granting
        // every request keeps fetch producing on every call.
        Ok(Some(LeaseToken::mint()))
    }

    async fn release_lease(&self, _key: &CacheKey, _token: LeaseToken) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete_matched(&self, _pattern: &str) -> Result<usize, CacheError> {
        Ok(0)
    }

    async fn cleanup(&self, _now: OffsetDateTime) -> Result<usize, CacheError> {
        Ok(0)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
