//! Storage backends.
//!
//! Every backend implements [`CacheStore`] and is driven through
//! `Arc<dyn CacheStore>`, so the front-end and host code never name a
//! concrete store type. Backends traffic in encoded [`CacheEntry`] values;
//! serialization of host types happens one layer up.

mod file;
mod memcached;
mod memory;
mod null;

use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

pub use file::FileStore;
pub use memcached::{MemcachedConfig, MemcachedStore};
pub use memory::{DEFAULT_MEMORY_BUDGET_BYTES, MemoryStore};
pub use null::NullStore;

use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::stampede::LeaseToken;

/// The shape every store is handed around as.
pub type DynStore = Arc<dyn CacheStore>;

/// Payloads at or above this size are compressed by default.
pub const DEFAULT_COMPRESS_THRESHOLD_BYTES: usize = 16 * 1024;

/// Per-call write behavior. Defaults mirror an options-free write: no
/// expiry, no version tag, compression on at the default threshold.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Relative lifetime; resolved to an absolute instant at write time.
    pub expires_in: Option<Duration>,
    /// Absolute expiry. Wins over `expires_in` when both are set.
    pub expires_at: Option<OffsetDateTime>,
    /// Grace window after expiry during which stale values are served
    /// while one caller regenerates.
    pub race_condition_ttl: Option<Duration>,
    /// Write only if the key is currently absent.
    pub unless_exist: bool,
    pub compress: bool,
    pub compress_threshold: usize,
    /// Version tag stored in the entry and checked by versioned reads.
    pub version: Option<String>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            expires_in: None,
            expires_at: None,
            race_condition_ttl: None,
            unless_exist: false,
            compress: true,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD_BYTES,
            version: None,
        }
    }
}

impl WriteOptions {
    pub fn expiring_in(ttl: Duration) -> Self {
        Self {
            expires_in: Some(ttl),
            ..Self::default()
        }
    }

    pub fn with_race_ttl(mut self, race_ttl: Duration) -> Self {
        self.race_condition_ttl = Some(race_ttl);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// The grace window in effect, zero when unset.
    pub(crate) fn race_ttl(&self) -> Duration {
        self.race_condition_ttl.unwrap_or(Duration::ZERO)
    }
}

/// Contract all backends fulfill.
///
/// Reads return entries verbatim, expired or not; expiry and the grace
/// window are evaluated by the caller so the stale-serving path works the
/// same everywhere. Errors are returned honestly; degrading a failed read
/// to a miss is front-end policy, not store behavior.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Symbolic backend name used in logs, metrics labels, and errors.
    fn backend_name(&self) -> &'static str;

    async fn read_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Store `entry` under `key`. Returns `false` when `unless_exist` was
    /// requested and a live entry already held the key.
    async fn write_entry(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        options: &WriteOptions,
    ) -> Result<bool, CacheError>;

    /// Remove `key`. Returns whether an entry was present.
    async fn delete_entry(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Presence check that must not disturb recency ordering.
    async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Add `delta` to a raw counter entry, initializing the counter to
    /// `delta` (with `options` expiry) when the key is absent. Entries not
    /// written in raw mode fail with `TypeMismatch`.
    async fn increment(
        &self,
        key: &CacheKey,
        delta: u64,
        options: &WriteOptions,
    ) -> Result<u64, CacheError>;

    /// Counterpart of [`Self::increment`], clamping at zero.
    async fn decrement(
        &self,
        key: &CacheKey,
        delta: u64,
        options: &WriteOptions,
    ) -> Result<u64, CacheError>;

    /// Compare-and-set acquisition of the regeneration lease for `key`.
    async fn try_acquire_lease(
        &self,
        key: &CacheKey,
        ttl: Duration,
    ) -> Result<Option<LeaseToken>, CacheError>;

    /// Release a lease if `token` still owns it; late releases are no-ops.
    async fn release_lease(&self, key: &CacheKey, token: LeaseToken) -> Result<(), CacheError>;

    /// Delete every key matching a glob pattern (`*` and `?`). Returns the
    /// number deleted. Backends without key enumeration return
    /// `Unsupported`.
    async fn delete_matched(&self, pattern: &str) -> Result<usize, CacheError>;

    /// Prune expired entries, returning the number pruned. A pruned entry
    /// is gone for stale serving too, so this is a host-initiated
    /// maintenance pass, not something the read path triggers.
    /// `Unsupported` where expiry is delegated to the backend server.
    async fn cleanup(&self, now: OffsetDateTime) -> Result<usize, CacheError>;

    /// Drop everything, shared state included where the backend is shared.
    async fn clear(&self) -> Result<(), CacheError>;

    /// Batched read, ordered like `keys`. The default loops over
    /// [`Self::read_entry`]; backends with a native multi-get override it.
    async fn read_entries(
        &self,
        keys: &[CacheKey],
    ) -> Result<Vec<Option<CacheEntry>>, CacheError> {
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            entries.push(self.read_entry(key).await?);
        }
        Ok(entries)
    }
}

/// Glob matching for `delete_matched`: `*` spans any run, `?` one
/// character, everything else literal.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = backtrack {
            pi = star_pi + 1;
            ti = star_ti + 1;
            backtrack = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}
