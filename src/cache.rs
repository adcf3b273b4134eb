//! Typed cache front-end.
//!
//! `Cache` wraps a [`DynStore`] and owns everything the backends do not:
//! serde of host types, compression, namespace expansion, version tags, the
//! read degradation policy, and the fetch state machine with its grace
//! window. Handles are cheap to clone and share one store.
//!
//! The fetch path distinguishes four situations:
//!
//! 1. fresh entry: decode and return it;
//! 2. entry expired inside the grace window: serve the stale value and, if
//!    the regeneration lease is free, regenerate in the background;
//! 3. entry expired past the window, version-mismatched, or absent: the
//!    caller that wins the key's lease runs the producer inline; concurrent
//!    losers wait for its write and return the same value;
//! 4. backend read error: logged, counted, treated as a miss.
//!
//! Producer failures never poison a key: on the inline path the error
//! propagates, nothing is written, and the released lease lets a waiting
//! caller produce instead; on the background path the stale entry stays
//! and the lease lapses.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;

use crate::codec::{compress_payload, decompress_payload};
use crate::entry::{CacheEntry, EntryState, resolve_expiry};
use crate::error::{CacheError, ProducerError};
use crate::key::CacheKey;
use crate::metrics::{
    HIT_TOTAL, MISS_TOTAL, PRODUCER_MS, READ_ERROR_TOTAL, REGENERATE_TOTAL, STALE_SERVED_TOTAL,
    describe_metrics,
};
use crate::stampede::{LeaseToken, StampedeGuard};
use crate::store::{DynStore, WriteOptions};

/// Sleep between checks while another caller's producer fills a key.
const LEASE_WAIT_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);

/// Typed handle over a cache store.
#[derive(Clone)]
pub struct Cache {
    store: DynStore,
    namespace: Option<String>,
    defaults: WriteOptions,
}

impl Cache {
    pub fn new(store: DynStore) -> Self {
        Self::with_defaults(store, WriteOptions::default())
    }

    /// Handle whose option-free calls use `defaults` instead of
    /// [`WriteOptions::default`].
    pub fn with_defaults(store: DynStore, defaults: WriteOptions) -> Self {
        describe_metrics();
        Self {
            store,
            namespace: None,
            defaults,
        }
    }

    /// A handle over the same store whose keys live under `namespace`.
    /// Namespaces partition keys; they do not copy data.
    pub fn namespaced(&self, namespace: impl Into<String>) -> Self {
        Self {
            store: Arc::clone(&self.store),
            namespace: Some(namespace.into()),
            defaults: self.defaults.clone(),
        }
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    pub fn defaults(&self) -> &WriteOptions {
        &self.defaults
    }

    fn full_key(&self, key: &CacheKey) -> CacheKey {
        match &self.namespace {
            Some(namespace) => CacheKey::new(format!("{namespace}:{}", key.as_str())),
            None => key.clone(),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read and decode `key`. Expired entries and backend read errors are
    /// misses; decode failures of a present entry are logged and treated as
    /// misses too.
    pub async fn read<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CacheError> {
        self.read_versioned(key, None).await
    }

    /// Like [`Self::read`], but the entry must also carry `version` to
    /// count as a hit. Entries written under an older tag read as misses
    /// and are left in place for any reader still expecting them.
    pub async fn read_versioned<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
        version: Option<&str>,
    ) -> Result<Option<T>, CacheError> {
        let backend = self.store.backend_name();
        let full = self.full_key(key);
        let Some(entry) = self.read_entry_degrading(&full).await? else {
            metrics::counter!(MISS_TOTAL, "backend" => backend).increment(1);
            return Ok(None);
        };
        if entry.is_expired(OffsetDateTime::now_utc()) || !entry.matches_version(version) {
            metrics::counter!(MISS_TOTAL, "backend" => backend).increment(1);
            return Ok(None);
        }
        match self.decode_read(&full, &entry)? {
            Some(value) => {
                metrics::counter!(HIT_TOTAL, "backend" => backend).increment(1);
                Ok(Some(value))
            }
            None => {
                metrics::counter!(MISS_TOTAL, "backend" => backend).increment(1);
                Ok(None)
            }
        }
    }

    /// Batched read. The result maps the caller's keys (not the expanded
    /// ones) to decoded values; absent, expired, and undecodable entries
    /// are simply left out.
    pub async fn read_multi<T: DeserializeOwned>(
        &self,
        keys: &[CacheKey],
    ) -> Result<HashMap<CacheKey, T>, CacheError> {
        let backend = self.store.backend_name();
        let full_keys: Vec<CacheKey> = keys.iter().map(|key| self.full_key(key)).collect();
        let entries = self.read_entries_degrading(&full_keys).await?;
        let now = OffsetDateTime::now_utc();

        let mut found = HashMap::with_capacity(keys.len());
        for ((key, full), entry) in keys.iter().zip(&full_keys).zip(entries) {
            let value = match entry {
                Some(entry) if !entry.is_expired(now) => self.decode_read(full, &entry)?,
                _ => None,
            };
            match value {
                Some(value) => {
                    metrics::counter!(HIT_TOTAL, "backend" => backend).increment(1);
                    found.insert(key.clone(), value);
                }
                None => {
                    metrics::counter!(MISS_TOTAL, "backend" => backend).increment(1);
                }
            }
        }
        Ok(found)
    }

    /// Presence check; backend errors degrade to `false`.
    pub async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let full = self.full_key(key);
        match self.store.exists(&full).await {
            Ok(present) => Ok(present),
            Err(err) if err.degrades_to_miss() => {
                self.note_read_error(&full, &err);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Serialize and store `value` with this handle's default options.
    pub async fn write<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<bool, CacheError> {
        self.write_with(key, value, &self.defaults).await
    }

    pub async fn write_with<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        options: &WriteOptions,
    ) -> Result<bool, CacheError> {
        let entry = build_entry(value, options, OffsetDateTime::now_utc())?;
        self.store
            .write_entry(&self.full_key(key), entry, options)
            .await
    }

    /// Store every pair; the first backend failure aborts and surfaces.
    pub async fn write_multi<T: Serialize>(
        &self,
        pairs: &[(CacheKey, T)],
    ) -> Result<(), CacheError> {
        self.write_multi_with(pairs, &self.defaults).await
    }

    pub async fn write_multi_with<T: Serialize>(
        &self,
        pairs: &[(CacheKey, T)],
        options: &WriteOptions,
    ) -> Result<(), CacheError> {
        for (key, value) in pairs {
            self.write_with(key, value, options).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.store.delete_entry(&self.full_key(key)).await
    }

    /// Delete keys matching a glob pattern. The pattern is expanded into
    /// this handle's namespace like any key.
    pub async fn delete_matched(&self, pattern: &str) -> Result<usize, CacheError> {
        let pattern = match &self.namespace {
            Some(namespace) => format!("{namespace}:{pattern}"),
            None => pattern.to_owned(),
        };
        self.store.delete_matched(&pattern).await
    }

    /// Prune expired entries backend-side.
    pub async fn cleanup(&self) -> Result<usize, CacheError> {
        self.store.cleanup(OffsetDateTime::now_utc()).await
    }

    /// Drop everything in the underlying store, all namespaces included.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.store.clear().await
    }

    // ========================================================================
    // Counters
    // ========================================================================

    pub async fn increment(&self, key: &CacheKey, delta: u64) -> Result<u64, CacheError> {
        self.store
            .increment(&self.full_key(key), delta, &self.defaults)
            .await
    }

    pub async fn increment_with(
        &self,
        key: &CacheKey,
        delta: u64,
        options: &WriteOptions,
    ) -> Result<u64, CacheError> {
        self.store
            .increment(&self.full_key(key), delta, options)
            .await
    }

    pub async fn decrement(&self, key: &CacheKey, delta: u64) -> Result<u64, CacheError> {
        self.store
            .decrement(&self.full_key(key), delta, &self.defaults)
            .await
    }

    pub async fn decrement_with(
        &self,
        key: &CacheKey,
        delta: u64,
        options: &WriteOptions,
    ) -> Result<u64, CacheError> {
        self.store
            .decrement(&self.full_key(key), delta, options)
            .await
    }

    /// Seed a raw counter entry that the backend-native increment path can
    /// operate on. Plain `write` would store a serialized number instead
    /// and later increments would fail with `TypeMismatch`.
    pub async fn write_counter(&self, key: &CacheKey, value: u64) -> Result<(), CacheError> {
        let now = OffsetDateTime::now_utc();
        let expires_at = resolve_expiry(self.defaults.expires_in, self.defaults.expires_at, now);
        let entry = CacheEntry::raw(value.to_string().into(), expires_at);
        self.store
            .write_entry(&self.full_key(key), entry, &self.defaults)
            .await?;
        Ok(())
    }

    pub async fn read_counter(&self, key: &CacheKey) -> Result<Option<u64>, CacheError> {
        let full = self.full_key(key);
        let Some(entry) = self.read_entry_degrading(&full).await? else {
            return Ok(None);
        };
        if entry.is_expired(OffsetDateTime::now_utc()) {
            return Ok(None);
        }
        if !entry.is_raw() {
            return Err(CacheError::type_mismatch(full.as_str()));
        }
        std::str::from_utf8(entry.payload())
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| CacheError::type_mismatch(full.as_str()))
    }

    // ========================================================================
    // Fetch
    // ========================================================================

    /// Read-through fetch with this handle's default options.
    pub async fn fetch<T, F, Fut>(&self, key: &CacheKey, producer: F) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ProducerError>> + Send + 'static,
    {
        self.fetch_with(key, &self.defaults, producer).await
    }

    /// Read-through fetch. A fresh entry is returned as-is. An entry
    /// expired inside `race_condition_ttl` is served stale to every caller
    /// while at most one regeneration runs in the background under a
    /// lease. Anything else is produced once across concurrent callers:
    /// the lease winner runs `producer` inline and stores the result,
    /// losers wait for that write and return the same value.
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn fetch_with<T, F, Fut>(
        &self,
        key: &CacheKey,
        options: &WriteOptions,
        producer: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ProducerError>> + Send + 'static,
    {
        let backend = self.store.backend_name();
        let full = self.full_key(key);
        let found = self.read_entry_degrading(&full).await?;
        let now = OffsetDateTime::now_utc();
        let race_ttl = options.race_ttl();

        if let Some(entry) = found
            && entry.matches_version(options.version.as_deref())
        {
            match entry.state(race_ttl, now) {
                EntryState::Fresh => {
                    if let Some(value) = self.decode_read(&full, &entry)? {
                        metrics::counter!(HIT_TOTAL, "backend" => backend).increment(1);
                        return Ok(value);
                    }
                }
                EntryState::ExpiredInGrace => {
                    if let Some(stale) = self.decode_read::<T>(&full, &entry)? {
                        self.regenerate_in_background(&full, options, producer).await;
                        metrics::counter!(STALE_SERVED_TOTAL, "backend" => backend).increment(1);
                        return Ok(stale);
                    }
                }
                EntryState::Expired => {}
            }
        }

        metrics::counter!(MISS_TOTAL, "backend" => backend).increment(1);
        let lease_ttl = StampedeGuard::lease_ttl(race_ttl);
        loop {
            let Some(token) = self.store.try_acquire_lease(&full, lease_ttl).await? else {
                // Another caller holds the lease and is producing this key.
                // Wait for its write instead of stacking a second producer.
                tokio::time::sleep(LEASE_WAIT_INTERVAL).await;
                if let Some(value) = self.usable_value(&full, options).await? {
                    return Ok(value);
                }
                continue;
            };

            // The previous holder may have written between our read and
            // this grant; adopt that entry instead of producing again.
            if let Some(value) = self.usable_value(&full, options).await? {
                release_quietly(&self.store, &full, token).await;
                return Ok(value);
            }

            let started = Instant::now();
            let produced = producer().await;
            metrics::histogram!(PRODUCER_MS, "mode" => "foreground")
                .record(started.elapsed().as_secs_f64() * 1000.0);

            let outcome = match produced {
                Ok(value) => match build_entry(&value, options, OffsetDateTime::now_utc()) {
                    Ok(entry) => self
                        .store
                        .write_entry(&full, entry, options)
                        .await
                        .map(|_| value),
                    Err(err) => Err(err),
                },
                Err(err) => Err(CacheError::Producer(err)),
            };
            release_quietly(&self.store, &full, token).await;
            return outcome;
        }
    }

    /// Batched read-through fetch. Missing keys are produced inline, one at
    /// a time, and written back; neither the stale-serving nor the
    /// single-flight machinery applies here. Results come back in the order
    /// of `keys`.
    pub async fn fetch_multi<T, F, Fut>(
        &self,
        keys: &[CacheKey],
        producer: F,
    ) -> Result<Vec<(CacheKey, T)>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&CacheKey) -> Fut,
        Fut: Future<Output = Result<T, ProducerError>>,
    {
        self.fetch_multi_with(keys, &self.defaults, producer).await
    }

    #[tracing::instrument(skip_all, fields(keys = keys.len()))]
    pub async fn fetch_multi_with<T, F, Fut>(
        &self,
        keys: &[CacheKey],
        options: &WriteOptions,
        mut producer: F,
    ) -> Result<Vec<(CacheKey, T)>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&CacheKey) -> Fut,
        Fut: Future<Output = Result<T, ProducerError>>,
    {
        let backend = self.store.backend_name();
        let full_keys: Vec<CacheKey> = keys.iter().map(|key| self.full_key(key)).collect();
        let entries = self.read_entries_degrading(&full_keys).await?;
        let now = OffsetDateTime::now_utc();

        let mut out = Vec::with_capacity(keys.len());
        for ((key, full), entry) in keys.iter().zip(&full_keys).zip(entries) {
            let cached = match entry {
                Some(entry)
                    if entry.matches_version(options.version.as_deref())
                        && entry.state(options.race_ttl(), now) == EntryState::Fresh =>
                {
                    self.decode_read(full, &entry)?
                }
                _ => None,
            };
            match cached {
                Some(value) => {
                    metrics::counter!(HIT_TOTAL, "backend" => backend).increment(1);
                    out.push((key.clone(), value));
                }
                None => {
                    metrics::counter!(MISS_TOTAL, "backend" => backend).increment(1);
                    let value = producer(key).await.map_err(CacheError::Producer)?;
                    let entry = build_entry(&value, options, now)?;
                    self.store.write_entry(full, entry, options).await?;
                    out.push((key.clone(), value));
                }
            }
        }
        Ok(out)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Kick off background regeneration if the lease for `full` is free.
    /// Never blocks the stale response; lease errors only cost us the
    /// regeneration, not the read.
    async fn regenerate_in_background<T, F, Fut>(
        &self,
        full: &CacheKey,
        options: &WriteOptions,
        producer: F,
    ) where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ProducerError>> + Send + 'static,
    {
        let backend = self.store.backend_name();
        let lease_ttl = StampedeGuard::lease_ttl(options.race_ttl());
        let token = match self.store.try_acquire_lease(full, lease_ttl).await {
            Ok(Some(token)) => token,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(
                    key = %full,
                    error = %err,
                    "lease acquisition failed, serving stale without regeneration"
                );
                return;
            }
        };

        metrics::counter!(REGENERATE_TOTAL, "backend" => backend).increment(1);
        let store = Arc::clone(&self.store);
        let options = options.clone();
        let full = full.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let produced = producer().await;
            metrics::histogram!(PRODUCER_MS, "mode" => "background")
                .record(started.elapsed().as_secs_f64() * 1000.0);

            match produced {
                Ok(value) => match build_entry(&value, &options, OffsetDateTime::now_utc()) {
                    Ok(entry) => {
                        if let Err(err) = store.write_entry(&full, entry, &options).await {
                            tracing::warn!(
                                key = %full,
                                error = %err,
                                "background regeneration write failed"
                            );
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            key = %full,
                            error = %err,
                            "background regeneration encode failed"
                        );
                    }
                },
                // The stale entry stays readable; the lease lapses and the
                // next grace-window caller retries.
                Err(err) => {
                    tracing::warn!(
                        key = %full,
                        error = %err,
                        "background regeneration producer failed"
                    );
                }
            }
            release_quietly(&store, &full, token).await;
        });
    }

    async fn read_entry_degrading(
        &self,
        full: &CacheKey,
    ) -> Result<Option<CacheEntry>, CacheError> {
        match self.store.read_entry(full).await {
            Ok(found) => Ok(found),
            Err(err) if err.degrades_to_miss() => {
                self.note_read_error(full, &err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// The decoded live entry for `full` satisfying `options`' version
    /// expectation, if the store holds one right now.
    async fn usable_value<T: DeserializeOwned>(
        &self,
        full: &CacheKey,
        options: &WriteOptions,
    ) -> Result<Option<T>, CacheError> {
        if let Some(entry) = self.read_entry_degrading(full).await?
            && !entry.is_expired(OffsetDateTime::now_utc())
            && entry.matches_version(options.version.as_deref())
        {
            return self.decode_read(full, &entry);
        }
        Ok(None)
    }

    async fn read_entries_degrading(
        &self,
        full_keys: &[CacheKey],
    ) -> Result<Vec<Option<CacheEntry>>, CacheError> {
        match self.store.read_entries(full_keys).await {
            Ok(entries) => Ok(entries),
            Err(err) if err.degrades_to_miss() => {
                metrics::counter!(READ_ERROR_TOTAL, "backend" => self.store.backend_name())
                    .increment(1);
                tracing::warn!(
                    keys = full_keys.len(),
                    error = %err,
                    "cache multi-read failed, degrading to misses"
                );
                Ok(vec![None; full_keys.len()])
            }
            Err(err) => Err(err),
        }
    }

    /// Decode an entry, degrading undecodable payloads to `None`.
    fn decode_read<T: DeserializeOwned>(
        &self,
        full: &CacheKey,
        entry: &CacheEntry,
    ) -> Result<Option<T>, CacheError> {
        match decode_entry(full, entry) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.degrades_to_miss() => {
                self.note_read_error(full, &err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn note_read_error(&self, full: &CacheKey, err: &CacheError) {
        metrics::counter!(READ_ERROR_TOTAL, "backend" => self.store.backend_name()).increment(1);
        tracing::warn!(key = %full, error = %err, "cache read failed, degrading to miss");
    }
}

/// Release `token`, logging instead of failing; a stuck lease only costs
/// later callers the lease timeout.
async fn release_quietly(store: &DynStore, full: &CacheKey, token: LeaseToken) {
    if let Err(err) = store.release_lease(full, token).await {
        tracing::debug!(key = %full, error = %err, "lease release failed");
    }
}

/// Serialize, optionally compress, and wrap `value` into an entry.
fn build_entry<T: Serialize>(
    value: &T,
    options: &WriteOptions,
    now: OffsetDateTime,
) -> Result<CacheEntry, CacheError> {
    let payload = serde_json::to_vec(value)
        .map(bytes::Bytes::from)
        .map_err(|err| CacheError::serialization(format!("encode failed: {err}")))?;
    let expires_at = resolve_expiry(options.expires_in, options.expires_at, now);
    let mut entry = CacheEntry::new(payload, expires_at, options.version.clone());
    if options.compress {
        let (stored, compressed) =
            compress_payload(entry.payload().clone(), options.compress_threshold)?;
        if compressed {
            entry.mark_compressed(stored);
        }
    }
    Ok(entry)
}

fn decode_entry<T: DeserializeOwned>(
    full: &CacheKey,
    entry: &CacheEntry,
) -> Result<T, CacheError> {
    let payload = if entry.is_compressed() {
        decompress_payload(entry.payload())?
    } else {
        entry.payload().clone()
    };
    serde_json::from_slice(&payload).map_err(|err| {
        CacheError::serialization(format!("decode for `{full}` failed: {err}"))
    })
}
